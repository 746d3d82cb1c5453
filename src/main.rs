use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerlease::client::{self, LookupOptions};
use peerlease::{Config, LeaseServer, Leases, Result};

#[derive(Parser)]
#[command(name = "peerlease")]
#[command(author, version, about = "Stable WireGuard mesh addresses over DNS", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListLeases,
    /// Set the WireGuard keys of an existing lease
    SetKeys {
        hostname: String,

        #[arg(long)]
        public_key: Option<String>,

        #[arg(long)]
        preshared_key: Option<String>,
    },
    /// Ask a lease server for this host's address and write it to the
    /// systemd-networkd files
    Lookup {
        server: String,

        #[arg(short, long, default_value_t = client::DEFAULT_PORT)]
        port: u16,

        /// Lease key; defaults to the system hostname
        #[arg(long, env = "HOSTNAME")]
        hostname: Option<String>,

        #[arg(short, long, default_value = client::DEFAULT_INTERFACE)]
        interface: String,

        #[arg(long)]
        network_file: Option<PathBuf>,

        #[arg(long)]
        peer_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = Config::load_or_create(&cli.config)?;
            info!("Starting lease server with config: {:?}", cli.config);
            let server = LeaseServer::new(config).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            let config = Config::load_or_create(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let config = Config::load_or_create(&cli.config)?;
            let store = Leases::load(&config.peers_dir, config.pool()?).await?;
            let leases = store.list_leases().await;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<32} {:<16} {:<10} {:<10}",
                    "Hostname", "IP Address", "PublicKey", "PSK"
                );
                println!("{}", "-".repeat(70));

                for lease in leases {
                    println!(
                        "{:<32} {:<16} {:<10} {:<10}",
                        lease.hostname,
                        lease.address,
                        if lease.public_key.is_some() { "set" } else { "-" },
                        if lease.preshared_key.is_some() { "set" } else { "-" },
                    );
                }
            }

            let skipped = store.skipped_records();
            if !skipped.is_empty() {
                println!();
                println!("Skipped {} record(s):", skipped.len());
                for record in skipped {
                    println!("  {}: {}", record.path.display(), record.reason);
                }
            }

            Ok(())
        }
        Commands::SetKeys {
            hostname,
            public_key,
            preshared_key,
        } => {
            let config = Config::load_or_create(&cli.config)?;
            let store = Leases::load(&config.peers_dir, config.pool()?).await?;

            let mut lease = store
                .lookup(&hostname)
                .await
                .ok_or_else(|| peerlease::Error::LeaseNotFound(hostname.clone()))?;
            if public_key.is_some() {
                lease.public_key = public_key;
            }
            if preshared_key.is_some() {
                lease.preshared_key = preshared_key;
            }
            store.save(&lease).await?;

            println!("Updated keys for {} ({}).", lease.hostname, lease.address);
            Ok(())
        }
        Commands::Lookup {
            server,
            port,
            hostname,
            interface,
            network_file,
            peer_file,
        } => {
            let hostname = match hostname {
                Some(hostname) => hostname,
                None => client::system_hostname()?,
            };
            let options = LookupOptions {
                server,
                port,
                hostname,
                interface,
                network_file,
                peer_file,
            };
            let address = client::lookup_and_configure(&options).await?;
            println!("{}", address);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_without_hostname_flag() {
        let cli = Cli::try_parse_from(["peerlease", "lookup", "10.0.0.254"]).unwrap();

        match cli.command {
            Some(Commands::Lookup {
                server,
                port,
                hostname,
                interface,
                network_file,
                peer_file,
            }) => {
                assert_eq!(server, "10.0.0.254");
                assert_eq!(port, client::DEFAULT_PORT);
                assert_eq!(
                    hostname,
                    std::env::var("HOSTNAME").ok().filter(|value| !value.is_empty())
                );
                assert_eq!(interface, client::DEFAULT_INTERFACE);
                assert!(network_file.is_none());
                assert!(peer_file.is_none());
            }
            _ => panic!("Expected lookup command"),
        }
    }

    #[test]
    fn test_lookup_hostname_flag() {
        let cli = Cli::try_parse_from([
            "peerlease",
            "lookup",
            "lease.example",
            "--hostname",
            "alice",
            "--port",
            "5353",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Lookup { hostname, port, .. }) => {
                assert_eq!(hostname.as_deref(), Some("alice"));
                assert_eq!(port, 5353);
            }
            _ => panic!("Expected lookup command"),
        }
    }
}
