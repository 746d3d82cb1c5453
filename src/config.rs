use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;

use crate::error::{ConfigError, Result};
use crate::pool::AddressPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub network: String,
    pub excluded: Vec<Ipv4Addr>,
    pub peers_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 53,
            network: "10.0.0.0/24".to_string(),
            excluded: vec![Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 255)],
            peers_dir: PathBuf::from("peers"),
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks every field the server needs before it starts.
    ///
    /// A peers directory that does not exist yet is accepted; it is created
    /// when leases are loaded.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let network = self.network()?;
        self.listen_ip()?;

        if self.listen_port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        for &address in &self.excluded {
            if !network.contains(&address) {
                return Err(ConfigError::ExcludedOutsideNetwork {
                    address,
                    network: self.network.clone(),
                });
            }
        }

        if self.peers_dir.exists()
            && let Err(source) = std::fs::read_dir(&self.peers_dir)
        {
            return Err(ConfigError::UnreadableDirectory {
                path: self.peers_dir.clone(),
                source,
            });
        }

        Ok(())
    }

    pub fn network(&self) -> std::result::Result<Ipv4Net, ConfigError> {
        self.network
            .trim()
            .parse::<Ipv4Net>()
            .map_err(|_| ConfigError::InvalidCidr(self.network.clone()))
    }

    pub fn pool(&self) -> std::result::Result<AddressPool, ConfigError> {
        Ok(AddressPool::new(
            self.network()?,
            self.excluded.iter().copied(),
        ))
    }

    pub fn listen_addr(&self) -> std::result::Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.listen_ip()?, self.listen_port))
    }

    fn listen_ip(&self) -> std::result::Result<IpAddr, ConfigError> {
        self.listen_host
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidListenHost(self.listen_host.clone()))
    }
}
