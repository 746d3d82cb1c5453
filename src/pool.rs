//! Address pool and allocation.
//!
//! The pool is a CIDR block minus a fixed set of excluded addresses. The
//! set of assigned addresses is not stored here: it is derived from the
//! lease table and passed in on every call, so an address only counts as
//! taken once its lease has been persisted.

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// The allocation domain: `network - excluded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    network: Ipv4Net,
    excluded: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// Creates a pool over `network` with the given addresses carved out.
    ///
    /// Excluded addresses outside the network have no effect.
    pub fn new(network: Ipv4Net, excluded: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            network: network.trunc(),
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn excluded(&self) -> &BTreeSet<Ipv4Addr> {
        &self.excluded
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.network.contains(&address)
    }

    pub fn is_excluded(&self, address: Ipv4Addr) -> bool {
        self.excluded.contains(&address)
    }

    /// Total number of addresses in the network, exclusions included.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.last())) - u64::from(u32::from(self.first())) + 1
    }

    /// Returns the numerically smallest address that is in the network and
    /// neither excluded nor in `assigned`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no such address exists.
    pub fn reserve_next(&self, assigned: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        self.available(assigned).next().ok_or(Error::PoolExhausted)
    }

    /// Number of addresses still available given `assigned`.
    pub fn available_count(&self, assigned: &HashSet<Ipv4Addr>) -> u64 {
        self.available(assigned).count() as u64
    }

    /// Iterates available addresses in ascending order.
    fn available<'a>(
        &'a self,
        assigned: &'a HashSet<Ipv4Addr>,
    ) -> impl Iterator<Item = Ipv4Addr> + 'a {
        (u32::from(self.first())..=u32::from(self.last()))
            .map(Ipv4Addr::from)
            .filter(move |address| {
                !self.excluded.contains(address) && !assigned.contains(address)
            })
    }

    fn first(&self) -> Ipv4Addr {
        self.network.network()
    }

    fn last(&self) -> Ipv4Addr {
        self.network.broadcast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_24() -> AddressPool {
        AddressPool::new(
            "10.0.0.0/24".parse().unwrap(),
            [Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 255)],
        )
    }

    #[test]
    fn test_reserve_next_skips_excluded() {
        let pool = pool_24();
        let ip = pool.reserve_next(&HashSet::new()).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_reserve_next_is_ascending() {
        let pool = pool_24();
        let mut assigned = HashSet::new();
        for expected in 1..=5u8 {
            let ip = pool.reserve_next(&assigned).unwrap();
            assert_eq!(ip, Ipv4Addr::new(10, 0, 0, expected));
            assigned.insert(ip);
        }
    }

    #[test]
    fn test_reserve_next_fills_gaps() {
        let pool = pool_24();
        let assigned: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3)]
            .into_iter()
            .collect();
        assert_eq!(
            pool.reserve_next(&assigned).unwrap(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = AddressPool::new(
            "192.168.7.0/30".parse().unwrap(),
            [Ipv4Addr::new(192, 168, 7, 0), Ipv4Addr::new(192, 168, 7, 3)],
        );
        let mut assigned = HashSet::new();
        assigned.insert(pool.reserve_next(&assigned).unwrap());
        assigned.insert(pool.reserve_next(&assigned).unwrap());

        assert_eq!(pool.available_count(&assigned), 0);
        assert!(matches!(
            pool.reserve_next(&assigned),
            Err(Error::PoolExhausted)
        ));
    }

    #[test]
    fn test_excluded_never_returned() {
        let excluded: Vec<_> = (0..=255u8)
            .filter(|octet| octet % 2 == 0)
            .map(|octet| Ipv4Addr::new(10, 0, 0, octet))
            .collect();
        let pool = AddressPool::new("10.0.0.0/24".parse().unwrap(), excluded.clone());

        let mut assigned = HashSet::new();
        while let Ok(ip) = pool.reserve_next(&assigned) {
            assert!(!excluded.contains(&ip));
            assigned.insert(ip);
        }
        assert_eq!(assigned.len(), 128);
    }

    #[test]
    fn test_host_bits_are_truncated() {
        let pool = AddressPool::new("10.0.0.77/24".parse().unwrap(), []);
        assert_eq!(pool.network(), "10.0.0.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(pool.size(), 256);
        assert!(pool.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!pool.contains(Ipv4Addr::new(10, 0, 1, 0)));
    }

    #[test]
    fn test_size_counts_whole_network() {
        let pool = AddressPool::new("0.0.0.0/0".parse().unwrap(), []);
        assert_eq!(pool.size(), 1 << 32);

        let pool = AddressPool::new(
            "10.9.0.0/30".parse().unwrap(),
            [Ipv4Addr::new(10, 9, 0, 0)],
        );
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn test_single_address_network() {
        let pool = AddressPool::new("172.16.0.9/32".parse().unwrap(), []);
        assert_eq!(pool.size(), 1);
        assert_eq!(
            pool.reserve_next(&HashSet::new()).unwrap(),
            Ipv4Addr::new(172, 16, 0, 9)
        );
    }
}
