//! Longest-prefix-match table from inner IPs to owning peers.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// Maps IP prefixes to `D`, answering lookups by longest matching prefix.
///
/// The entry list is kept sorted by descending prefix length, so a lookup
/// returns at the first match. Insertion cost is linear, which reconfig
/// amortizes by skipping untouched peers.
pub struct AllowedIps<D> {
    entries: Vec<(IpNetwork, D)>,
}

impl<D> AllowedIps<D> {
    pub fn new() -> Self {
        AllowedIps {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, network: IpNetwork, data: D) {
        let pos = self
            .entries
            .partition_point(|(net, _)| net.prefix() >= network.prefix());
        self.entries.insert(pos, (network, data));
    }

    /// Find the data of the longest prefix containing `ip`.
    pub fn find(&self, ip: IpAddr) -> Option<&D> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, data)| data)
    }

    /// Remove every entry whose data matches `predicate`.
    pub fn remove(&mut self, predicate: impl Fn(&D) -> bool) {
        self.entries.retain(|(_, data)| !predicate(data));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpNetwork, &D)> {
        self.entries.iter().map(|(net, data)| (net, data))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<D> Default for AllowedIps<D> {
    fn default() -> Self {
        Self::new()
    }
}
