//! In-memory view of the records inside the managed block

use std::collections::BTreeMap;
use std::net::IpAddr;

/// Address to host names, in the order the names were added
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMap {
    by_address: BTreeMap<String, Vec<String>>,
}

impl HostMap {
    /// Parse hosts-file lines
    ///
    /// Every non-comment line yields one record per host name. Lines without a
    /// leading IP address or without any host name are returned unchanged in the
    /// second element.
    pub fn parse<S: AsRef<str>>(lines: &[S]) -> (Self, Vec<String>) {
        let mut map = HostMap::default();
        let mut bad_lines = Vec::new();

        for raw in lines {
            let raw = raw.as_ref();
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let address = tokens.next().unwrap_or_default();
            let names: Vec<&str> = tokens.collect();
            if names.is_empty() || address.parse::<IpAddr>().is_err() {
                bad_lines.push(raw.to_string());
                continue;
            }
            for name in names {
                map.add_record(address, name);
            }
        }

        (map, bad_lines)
    }

    /// Add one `(address, hostname)` record
    pub fn add_record(&mut self, address: &str, hostname: &str) {
        let names = self.by_address.entry(address.to_string()).or_default();
        if !names.iter().any(|n| n == hostname) {
            names.push(hostname.to_string());
        }
    }

    /// Replace every record of `hostname` with one record per address
    pub fn replace_records<S: AsRef<str>>(&mut self, hostname: &str, addresses: &[S]) {
        self.remove_host(hostname);
        for address in addresses {
            self.add_record(address.as_ref(), hostname);
        }
    }

    /// Drop every record of `hostname`
    pub fn remove_host(&mut self, hostname: &str) {
        for names in self.by_address.values_mut() {
            names.retain(|n| n != hostname);
        }
        self.by_address.retain(|_, names| !names.is_empty());
    }

    /// Addresses currently recorded for `hostname`
    pub fn addresses(&self, hostname: &str) -> Vec<&str> {
        self.by_address
            .iter()
            .filter(|(_, names)| names.iter().any(|n| n == hostname))
            .map(|(address, _)| address.as_str())
            .collect()
    }

    /// Remove all records
    pub fn clear(&mut self) {
        self.by_address.clear();
    }

    /// True if there are no records
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Serialize as sorted `address\thost1 host2...` lines
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .by_address
            .iter()
            .map(|(address, names)| format!("{}\t{}", address, names.join(" ")))
            .collect();
        lines.sort();
        lines
    }
}
