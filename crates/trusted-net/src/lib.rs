//! Trusted network ranges exempt from rate limiting.
//!
//! Ranges are held in a prefix trie behind an `ArcSwap`, so a reload from
//! configuration never blocks lookups on the request path.

mod trie;

use std::io::BufRead;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use tracing::{info, warn};

pub use crate::trie::RangeTrie;

pub struct TrustedNetworks {
    ranges: ArcSwap<RangeTrie>,
}

impl TrustedNetworks {
    /// An empty set that trusts nothing.
    pub fn new() -> Self {
        Self {
            ranges: ArcSwap::from_pointee(RangeTrie::new()),
        }
    }

    /// Build from configuration entries. Every entry must be a CIDR range or
    /// a bare address.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> anyhow::Result<Self> {
        let mut trie = RangeTrie::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            let network = parse_entry(entry)
                .ok_or_else(|| anyhow::anyhow!("invalid trusted network '{}'", entry))?;
            trie.insert(network);
        }
        Ok(Self {
            ranges: ArcSwap::from_pointee(trie),
        })
    }

    /// Replace the current ranges with `entries` plus the contents of `path`.
    ///
    /// The file holds one range per line; blank lines and `#` comments are
    /// skipped and unparseable lines are logged and ignored. Returns the
    /// number of ranges now active.
    pub fn reload<S: AsRef<str>>(&self, entries: &[S], path: Option<&Path>) -> anyhow::Result<usize> {
        let mut trie = RangeTrie::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            match parse_entry(entry) {
                Some(network) => trie.insert(network),
                None => anyhow::bail!("invalid trusted network '{}'", entry),
            }
        }
        if let Some(path) = path {
            read_ranges(path, &mut trie)?;
        }

        let count = trie.len();
        self.ranges.store(Arc::new(trie));
        info!(count, "trusted networks loaded");
        Ok(count)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.ranges.load().contains(addr)
    }

    pub fn len(&self) -> usize {
        self.ranges.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TrustedNetworks {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a CIDR range, or a bare address as a host route.
fn parse_entry(entry: &str) -> Option<IpNet> {
    if let Ok(network) = entry.parse::<IpNet>() {
        return Some(network);
    }
    let addr = entry.parse::<IpAddr>().ok()?;
    let host_prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, host_prefix).ok()
}

fn read_ranges(path: &Path, trie: &mut RangeTrie) -> anyhow::Result<()> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;

    for (line_num, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_entry(trimmed) {
            Some(network) => trie.insert(network),
            None => warn!(
                path = %path.display(),
                line = line_num + 1,
                content = trimmed,
                "skipping unparseable trusted network"
            ),
        }
    }
    Ok(())
}
