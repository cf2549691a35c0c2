//! Ignore-list checks.
//!
//! Entries are exact IPv4 addresses or CIDR ranges. Range checks compare
//! `address & mask` with `network & mask` on the 32-bit integer forms.

use std::net::Ipv4Addr;

use crate::error::BanwatchError;
use crate::validation::validate_ipv4_or_cidr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Exact(Ipv4Addr),
    Range { network: u32, mask: u32 },
}

impl Entry {
    fn covers(&self, address: Ipv4Addr) -> bool {
        match *self {
            Entry::Exact(a) => a == address,
            Entry::Range { network, mask } => u32::from(address) & mask == network & mask,
        }
    }
}

/// Prefix length to netmask. `/0` is the all-zero mask.
fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

/// Parsed ignore list for one source.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    entries: Vec<Entry>,
}

impl IgnoreList {
    /// Parse every entry; the first invalid one is reported as a config error.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, BanwatchError> {
        let mut parsed = Vec::with_capacity(entries.len());
        for raw in entries {
            let raw = raw.as_ref().trim();
            let net = validate_ipv4_or_cidr(raw)
                .map_err(|e| BanwatchError::Config(format!("ignore entry: {}", e)))?;
            if raw.contains('/') {
                parsed.push(Entry::Range {
                    network: u32::from(net.network()),
                    mask: prefix_mask(net.prefix_len()),
                });
            } else {
                parsed.push(Entry::Exact(net.addr()));
            }
        }
        Ok(Self { entries: parsed })
    }

    pub fn is_ignored(&self, address: Ipv4Addr) -> bool {
        self.entries.iter().any(|e| e.covers(address))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One-shot check against raw entries. Invalid entries never match.
pub fn is_ignored<S: AsRef<str>>(address: Ipv4Addr, list: &[S]) -> bool {
    list.iter()
        .filter_map(|raw| IgnoreList::parse(std::slice::from_ref(raw)).ok())
        .any(|l| l.is_ignored(address))
}
