//! nftables backend implementation.
//!
//! A private `ip` table holds a set of denied addresses and an input chain
//! that rejects anything whose source is in the set. Deny and allow only
//! touch set elements.

use std::net::Ipv4Addr;

use super::{FirewallBackend, RuleCommand};

const PROGRAM: &str = "nft";
const FAMILY: &str = "ip";
const SET_NAME: &str = "denied";
const CHAIN_NAME: &str = "input";

pub const DEFAULT_TABLE: &str = "banwatch";

/// nftables backend
#[derive(Debug, Clone)]
pub struct NftablesBackend {
    table: String,
}

impl NftablesBackend {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }

    fn cmd(&self, args: &[&str]) -> RuleCommand {
        RuleCommand::new(PROGRAM, args)
    }

    fn element(&self, op: &str, address: Ipv4Addr) -> RuleCommand {
        let addr = address.to_string();
        self.cmd(&[op, "element", FAMILY, &self.table, SET_NAME, "{", &addr, "}"])
    }
}

impl Default for NftablesBackend {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE)
    }
}

impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn setup(&self) -> Vec<RuleCommand> {
        let t = self.table.as_str();
        vec![
            // Leftover table from an unclean shutdown; absent on a clean host
            self.cmd(&["delete", "table", FAMILY, t]).tolerated(),
            self.cmd(&["add", "table", FAMILY, t]),
            self.cmd(&[
                "add", "set", FAMILY, t, SET_NAME, "{", "type", "ipv4_addr", ";", "}",
            ]),
            self.cmd(&[
                "add", "chain", FAMILY, t, CHAIN_NAME, "{", "type", "filter", "hook", "input",
                "priority", "-1", ";", "policy", "accept", ";", "}",
            ]),
            self.cmd(&[
                "add", "rule", FAMILY, t, CHAIN_NAME, "ip", "saddr", "@denied", "counter",
                "reject",
            ]),
        ]
    }

    fn deny(&self, address: Ipv4Addr) -> Vec<RuleCommand> {
        vec![self.element("add", address)]
    }

    fn allow(&self, address: Ipv4Addr) -> Vec<RuleCommand> {
        vec![self.element("delete", address)]
    }

    fn teardown(&self) -> Vec<RuleCommand> {
        let t = self.table.as_str();
        vec![
            self.cmd(&["flush", "chain", FAMILY, t, CHAIN_NAME]).tolerated(),
            self.cmd(&["delete", "chain", FAMILY, t, CHAIN_NAME]),
            self.cmd(&["delete", "table", FAMILY, t]),
        ]
    }
}
