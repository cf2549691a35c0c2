//! iptables backend implementation.
//!
//! One dedicated chain holds a REJECT rule per banned address; a single jump
//! from the link chain (INPUT by default) sends traffic through it.

use std::net::Ipv4Addr;

use super::{FirewallBackend, RuleCommand};

const PROGRAM: &str = "iptables";

pub const DEFAULT_CHAIN: &str = "banwatch";
pub const DEFAULT_LINK_CHAIN: &str = "INPUT";
pub const DEFAULT_REJECT_WITH: &str = "icmp-port-unreachable";

/// iptables backend
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    chain: String,
    link_chain: String,
    reject_with: String,
}

impl IptablesBackend {
    pub fn new(chain: &str, link_chain: &str, reject_with: &str) -> Self {
        Self {
            chain: chain.to_string(),
            link_chain: link_chain.to_string(),
            reject_with: reject_with.to_string(),
        }
    }

    fn cmd(&self, args: &[&str]) -> RuleCommand {
        RuleCommand::new(PROGRAM, args)
    }

    fn rule(&self, op: &str, address: Ipv4Addr) -> RuleCommand {
        let source = format!("{}/32", address);
        self.cmd(&[
            op,
            &self.chain,
            "-s",
            &source,
            "-j",
            "REJECT",
            "--reject-with",
            &self.reject_with,
        ])
    }
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new(DEFAULT_CHAIN, DEFAULT_LINK_CHAIN, DEFAULT_REJECT_WITH)
    }
}

impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn setup(&self) -> Vec<RuleCommand> {
        vec![
            // Chain may already exist from an unclean shutdown
            self.cmd(&["-N", &self.chain]).tolerated(),
            // Drop a stale jump so the insert below never duplicates it
            self.cmd(&["-D", &self.link_chain, "-j", &self.chain]).tolerated(),
            self.cmd(&["-I", &self.link_chain, "-j", &self.chain]),
            self.cmd(&["-F", &self.chain]),
        ]
    }

    fn deny(&self, address: Ipv4Addr) -> Vec<RuleCommand> {
        vec![self.rule("-I", address)]
    }

    fn allow(&self, address: Ipv4Addr) -> Vec<RuleCommand> {
        vec![self.rule("-D", address)]
    }

    fn teardown(&self) -> Vec<RuleCommand> {
        vec![
            self.cmd(&["-F", &self.chain]).tolerated(),
            self.cmd(&["-D", &self.link_chain, "-j", &self.chain]),
            self.cmd(&["-X", &self.chain]),
        ]
    }
}
