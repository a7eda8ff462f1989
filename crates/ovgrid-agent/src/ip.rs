//! `ip` wrapper for link state and IPv4 addresses.

use std::sync::Arc;

use ovgrid_state::Ipv4Cidr;

use crate::error::AgentResult;
use crate::exec::{CommandRunner, args};

const PROGRAM: &str = "ip";

#[derive(Clone)]
pub struct Ip {
    runner: Arc<dyn CommandRunner>,
}

impl Ip {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn link_up(&self, dev: &str) -> AgentResult<()> {
        self.runner
            .run(PROGRAM, &args(&["link", "set", dev, "up"]))
            .await
            .map(drop)
    }

    pub async fn set_address(&self, dev: &str, cidr: &Ipv4Cidr) -> AgentResult<()> {
        let cidr = cidr.to_string();
        self.runner
            .run(PROGRAM, &args(&["addr", "replace", &cidr, "dev", dev]))
            .await
            .map(drop)
    }

    /// First IPv4 address on `dev`, if any.
    pub async fn address(&self, dev: &str) -> AgentResult<Option<Ipv4Cidr>> {
        let out = self
            .runner
            .run(PROGRAM, &args(&["-4", "-o", "addr", "show", "dev", dev]))
            .await?;
        Ok(parse_inet(&out))
    }
}

/// Pick the first `inet <cidr>` out of `ip -4 -o addr show` output.
pub fn parse_inet(out: &str) -> Option<Ipv4Cidr> {
    out.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| *w == "inet")?;
        words.next()?.parse().ok()
    })
}
