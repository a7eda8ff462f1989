//! NAT and forwarding rules for an overlay subnet.

use std::sync::Arc;

use ovgrid_state::Ipv4Cidr;
use tracing::warn;

use crate::error::AgentResult;
use crate::exec::{CommandRunner, args};

const PROGRAM: &str = "iptables";

#[derive(Clone)]
pub struct Iptables {
    runner: Arc<dyn CommandRunner>,
}

impl Iptables {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn nat(&self, action: &str, cidr: &str) -> AgentResult<()> {
        self.runner
            .run(
                PROGRAM,
                &args(&[
                    "-t", "nat", action, "POSTROUTING", "-s", cidr, "!", "-d", cidr, "-j",
                    "MASQUERADE",
                ]),
            )
            .await
            .map(drop)
    }

    async fn forward(&self, action: &str, direction: &str, cidr: &str) -> AgentResult<()> {
        self.runner
            .run(
                PROGRAM,
                &args(&[action, "FORWARD", direction, cidr, "-j", "ACCEPT"]),
            )
            .await
            .map(drop)
    }

    /// Masquerade outbound traffic and accept forwarding both ways.
    pub async fn add_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()> {
        let cidr = cidr.to_string();
        first_error([
            self.nat("-A", &cidr).await,
            self.forward("-I", "-s", &cidr).await,
            self.forward("-I", "-d", &cidr).await,
        ])
    }

    /// Remove the rules installed by [`Iptables::add_rules`].
    pub async fn drop_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()> {
        let cidr = cidr.to_string();
        first_error([
            self.nat("-D", &cidr).await,
            self.forward("-D", "-s", &cidr).await,
            self.forward("-D", "-d", &cidr).await,
        ])
    }
}

/// Every rule is attempted; the first failure is reported.
fn first_error<const N: usize>(results: [AgentResult<()>; N]) -> AgentResult<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            if first.is_some() {
                warn!(error = %e, "additional iptables failure");
            } else {
                first = Some(e);
            }
        }
    }
    first.map_or(Ok(()), Err)
}
