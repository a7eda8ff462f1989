//! ovgridd: the ovgrid daemon.
//!
//! One binary, two roles:
//! - `manage`: control-plane REST API over the coordination store, the
//!   container engine and the SDN controller
//! - `agent`: per-node gateway registration and OVS reconciliation
//!
//! # Usage
//!
//! ```text
//! ovgridd manage --listen 0.0.0.0:3380 etcd://10.0.0.5:2379
//! ovgridd agent --iface eth1:10.0.0.11 etcd://10.0.0.5:2379
//! ```

mod agent_mode;
mod manage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ovgridd", about = "ovgrid overlay network daemon")]
struct Cli {
    /// Default to debug logging when RUST_LOG is unset.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

/// Flags shared by both roles for reaching the coordination store.
#[derive(Args, Debug, Clone)]
struct DiscoveryArgs {
    /// Discovery URI, e.g. `etcd://10.0.0.5:2379/ovgrid` or `redb:///var/lib/ovgrid.redb`.
    #[arg(env = "OVGRID_DISCOVERY")]
    discovery: String,

    /// Backend option as `key=value` (kv.path, kv.cacertfile, kv.certfile, kv.keyfile).
    #[arg(long = "discovery-opt", value_parser = parse_discovery_opt)]
    discovery_opts: Vec<(String, String)>,

    /// Registration heartbeat period.
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    heartbeat: Duration,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control-plane API server.
    Manage {
        #[command(flatten)]
        discovery: DiscoveryArgs,

        /// Address the API listens on.
        #[arg(long, default_value = "0.0.0.0:3380")]
        listen: SocketAddr,

        /// Container engine (swarm) endpoint.
        #[arg(long, env = "DOCKER_HOST", default_value = "tcp://127.0.0.1:2375")]
        swarm: String,

        /// SDN controller endpoint.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        ofc: String,

        /// CA bundle for TLS to the engine and the controller.
        #[arg(long)]
        tlscacert: Option<PathBuf>,

        /// Client certificate for mutual TLS.
        #[arg(long, requires = "tlscacert")]
        tlscert: Option<PathBuf>,

        /// Private key for `--tlscert`.
        #[arg(long, requires = "tlscert")]
        tlskey: Option<PathBuf>,
    },

    /// Run the node agent.
    Agent {
        #[command(flatten)]
        discovery: DiscoveryArgs,

        /// Internal interface as `devname:ip`.
        #[arg(long, value_parser = parse_iface)]
        iface: (String, String),

        /// Node address advertised in the gateway record. Defaults to the iface IP.
        #[arg(long)]
        addr: Option<String>,

        /// OVS bridge carrying the overlay ports.
        #[arg(long, default_value = "ovgrid")]
        bridge: String,

        /// Requested registration TTL; must exceed the heartbeat.
        #[arg(long, default_value = "180s", value_parser = parse_duration)]
        ttl: Duration,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "debug"
    } else {
        "info,ovgridd=debug,ovgrid=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Command::Manage {
            discovery,
            listen,
            swarm,
            ofc,
            tlscacert,
            tlscert,
            tlskey,
        } => {
            let tls = tlscacert.map(|ca| ovgrid_client::TlsOptions {
                ca_file: ca,
                cert_file: tlscert,
                key_file: tlskey,
            });
            manage::run_manage(manage::ManageConfig {
                discovery: discovery.discovery,
                discovery_opts: discovery.discovery_opts,
                heartbeat: discovery.heartbeat,
                listen,
                swarm,
                ofc,
                tls,
            })
            .await
        }
        Command::Agent {
            discovery,
            iface,
            addr,
            bridge,
            ttl,
        } => {
            agent_mode::run_agent(agent_mode::AgentArgs {
                discovery: discovery.discovery,
                discovery_opts: discovery.discovery_opts,
                heartbeat: discovery.heartbeat,
                iface,
                addr,
                bridge,
                ttl,
            })
            .await
        }
    }
}

/// Parse `60s`, `500ms`, `2m`, `1h`. A bare number is seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => scaled_secs(value, 60, s),
        "h" => scaled_secs(value, 3600, s),
        other => Err(format!("unknown duration unit '{other}' in '{s}'")),
    }
}

fn scaled_secs(value: u64, factor: u64, input: &str) -> Result<Duration, String> {
    value
        .checked_mul(factor)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{input}' is out of range"))
}

fn parse_discovery_opt(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(format!("discovery option '{s}' should be key=value")),
    }
}

fn parse_iface(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((dev, ip)) if !dev.is_empty() && !ip.is_empty() => {
            Ok((dev.to_string(), ip.to_string()))
        }
        _ => Err("--iface should be of the form devname:ip".to_string()),
    }
}

/// The kernel's host name, then `HOSTNAME`, then "localhost".
fn hostname() -> String {
    kernel_hostname()
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

fn kernel_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is writable for its full length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(parse_duration("1x").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let huge = format!("{}h", u64::MAX / 60);
        assert!(parse_duration(&huge).unwrap_err().contains("out of range"));
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn hostname_matches_kernel() {
        let kernel = kernel_hostname().expect("gethostname");
        assert!(!kernel.is_empty());
        assert_eq!(hostname(), kernel);
    }

    #[test]
    fn discovery_opts() {
        assert_eq!(
            parse_discovery_opt("kv.path=ovgrid/gw").unwrap(),
            ("kv.path".to_string(), "ovgrid/gw".to_string())
        );
        assert!(parse_discovery_opt("kv.path").is_err());
        assert!(parse_discovery_opt("=x").is_err());
    }

    #[test]
    fn iface() {
        assert_eq!(
            parse_iface("eth1:10.0.0.11").unwrap(),
            ("eth1".to_string(), "10.0.0.11".to_string())
        );
        assert!(parse_iface("eth1").is_err());
        assert!(parse_iface(":10.0.0.11").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn agent_defaults() {
        let cli = Cli::try_parse_from([
            "ovgridd",
            "agent",
            "--iface",
            "eth1:10.0.0.11",
            "--discovery-opt",
            "kv.path=gw",
            "memory://",
        ])
        .unwrap();
        match cli.command {
            Command::Agent {
                discovery,
                bridge,
                ttl,
                ..
            } => {
                assert_eq!(bridge, "ovgrid");
                assert_eq!(ttl, Duration::from_secs(180));
                assert_eq!(discovery.heartbeat, Duration::from_secs(60));
                assert_eq!(discovery.discovery_opts.len(), 1);
            }
            Command::Manage { .. } => panic!("expected agent"),
        }
    }
}
