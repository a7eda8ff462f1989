//! `ovs-vsctl` wrapper for one bridge.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{AgentError, AgentResult};
use crate::exec::CommandRunner;

const PROGRAM: &str = "ovs-vsctl";
const TIMEOUT_SECS: u32 = 5;

#[derive(Clone)]
pub struct Ovs {
    runner: Arc<dyn CommandRunner>,
    bridge: String,
}

impl Ovs {
    pub fn new(runner: Arc<dyn CommandRunner>, bridge: impl Into<String>) -> Self {
        Self {
            runner,
            bridge: bridge.into(),
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    async fn vsctl(&self, cmd: &[&str]) -> AgentResult<String> {
        let mut args = vec![
            format!("--timeout={TIMEOUT_SECS}"),
            "--format=json".to_string(),
            "--no-heading".to_string(),
            "--".to_string(),
        ];
        args.extend(cmd.iter().map(|s| s.to_string()));
        self.runner.run(PROGRAM, &args).await
    }

    /// Replace `dev` with a fresh internal port on the bridge.
    pub async fn create_port(&self, dev: &str) -> AgentResult<()> {
        self.vsctl(&[
            "--if-exists", "del-port", dev, "--", "add-port", &self.bridge, dev, "--", "set",
            "Interface", dev, "type=internal",
        ])
        .await?;
        debug!(bridge = %self.bridge, %dev, "internal port created");
        Ok(())
    }

    pub async fn delete_port(&self, dev: &str) -> AgentResult<()> {
        self.vsctl(&["--if-exists", "del-port", &self.bridge, dev]).await?;
        debug!(bridge = %self.bridge, %dev, "internal port deleted");
        Ok(())
    }

    pub async fn datapath_id(&self) -> AgentResult<String> {
        let out = self
            .vsctl(&["get", "bridge", &self.bridge, "datapath_id"])
            .await?;
        let id = out.trim().trim_matches('"').to_string();
        if id.is_empty() {
            return Err(AgentError::Output {
                program: PROGRAM.into(),
                detail: format!("empty datapath_id for bridge {}", self.bridge),
            });
        }
        Ok(id)
    }

    /// Names of every internal interface known to OVS.
    pub async fn internal_ports(&self) -> AgentResult<Vec<String>> {
        let out = self
            .vsctl(&["--columns=name", "find", "interface", "type=internal"])
            .await?;
        parse_names(&out)
    }
}

/// Extract the first column of each row from `--format=json` table output.
/// Rows whose first cell is not a string are skipped.
pub fn parse_names(out: &str) -> AgentResult<Vec<String>> {
    let out = out.trim();
    if out.is_empty() {
        return Ok(Vec::new());
    }
    let table: Value = serde_json::from_str(out).map_err(|e| AgentError::Output {
        program: PROGRAM.into(),
        detail: e.to_string(),
    })?;
    let Some(rows) = table.get("data").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    Ok(rows
        .iter()
        .filter_map(|row| row.get(0)?.as_str().map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    #[test]
    fn parses_rows_tolerantly() {
        let out = r#"{"data":[["tap0123456789a"],["br-ov"],[42],[],"junk"],"headings":["name"]}"#;
        assert_eq!(parse_names(out).unwrap(), vec!["tap0123456789a", "br-ov"]);
        assert!(parse_names("").unwrap().is_empty());
        assert!(parse_names("{}").unwrap().is_empty());
        assert!(parse_names("not json").is_err());
    }

    #[tokio::test]
    async fn command_grammar() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ovs-vsctl", "\"0000aabbccddeeff\"\n");
        let ovs = Ovs::new(runner.clone(), "br-ov");

        assert_eq!(ovs.datapath_id().await.unwrap(), "0000aabbccddeeff");
        ovs.create_port("tapX").await.unwrap();
        ovs.delete_port("tapX").await.unwrap();

        let calls = runner.calls();
        let prefix = "ovs-vsctl --timeout=5 --format=json --no-heading --";
        assert_eq!(calls[0], format!("{prefix} get bridge br-ov datapath_id"));
        assert_eq!(
            calls[1],
            format!(
                "{prefix} --if-exists del-port tapX -- add-port br-ov tapX -- set Interface tapX type=internal"
            )
        );
        assert_eq!(calls[2], format!("{prefix} --if-exists del-port br-ov tapX"));
    }
}
