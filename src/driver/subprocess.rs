use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Driver, DriverContext, ExecOutcome};
use crate::plan::NodeSpec;

/// Most recent output lines kept per node for the `logs` capability.
const LOG_BUFFER_LINES: usize = 256;

/// Runs a node as a local child process.
///
/// The command comes from `params.cmd` (string) with optional
/// `params.args` (array of strings). Stdout is consumed line by line and
/// forwarded live as `log` events; exit code 0 maps to success, anything
/// else to a permanent failure. If the final stdout line parses as JSON it
/// is surfaced as the `result` output pin alongside `exit_code`.
pub struct SubprocessDriver {
    kill_switches: DashMap<(String, String), CancellationToken>,
    captured: DashMap<(String, String), VecDeque<String>>,
}

impl SubprocessDriver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kill_switches: DashMap::new(),
            captured: DashMap::new(),
        }
    }

    fn command(node: &NodeSpec) -> Option<Command> {
        let program = node.params.get("cmd").and_then(Value::as_str)?;
        let mut command = Command::new(program);
        if let Some(args) = node.params.get("args").and_then(Value::as_array) {
            command.args(args.iter().filter_map(Value::as_str));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Some(command)
    }

    fn capture_line(&self, key: &(String, String), line: &str) {
        let mut buffer = self.captured.entry(key.clone()).or_default();
        if buffer.len() == LOG_BUFFER_LINES {
            buffer.pop_front();
        }
        buffer.push_back(line.to_string());
    }
}

impl Default for SubprocessDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for SubprocessDriver {
    async fn execute(
        &self,
        ctx: DriverContext,
        node: &NodeSpec,
        _inputs: serde_json::Map<String, Value>,
    ) -> ExecOutcome {
        let Some(mut command) = Self::command(node) else {
            return ExecOutcome::permanent(format!("node {} declares no cmd param", node.id));
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return ExecOutcome::permanent(format!("failed to spawn command: {err}")),
        };

        let key = (ctx.run_id.clone(), ctx.node_id.clone());
        let kill = ctx.cancel.child_token();
        self.kill_switches.insert(key.clone(), kill.clone());
        self.captured.remove(&key);

        let stdout = child.stdout.take();
        let mut last_line: Option<String> = None;
        let mut canceled = false;

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = kill.cancelled() => {
                        canceled = true;
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            ctx.emit_log(&line);
                            self.capture_line(&key, &line);
                            last_line = Some(line);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            tracing::debug!(error = %err, "stdout read failed");
                            break;
                        }
                    }
                }
            }
        }

        let outcome = if canceled {
            let _ = child.start_kill();
            let _ = child.wait().await;
            ExecOutcome::Canceled
        } else {
            tokio::select! {
                _ = kill.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    ExecOutcome::Canceled
                }
                status = child.wait() => match status {
                    Ok(status) if status.success() => {
                        let mut outputs = serde_json::Map::new();
                        outputs.insert("exit_code".to_string(), Value::from(0));
                        if let Some(parsed) =
                            last_line.as_deref().and_then(|l| serde_json::from_str::<Value>(l).ok())
                        {
                            outputs.insert("result".to_string(), parsed);
                        }
                        ExecOutcome::success(outputs)
                    }
                    Ok(status) => ExecOutcome::permanent(format!(
                        "command exited with {}",
                        status.code().map_or_else(|| "signal".to_string(), |c| c.to_string())
                    )),
                    Err(err) => ExecOutcome::permanent(format!("wait failed: {err}")),
                }
            }
        };

        self.kill_switches.remove(&key);
        outcome
    }

    async fn abort(&self, run_id: &str, node_id: &str) {
        if let Some(switch) = self
            .kill_switches
            .get(&(run_id.to_string(), node_id.to_string()))
        {
            switch.cancel();
        }
    }

    async fn logs(&self, run_id: &str, node_id: &str, tail: Option<usize>) -> Vec<String> {
        let Some(buffer) = self
            .captured
            .get(&(run_id.to_string(), node_id.to_string()))
        else {
            return Vec::new();
        };
        let lines: Vec<String> = buffer.iter().cloned().collect();
        match tail {
            Some(tail) if tail < lines.len() => lines[lines.len() - tail..].to_vec(),
            _ => lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLog, RetentionPolicy};
    use crate::types::EventKind;
    use serde_json::json;

    fn ctx(events: &std::sync::Arc<EventLog>) -> DriverContext {
        DriverContext {
            run_id: "r".into(),
            node_id: "n".into(),
            attempt: 1,
            cancel: CancellationToken::new(),
            events: std::sync::Arc::clone(events),
        }
    }

    fn node(params: Value) -> NodeSpec {
        NodeSpec {
            id: "n".into(),
            agent_ref: None,
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn forwards_stdout_lines_and_reports_exit() {
        let events = EventLog::new(RetentionPolicy::default());
        events.register("r");
        let driver = SubprocessDriver::new();
        let spec = node(json!({"cmd": "sh", "args": ["-c", "echo one; echo two"]}));

        let outcome = driver
            .execute(ctx(&events), &spec, serde_json::Map::new())
            .await;
        match outcome {
            ExecOutcome::Ok { outputs } => assert_eq!(outputs["exit_code"], json!(0)),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let replay = events.replay("r", 0, None).unwrap();
        let lines: Vec<&str> = replay
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Log)
            .filter_map(|e| e.payload["line"].as_str())
            .collect();
        assert_eq!(lines, vec!["one", "two"]);

        let captured = driver.logs("r", "n", Some(1)).await;
        assert_eq!(captured, vec!["two"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_permanent_failure() {
        let events = EventLog::new(RetentionPolicy::default());
        events.register("r");
        let driver = SubprocessDriver::new();
        let spec = node(json!({"cmd": "sh", "args": ["-c", "exit 3"]}));

        match driver
            .execute(ctx(&events), &spec, serde_json::Map::new())
            .await
        {
            ExecOutcome::Fail {
                retriable, message, ..
            } => {
                assert!(!retriable);
                assert!(message.contains('3'));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_kills_a_long_running_command() {
        let events = EventLog::new(RetentionPolicy::default());
        events.register("r");
        let driver = std::sync::Arc::new(SubprocessDriver::new());
        let spec = node(json!({"cmd": "sleep", "args": ["30"]}));

        let exec = {
            let driver = std::sync::Arc::clone(&driver);
            let ctx = ctx(&events);
            tokio::spawn(async move { driver.execute(ctx, &spec, serde_json::Map::new()).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        driver.abort("r", "n").await;
        // Idempotent: a second abort is harmless.
        driver.abort("r", "n").await;

        assert!(matches!(exec.await.unwrap(), ExecOutcome::Canceled));
    }
}
