use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Driver, DriverContext, ExecOutcome};
use crate::plan::NodeSpec;

const DEFAULT_DELAY_MS: u64 = 100;

/// Deterministic in-process driver for tests and demos.
///
/// Sleeps `params.delay_ms` (or `params.delay`, default 100 ms) and echoes
/// the node's params back as its output. Failure paths are injectable
/// through params so retry and cascade behavior can be exercised without a
/// real backend:
///
/// - `"fail": "transient" | "permanent"` makes attempts fail with that
///   classification;
/// - `"fail_attempts": n` limits the injected failures to the first `n`
///   attempts, after which the node succeeds.
#[derive(Debug, Default)]
pub struct SimulatedDriver;

impl SimulatedDriver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn delay(node: &NodeSpec) -> Duration {
        let millis = node
            .params
            .get("delay_ms")
            .or_else(|| node.params.get("delay"))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_DELAY_MS);
        Duration::from_millis(millis)
    }

    fn injected_failure(node: &NodeSpec, attempt: u32) -> Option<ExecOutcome> {
        let kind = node.params.get("fail").and_then(Value::as_str)?;
        let fail_attempts = node
            .params
            .get("fail_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(u64::MAX);
        if u64::from(attempt) > fail_attempts {
            return None;
        }
        let message = format!("injected {kind} failure (attempt {attempt})");
        match kind {
            "transient" => Some(ExecOutcome::transient(message)),
            _ => Some(ExecOutcome::permanent(message)),
        }
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    async fn execute(
        &self,
        ctx: DriverContext,
        node: &NodeSpec,
        _inputs: serde_json::Map<String, Value>,
    ) -> ExecOutcome {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return ExecOutcome::Canceled,
            _ = tokio::time::sleep(Self::delay(node)) => {}
        }

        if let Some(failure) = Self::injected_failure(node, ctx.attempt) {
            return failure;
        }

        let mut outputs = serde_json::Map::new();
        outputs.insert("echo".to_string(), Value::Object(node.params.clone()));
        ExecOutcome::success(outputs)
    }

    async fn abort(&self, _run_id: &str, _node_id: &str) {
        // Cancellation token already stops the sleep; nothing else to tear
        // down.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLog, RetentionPolicy};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx(attempt: u32) -> DriverContext {
        let events = EventLog::new(RetentionPolicy::default());
        events.register("r");
        DriverContext {
            run_id: "r".into(),
            node_id: "n".into(),
            attempt,
            cancel: CancellationToken::new(),
            events,
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
    async fn echoes_params() {
        let driver = SimulatedDriver::new();
        let spec = node(json!({"delay_ms": 1, "tag": "x"}));
        match driver.execute(ctx(1), &spec, serde_json::Map::new()).await {
            ExecOutcome::Ok { outputs } => {
                assert_eq!(outputs["echo"]["tag"], json!("x"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_failures_stop_after_fail_attempts() {
        let driver = SimulatedDriver::new();
        let spec = node(json!({"delay_ms": 1, "fail": "transient", "fail_attempts": 2}));

        assert!(matches!(
            driver.execute(ctx(1), &spec, serde_json::Map::new()).await,
            ExecOutcome::Fail { retriable: true, .. }
        ));
        assert!(matches!(
            driver.execute(ctx(2), &spec, serde_json::Map::new()).await,
            ExecOutcome::Fail { .. }
        ));
        assert!(matches!(
            driver.execute(ctx(3), &spec, serde_json::Map::new()).await,
            ExecOutcome::Ok { .. }
        ));
    }

    #[tokio::test]
    async fn cancellation_wins_over_sleep() {
        let driver = SimulatedDriver::new();
        let spec = node(json!({"delay_ms": 5_000}));
        let ctx = ctx(1);
        ctx.cancel.cancel();
        assert!(matches!(
            driver.execute(ctx, &spec, serde_json::Map::new()).await,
            ExecOutcome::Canceled
        ));
    }
}
