//! Worker 派发器
//!
//! 持有 WorkerRegistry 与统一超时，dispatch(agent, command, state) 在超时内调用对应 Worker，
//! 超时转为 WorkerError::Timeout，未知 Worker 转为 UnknownWorker；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::{Command, SharedState};
use crate::workers::{WorkerError, WorkerOutput, WorkerRegistry};

/// 派发器：对每次调用施加超时，并记录审计日志
pub struct WorkerDispatcher {
    registry: WorkerRegistry,
    timeout: Duration,
}

impl WorkerDispatcher {
    pub fn new(registry: WorkerRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub async fn dispatch(
        &self,
        agent: &str,
        command: &Command,
        state: &SharedState,
    ) -> Result<WorkerOutput, WorkerError> {
        let worker = self
            .registry
            .get(agent)
            .ok_or_else(|| WorkerError::UnknownWorker(agent.to_string()))?;

        let start = Instant::now();
        let result = timeout(self.timeout, worker.run(command, state)).await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "worker_audit",
            "agent": agent,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "instruction_preview": preview(&command.to_string()),
        });
        tracing::info!(audit = %audit, "worker");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(WorkerError::Timeout {
                worker: agent.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.registry.worker_names()
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::Worker;
    use async_trait::async_trait;

    struct SlowWorker;

    #[async_trait]
    impl Worker for SlowWorker {
        fn name(&self) -> &str {
            "slow_agent"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn run(&self, _command: &Command, _state: &SharedState) -> Result<WorkerOutput, WorkerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(WorkerOutput::default())
        }
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let dispatcher = WorkerDispatcher::new(WorkerRegistry::new(), 5);
        let state = SharedState::new("task");
        let err = dispatcher
            .dispatch("ghost_agent", &Command::Opaque("ls".into()), &state)
            .await
            .unwrap_err();
        assert_eq!(err, WorkerError::UnknownWorker("ghost_agent".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout_is_distinct_error() {
        let mut registry = WorkerRegistry::new();
        registry.register(SlowWorker);
        let dispatcher = WorkerDispatcher::new(registry, 1);
        let state = SharedState::new("task");
        let err = dispatcher
            .dispatch("slow_agent", &Command::Opaque("x".into()), &state)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Timeout { secs: 1, .. }));
    }
}
