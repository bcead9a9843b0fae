use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::lane::{ExclusiveLane, LaneTicket};
use super::{ApprovalRequirement, Concurrency, Error, ToolRegistry};
use crate::conversation::{ToolCall, ToolCallStatus};
use crate::event::{Emitter, EventKind};
use crate::permission::{ApprovalError, Decision, PermissionGate};

/// Runs the batches of tool calls requested by the model.
///
/// All calls of a batch start at once. Shared calls run concurrently with
/// anything, exclusive calls additionally run one at a time in request
/// order. A call waiting for approval never holds back its siblings.
#[derive(Clone)]
pub struct ToolEngine {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolEngine {
    /// Creates an engine dispatching to `registry`, giving each call
    /// `timeout` to finish.
    #[inline]
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Runs a batch until every call is terminal.
    ///
    /// The returned calls are in the order they were submitted. Calls that
    /// are already terminal are reported as they are.
    ///
    /// On cancellation, calls that haven't started are cancelled and
    /// running shared calls are asked to stop. A running exclusive call
    /// finishes, so that it doesn't leave shared state half written.
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        gate: &PermissionGate,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Vec<ToolCall> {
        debug!("executing a batch of {} tool calls", calls.len());
        let mut lane = ExclusiveLane::default();
        let runs = calls.into_iter().map(|call| {
            let exclusive = !call.status().is_terminal()
                && self.registry.get(&call.name).is_some_and(|tool| {
                    tool.concurrency() == Concurrency::Exclusive
                });
            let ticket = exclusive.then(|| lane.ticket());
            let span =
                debug_span!("tool call", id = %call.id, tool = %call.name);
            self.run_call(call, ticket, gate, emitter, cancel)
                .instrument(span)
        });
        join_all(runs).await
    }

    async fn run_call(
        &self,
        mut call: ToolCall,
        mut ticket: Option<LaneTicket>,
        gate: &PermissionGate,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> ToolCall {
        if !call.status().is_terminal() {
            let status = self
                .drive(&mut call, ticket.as_mut(), gate, emitter, cancel)
                .await;
            advance(&mut call, status);
        }
        trace!("tool call finished: {:?}", call.status());
        emitter.emit(EventKind::ToolCallFinished { call: call.clone() });
        if let Some(ticket) = ticket {
            ticket.release().await;
        }
        call
    }

    /// Brings a call as far as it goes and returns its terminal status.
    async fn drive(
        &self,
        call: &mut ToolCall,
        ticket: Option<&mut LaneTicket>,
        gate: &PermissionGate,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> ToolCallStatus {
        let Some(tool) = self.registry.get(&call.name) else {
            warn!("tool not found: {}", call.name);
            let error = Error::not_found()
                .with_reason(format!("no tool named `{}`", call.name));
            return ToolCallStatus::Failed { error };
        };
        let prepared = match Arc::clone(tool).prepare(call.arguments.clone()) {
            Ok(prepared) => prepared,
            Err(error) => return ToolCallStatus::Failed { error },
        };
        if cancel.is_cancelled() {
            return cancelled();
        }

        if tool.approval() == ApprovalRequirement::Required {
            advance(call, ToolCallStatus::AwaitingApproval);
            let decision = gate
                .request_approval(call, &prepared.action, emitter, cancel)
                .await;
            match decision {
                Ok(Decision::Denied { reason }) => {
                    let reason = reason
                        .unwrap_or_else(|| "denied by the user".to_owned());
                    let error = Error::permission_denied().with_reason(reason);
                    return ToolCallStatus::Failed { error };
                }
                Ok(_) => {}
                Err(ApprovalError::Cancelled) => return cancelled(),
                Err(ApprovalError::TimedOut) => {
                    let error = Error::permission_denied()
                        .with_reason("approval timed out");
                    return ToolCallStatus::Failed { error };
                }
            }
        }

        let exclusive = tool.concurrency() == Concurrency::Exclusive;
        if let Some(ticket) = ticket {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(),
                _ = ticket.wait_turn() => {}
            }
        }
        if cancel.is_cancelled() {
            return cancelled();
        }

        advance(call, ToolCallStatus::Running);
        emitter.emit(EventKind::ToolCallStarted {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
        });

        // Exclusive calls drain, so they don't listen to the turn.
        let token = if exclusive {
            CancellationToken::new()
        } else {
            cancel.child_token()
        };
        let execution = timeout(self.timeout, prepared.run(token.clone()));
        let result = if exclusive {
            execution.await
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    token.cancel();
                    return cancelled();
                }
                result = execution => result,
            }
        };

        match result {
            Ok(Ok(output)) => ToolCallStatus::Succeeded { output },
            Ok(Err(error)) => ToolCallStatus::Failed { error },
            Err(_) => {
                token.cancel();
                let error = Error::timeout().with_reason(format!(
                    "no result after {}ms",
                    self.timeout.as_millis()
                ));
                ToolCallStatus::Failed { error }
            }
        }
    }
}

fn cancelled() -> ToolCallStatus {
    ToolCallStatus::Cancelled {
        reason: "turn cancelled".to_owned(),
    }
}

fn advance(call: &mut ToolCall, status: ToolCallStatus) {
    if let Err(err) = call.advance(status) {
        error!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::{Instant, sleep};

    use super::*;
    use crate::event::{EventBus, Received};
    use crate::permission::PermissionPolicy;
    use crate::session::SessionId;
    use crate::testing::{EchoTool, FailTool, SleepTool, WriteTool};
    use crate::tool::ErrorKind;

    fn engine(write: &WriteTool) -> ToolEngine {
        let mut registry = ToolRegistry::default();
        registry.register(EchoTool);
        registry.register(SleepTool);
        registry.register(FailTool);
        registry.register(write.clone());
        ToolEngine::new(Arc::new(registry), Duration::from_secs(10))
    }

    fn bypass() -> PermissionGate {
        PermissionGate::new(PermissionPolicy {
            bypass: true,
            wait_timeout: None,
        })
    }

    fn failure_kind(call: &ToolCall) -> Option<ErrorKind> {
        match call.status() {
            ToolCallStatus::Failed { error } => Some(error.kind()),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_complete_and_ordered() {
        let write = WriteTool::default();
        let engine = engine(&write);
        let bus = EventBus::new(64);
        let emitter = bus.emitter(SessionId::from("s"), 1);

        let calls = vec![
            ToolCall::new("1", "sleep", json!({ "ms": 30 })),
            ToolCall::new("2", "echo", json!({ "text": "hi" })),
            ToolCall::new("3", "echo", json!({ "text": 3 })),
            ToolCall::new("4", "missing", json!({})),
            ToolCall::new("5", "fail", json!(null)),
            ToolCall::new("6", "write", json!({ "path": "a", "ms": 5 })),
        ];
        let results = engine
            .execute_batch(calls, &bypass(), &emitter, &Default::default())
            .await;

        let ids: Vec<_> = results.iter().map(|call| call.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4", "5", "6"]);
        assert!(results.iter().all(|call| call.status().is_terminal()));
        assert!(matches!(
            results[1].status(),
            ToolCallStatus::Succeeded { output } if output == "hi"
        ));
        assert_eq!(failure_kind(&results[2]), Some(ErrorKind::InvalidInput));
        assert_eq!(failure_kind(&results[3]), Some(ErrorKind::NotFound));
        assert_eq!(failure_kind(&results[4]), Some(ErrorKind::ExecutionError));
        assert_eq!(write.runs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_calls_never_overlap() {
        let write = WriteTool::default();
        let engine = engine(&write);
        let bus = EventBus::new(64);
        let emitter = bus.emitter(SessionId::from("s"), 1);

        let calls = vec![
            ToolCall::new("1", "write", json!({ "path": "a", "ms": 30 })),
            ToolCall::new("2", "sleep", json!({ "ms": 20 })),
            ToolCall::new("3", "write", json!({ "path": "b", "ms": 10 })),
            ToolCall::new("4", "write", json!({ "path": "c", "ms": 20 })),
        ];
        let started = Instant::now();
        engine
            .execute_batch(calls, &bypass(), &emitter, &Default::default())
            .await;

        let runs = write.runs();
        let paths: Vec<_> = runs.iter().map(|run| run.path.as_str()).collect();
        assert_eq!(paths, ["a", "b", "c"]);
        for pair in runs.windows(2) {
            assert!(pair[0].finished <= pair[1].started);
        }
        // The shared call ran alongside the first write.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_approval_does_not_block_siblings() {
        let write = WriteTool::default();
        let engine = engine(&write);
        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let emitter = bus.emitter(SessionId::from("s"), 1);
        let gate = PermissionGate::default();

        let calls = vec![
            ToolCall::new("w", "write", json!({ "path": "a" })),
            ToolCall::new("e", "echo", json!({ "text": "hi" })),
        ];
        let frontend = async {
            let mut echo_done = false;
            let mut requested = false;
            while !(echo_done && requested) {
                let Some(Received::Event(event)) = events.recv().await else {
                    unreachable!();
                };
                match event.kind {
                    EventKind::ToolCallFinished { call } => {
                        assert_eq!(call.id, "e");
                        echo_done = true;
                    }
                    EventKind::PermissionRequested { .. } => requested = true,
                    _ => {}
                }
            }
            gate.resolve(
                "w",
                Decision::Denied {
                    reason: Some("read only".to_owned()),
                },
            )
            .unwrap();
        };
        let cancel = CancellationToken::new();
        let (results, _) = tokio::join!(
            engine.execute_batch(calls, &gate, &emitter, &cancel),
            frontend
        );
        let kind = failure_kind(&results[0]);
        assert_eq!(kind, Some(ErrorKind::PermissionDenied));
        assert!(write.runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut registry = ToolRegistry::default();
        registry.register(SleepTool);
        let engine =
            ToolEngine::new(Arc::new(registry), Duration::from_millis(50));
        let bus = EventBus::new(64);
        let emitter = bus.emitter(SessionId::from("s"), 1);

        let results = engine
            .execute_batch(
                vec![ToolCall::new("1", "sleep", json!({ "ms": 1000 }))],
                &bypass(),
                &emitter,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(failure_kind(&results[0]), Some(ErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_running_exclusive_call() {
        let write = WriteTool::default();
        let engine = engine(&write);
        let bus = EventBus::new(64);
        let emitter = bus.emitter(SessionId::from("s"), 1);
        let gate = PermissionGate::default();
        let cancel = CancellationToken::new();

        let calls = vec![
            ToolCall::new("1", "write", json!({ "path": "a", "ms": 100 })),
            ToolCall::new("2", "sleep", json!({ "ms": 100 })),
            ToolCall::new("3", "write", json!({ "path": "b", "ms": 100 })),
        ];
        let approve = async {
            // Approve both writes for the session, then cancel mid-way.
            loop {
                let pending = gate.pending_requests();
                if let Some(request) = pending.first() {
                    let id = &request.tool_call_id;
                    gate.resolve(id, Decision::ApprovedAlways).unwrap();
                    break;
                }
                tokio::task::yield_now().await;
            }
            sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        };
        let (results, _) = tokio::join!(
            engine.execute_batch(calls, &gate, &emitter, &cancel),
            approve
        );

        assert!(matches!(
            results[0].status(),
            ToolCallStatus::Succeeded { .. }
        ));
        assert!(matches!(
            results[1].status(),
            ToolCallStatus::Cancelled { .. }
        ));
        assert!(matches!(
            results[2].status(),
            ToolCallStatus::Cancelled { .. }
        ));
        assert_eq!(write.runs().len(), 1);
    }
}
