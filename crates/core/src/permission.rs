//! Approval of risky tool calls.
//!
//! Every session owns a [`PermissionGate`]. A call that requires approval
//! suspends until the frontend resolves its [`PermissionRequest`], while
//! sibling calls keep running. An "approved always" decision is remembered
//! for the rest of the session, keyed by tool name and normalized target.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::conversation::ToolCall;
use crate::event::{Emitter, EventKind};
use crate::tool::Action;

/// How a gate treats approval requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PermissionPolicy {
    /// Approve everything without asking. Nothing is remembered.
    pub bypass: bool,
    /// How long to wait for a decision, `None` waits forever.
    pub wait_timeout: Option<Duration>,
}

/// Decision of the user on a permission request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Run this call.
    ApprovedOnce,
    /// Run this call and every equivalent one in the session.
    ApprovedAlways,
    /// Don't run this call.
    Denied {
        /// Optional explanation passed back to the model.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Decision {
    /// Returns `true` unless the decision is a denial.
    #[inline]
    pub fn is_approved(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }
}

/// A request for the user's consent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// The call waiting for approval.
    pub tool_call_id: String,
    /// Name of the tool.
    pub tool_name: String,
    /// What the call is going to do.
    pub description: String,
    /// What the call acts upon.
    pub target: String,
    /// `None` while the request is pending.
    pub decision: Option<Decision>,
    /// When the request gives up waiting, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Error returned to the frontend by [`PermissionGate::resolve`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No request was ever made for this call.
    #[error("no permission request for tool call `{0}`")]
    Unknown(String),
    /// The request was already resolved, timed out or cancelled.
    #[error("permission request for tool call `{0}` is no longer pending")]
    AlreadyResolved(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ApprovalError {
    Cancelled,
    TimedOut,
}

struct Pending {
    request: PermissionRequest,
    order: u64,
    reply: oneshot::Sender<Decision>,
}

/// How many settled call ids are kept to tell late resolutions apart from
/// unknown ones.
const SETTLED_RETAINED: usize = 256;

#[derive(Default)]
struct GateState {
    pending: HashMap<String, Pending>,
    settled: VecDeque<String>,
    next_order: u64,
}

impl GateState {
    fn settle(&mut self, tool_call_id: &str) {
        if self.settled.len() >= SETTLED_RETAINED {
            self.settled.pop_front();
        }
        self.settled.push_back(tool_call_id.to_owned());
    }

    fn is_settled(&self, tool_call_id: &str) -> bool {
        self.settled.iter().any(|id| id == tool_call_id)
    }
}

/// Serializes and resolves approval requests of one session.
#[derive(Default)]
pub struct PermissionGate {
    policy: PermissionPolicy,
    state: Mutex<GateState>,
    always: RwLock<HashSet<(String, String)>>,
}

impl PermissionGate {
    /// Creates a gate with the given policy.
    #[inline]
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Returns the policy of this gate.
    #[inline]
    pub fn policy(&self) -> PermissionPolicy {
        self.policy
    }

    /// Resolves the pending request of `tool_call_id`.
    ///
    /// Approving always also approves the pending requests of the same tool
    /// on the same target.
    pub fn resolve(
        &self,
        tool_call_id: &str,
        decision: Decision,
    ) -> Result<(), ResolveError> {
        let (pending, equivalent) = {
            let mut state = self.lock();
            let Some(pending) = state.pending.remove(tool_call_id) else {
                return Err(if state.is_settled(tool_call_id) {
                    ResolveError::AlreadyResolved(tool_call_id.to_owned())
                } else {
                    ResolveError::Unknown(tool_call_id.to_owned())
                });
            };
            state.settle(tool_call_id);

            let mut equivalent = vec![];
            if decision == Decision::ApprovedAlways {
                let key = approval_key(&pending.request);
                self.always
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone());
                let ids: Vec<_> = state
                    .pending
                    .iter()
                    .filter(|(_, other)| approval_key(&other.request) == key)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    if let Some(other) = state.pending.remove(&id) {
                        state.settle(&id);
                        equivalent.push(other);
                    }
                }
            }
            (pending, equivalent)
        };
        debug!("permission for `{tool_call_id}` resolved: {decision:?}");

        for other in equivalent {
            debug!("`{}` approved along", other.request.tool_call_id);
            let _ = other.reply.send(Decision::ApprovedAlways);
        }
        // The call may have been cancelled in the meantime.
        let _ = pending.reply.send(decision);
        Ok(())
    }

    /// Returns `true` while the request of `tool_call_id` waits for a
    /// decision.
    pub fn is_pending(&self, tool_call_id: &str) -> bool {
        self.lock().pending.contains_key(tool_call_id)
    }

    /// Returns the requests waiting for a decision, oldest first.
    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        let state = self.lock();
        let mut pending: Vec<_> = state.pending.values().collect();
        pending.sort_by_key(|pending| pending.order);
        pending.into_iter().map(|p| p.request.clone()).collect()
    }

    /// Returns `true` if calls of `tool_name` on `target` are approved for
    /// the rest of the session.
    pub fn is_always_approved(&self, tool_name: &str, target: &str) -> bool {
        let key = (tool_name.to_owned(), normalize_target(target));
        self.always
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }

    /// Waits for the decision on `call`.
    ///
    /// The request is given up on when `cancel` is triggered or the policy
    /// timeout expires, a later `resolve` for it then reports an error.
    pub(crate) async fn request_approval(
        &self,
        call: &ToolCall,
        action: &Action,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<Decision, ApprovalError> {
        if self.policy.bypass {
            trace!("bypass mode, approving `{}`", call.id);
            return Ok(Decision::ApprovedOnce);
        }
        if self.is_always_approved(&call.name, &action.target) {
            trace!("`{}` was approved for the session", call.id);
            return Ok(Decision::ApprovedAlways);
        }

        let expires_at = self.policy.wait_timeout.and_then(|wait| {
            let wait = TimeDelta::from_std(wait).ok()?;
            Utc::now().checked_add_signed(wait)
        });
        let request = PermissionRequest {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            description: action.description.clone(),
            target: action.target.clone(),
            decision: None,
            expires_at,
        };
        let (reply, decision) = oneshot::channel();
        {
            let mut state = self.lock();
            // Approved always while this call was getting here.
            if self.is_always_approved(&call.name, &action.target) {
                return Ok(Decision::ApprovedAlways);
            }
            let order = state.next_order;
            state.next_order += 1;
            state.settled.retain(|id| *id != call.id);
            state.pending.insert(
                call.id.clone(),
                Pending {
                    request: request.clone(),
                    order,
                    reply,
                },
            );
        }
        emitter.emit(EventKind::PermissionRequested { request });

        let wait = async {
            match self.policy.wait_timeout {
                Some(wait) => timeout(wait, decision)
                    .await
                    .map_err(|_| ApprovalError::TimedOut)?
                    .map_err(|_| ApprovalError::Cancelled),
                None => decision.await.map_err(|_| ApprovalError::Cancelled),
            }
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApprovalError::Cancelled),
            result = wait => result,
        };
        if let Err(err) = &result {
            debug!("gave up waiting for `{}`: {err:?}", call.id);
            self.abandon(&call.id);
        }
        result
    }

    fn abandon(&self, tool_call_id: &str) {
        let mut state = self.lock();
        if state.pending.remove(tool_call_id).is_some() {
            state.settle(tool_call_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn approval_key(request: &PermissionRequest) -> (String, String) {
    (request.tool_name.clone(), normalize_target(&request.target))
}

/// Normalizes an action target, so that equivalent spellings of a path
/// share their remembered approvals.
///
/// Surrounding whitespace, repeated `/`, `.` segments and trailing `/` are
/// dropped.
pub fn normalize_target(target: &str) -> String {
    let target = target.trim();
    let joined = target
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");
    if target.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::{EventBus, Received};
    use crate::session::SessionId;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "write", json!({}))
    }

    fn action(target: &str) -> Action {
        Action::new(format!("Write {target}"), target)
    }

    #[test]
    fn test_normalize_target() {
        assert_eq!(normalize_target(" ./src//lib.rs/ "), "src/lib.rs");
        assert_eq!(normalize_target("/tmp/./a//b"), "/tmp/a/b");
        assert_eq!(normalize_target("cargo test"), "cargo test");
    }

    #[tokio::test]
    async fn test_approve_always_is_remembered() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let emitter = bus.emitter(SessionId::from("s"), 1);
        let gate = PermissionGate::default();
        let cancel = CancellationToken::new();

        let first = call("call_1");
        let target = action("src/main.rs");
        let (decision, _) = tokio::join!(
            gate.request_approval(&first, &target, &emitter, &cancel),
            async {
                let Some(Received::Event(event)) = events.recv().await else {
                    unreachable!();
                };
                assert!(matches!(
                    event.kind,
                    EventKind::PermissionRequested { .. }
                ));
                gate.resolve("call_1", Decision::ApprovedAlways).unwrap();
            }
        );
        assert_eq!(decision, Ok(Decision::ApprovedAlways));

        let decision = gate
            .request_approval(
                &call("call_2"),
                &action("./src//main.rs"),
                &emitter,
                &cancel,
            )
            .await;
        assert_eq!(decision, Ok(Decision::ApprovedAlways));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_approve_always_settles_equivalent_requests() {
        let bus = EventBus::new(16);
        let emitter = bus.emitter(SessionId::from("s"), 1);
        let gate = PermissionGate::default();
        let cancel = CancellationToken::new();

        let (first, second, other) = (call("a"), call("b"), call("c"));
        let (same, same_again) = (action("x.txt"), action("./x.txt"));
        let elsewhere = action("y.txt");
        let (a, b, c, _) = tokio::join!(
            gate.request_approval(&first, &same, &emitter, &cancel),
            gate.request_approval(&second, &same_again, &emitter, &cancel),
            gate.request_approval(&other, &elsewhere, &emitter, &cancel),
            async {
                tokio::task::yield_now().await;
                assert_eq!(gate.pending_requests().len(), 3);
                gate.resolve("a", Decision::ApprovedAlways).unwrap();
                assert!(!gate.is_pending("b"));
                assert!(gate.is_pending("c"));
                gate.resolve("c", Decision::ApprovedOnce).unwrap();
            }
        );
        assert_eq!(a, Ok(Decision::ApprovedAlways));
        assert_eq!(b, Ok(Decision::ApprovedAlways));
        assert_eq!(c, Ok(Decision::ApprovedOnce));
        assert_eq!(
            gate.resolve("b", Decision::ApprovedOnce),
            Err(ResolveError::AlreadyResolved("b".to_owned()))
        );
    }

    #[test]
    fn test_settled_ids_are_bounded() {
        let gate = PermissionGate::default();
        for n in 0..SETTLED_RETAINED + 10 {
            gate.lock().settle(&format!("call_{n}"));
        }
        let state = gate.lock();
        assert_eq!(state.settled.len(), SETTLED_RETAINED);
        assert!(!state.is_settled("call_0"));
        assert!(state.is_settled(&format!("call_{}", SETTLED_RETAINED + 9)));
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let bus = EventBus::new(16);
        let emitter = bus.emitter(SessionId::from("s"), 1);
        let gate = PermissionGate::default();
        let cancel = CancellationToken::new();

        assert_eq!(
            gate.resolve("nope", Decision::ApprovedOnce),
            Err(ResolveError::Unknown("nope".to_owned()))
        );

        let call = call("call_1");
        let target = action("a.txt");
        let (decision, _) = tokio::join!(
            gate.request_approval(&call, &target, &emitter, &cancel),
            async {
                tokio::task::yield_now().await;
                assert_eq!(gate.pending_requests().len(), 1);
                gate.resolve(
                    "call_1",
                    Decision::Denied {
                        reason: Some("not now".to_owned()),
                    },
                )
                .unwrap();
            }
        );
        assert!(!decision.unwrap().is_approved());
        assert_eq!(
            gate.resolve("call_1", Decision::ApprovedOnce),
            Err(ResolveError::AlreadyResolved("call_1".to_owned()))
        );
        assert!(gate.pending_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_cancellation() {
        let bus = EventBus::new(16);
        let emitter = bus.emitter(SessionId::from("s"), 1);
        let gate = PermissionGate::new(PermissionPolicy {
            bypass: false,
            wait_timeout: Some(Duration::from_secs(30)),
        });
        let cancel = CancellationToken::new();

        let decision = gate
            .request_approval(&call("call_1"), &action("a"), &emitter, &cancel)
            .await;
        assert_eq!(decision, Err(ApprovalError::TimedOut));
        assert!(gate.resolve("call_1", Decision::ApprovedOnce).is_err());

        cancel.cancel();
        let decision = gate
            .request_approval(&call("call_2"), &action("b"), &emitter, &cancel)
            .await;
        assert_eq!(decision, Err(ApprovalError::Cancelled));
        assert!(gate.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_bypass_emits_nothing() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let emitter = bus.emitter(SessionId::from("s"), 1);
        let gate = PermissionGate::new(PermissionPolicy {
            bypass: true,
            wait_timeout: None,
        });

        let decision = gate
            .request_approval(
                &call("call_1"),
                &action("a"),
                &emitter,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(decision, Ok(Decision::ApprovedOnce));
        assert!(events.try_recv().is_none());
        assert!(!gate.is_always_approved("write", "a"));
    }
}
