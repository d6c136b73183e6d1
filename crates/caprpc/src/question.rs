//! Outbound call state
//!
//! A question tracks one call (or bootstrap) this vat has sent, from the
//! moment its ID is allocated until the peer's `return` arrives or the
//! caller cancels. Pipeline clients derived from a question let callers
//! invoke methods on the eventual result before it arrives.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::capability::{
    resolved_promise, Capability, Client, ClientKind, Method, Params, Promise, Resolution,
};
use crate::connection::ConnCore;
use crate::error::{Error, Result};
use crate::ids::{ExportId, QuestionId};
use crate::message::{MessageTarget, Transform};

/// Lifecycle of a question. Exactly one transition out of `InFlight`
/// happens; later transitions are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QuestionStage {
    InFlight,
    Resolved,
    Canceled,
}

struct QuestionState {
    stage: QuestionStage,
    /// Whether the call message made it onto the send queue. A question
    /// canceled before start owes the peer no `finish`.
    started: bool,
    /// Exports whose refcount this call's parameters bumped.
    param_caps: Vec<ExportId>,
    outcome: Option<Result<Resolution>>,
    /// Transforms for which pipeline clients were handed out while the
    /// question was in flight.
    derived: Vec<Transform>,
    /// Post-resolution delivery targets, one per derived transform;
    /// embargoed targets are wrapped before they land here.
    targets: HashMap<Transform, Client>,
}

pub(crate) struct Question {
    pub(crate) id: QuestionId,
    pub(crate) method: Option<Method>,
    state: RwLock<QuestionState>,
    done: watch::Sender<bool>,
}

impl Question {
    pub(crate) fn new(id: QuestionId, method: Option<Method>) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            id,
            method,
            state: RwLock::new(QuestionState {
                stage: QuestionStage::InFlight,
                started: false,
                param_caps: Vec::new(),
                outcome: None,
                derived: Vec::new(),
                targets: HashMap::new(),
            }),
            done,
        })
    }

    /// Mark that the call message has been enqueued.
    pub(crate) fn start(&self) {
        self.state.write().started = true;
    }

    pub(crate) fn started(&self) -> bool {
        self.state.read().started
    }

    pub(crate) fn set_param_caps(&self, caps: Vec<ExportId>) {
        self.state.write().param_caps = caps;
    }

    pub(crate) fn param_caps(&self) -> Vec<ExportId> {
        self.state.read().param_caps.clone()
    }

    pub(crate) fn stage(&self) -> QuestionStage {
        self.state.read().stage
    }

    /// Record a transform a pipeline client was created for.
    fn register_derived(&self, transform: &Transform) {
        let mut state = self.state.write();
        if state.stage == QuestionStage::InFlight && !state.derived.contains(transform) {
            state.derived.push(transform.clone());
        }
    }

    pub(crate) fn derived_transforms(&self) -> Vec<Transform> {
        self.state.read().derived.clone()
    }

    /// Terminal transition: the peer returned results. `targets` carries
    /// the delivery target for every derived transform (embargo-wrapped
    /// where path shortening demands it).
    pub(crate) fn fulfill(&self, resolution: Resolution, targets: HashMap<Transform, Client>) {
        {
            let mut state = self.state.write();
            if state.stage != QuestionStage::InFlight {
                return;
            }
            state.stage = QuestionStage::Resolved;
            state.outcome = Some(Ok(resolution));
            state.targets = targets;
        }
        self.done.send_replace(true);
    }

    /// Terminal transition: rejection or local cancellation.
    pub(crate) fn reject(&self, stage: QuestionStage, err: Error) {
        debug_assert!(stage != QuestionStage::InFlight);
        {
            let mut state = self.state.write();
            if state.stage != QuestionStage::InFlight {
                return;
            }
            state.stage = stage;
            state.outcome = Some(Err(err));
        }
        self.done.send_replace(true);
    }

    /// The delivery target a settled question routes `transform` to.
    /// `None` while the question is still in flight.
    pub(crate) fn resolved_client(&self, transform: &Transform) -> Option<Client> {
        let state = self.state.read();
        if state.stage == QuestionStage::InFlight {
            return None;
        }
        if let Some(target) = state.targets.get(transform) {
            return Some(target.clone());
        }
        Some(match &state.outcome {
            Some(Ok(resolution)) => resolution.client(transform),
            Some(Err(err)) => Client::from_error(err.clone()),
            None => Client::from_error(Error::Unresolved),
        })
    }

    /// Wait until the question settles, regardless of how.
    pub(crate) async fn settled(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Wait until the question settles; errors if it settled by rejection.
    pub(crate) async fn resolved(&self) -> Result<()> {
        let mut rx = self.done.subscribe();
        rx.wait_for(|done| *done)
            .await
            .map_err(|_| Error::ConnClosed)?;
        match &self.state.read().outcome {
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(Error::Unresolved),
        }
    }

    /// The caller-facing promise for this question's outcome. Errors are
    /// wrapped with the call's identity.
    pub(crate) fn promise(self: &Arc<Self>) -> Promise {
        let question = Arc::clone(self);
        Box::pin(async move {
            let mut rx = question.done.subscribe();
            rx.wait_for(|done| *done)
                .await
                .map_err(|_| Error::ConnClosed)?;
            let outcome = question
                .state
                .read()
                .outcome
                .clone()
                .unwrap_or(Err(Error::Unresolved));
            outcome.map_err(|err| err.for_question(question.method))
        })
    }

    /// Create a client for `transform` of this question's eventual result.
    pub(crate) fn pipeline_client(
        question: &Arc<Question>,
        core: &Arc<ConnCore>,
        transform: Transform,
    ) -> Client {
        question.register_derived(&transform);
        let hook = Arc::new(PipelineClient {
            conn: Arc::downgrade(core),
            question: Arc::clone(question),
            transform: transform.clone(),
        });
        Client::with_kind(
            hook,
            ClientKind::QuestionPipeline {
                conn: Arc::downgrade(core),
                question: Arc::clone(question),
                transform,
            },
        )
    }
}

/// A promise client for one transform of a question's result.
///
/// While the question is in flight, calls are sent to the peer targeting
/// the promised answer (promise pipelining). Once the question settles,
/// calls forward to the resolved delivery target.
pub(crate) struct PipelineClient {
    conn: Weak<ConnCore>,
    question: Arc<Question>,
    transform: Transform,
}

#[async_trait]
impl Capability for PipelineClient {
    async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise {
        let Some(core) = self.conn.upgrade() else {
            return resolved_promise(Err(Error::ConnClosed.for_question(Some(method))));
        };
        // Settled questions are stable; no lock needed to forward.
        if let Some(target) = self.question.resolved_client(&self.transform) {
            return target.call(ctx, method, params).await;
        }
        let mut guard = match core.lock(Some(&ctx)).await {
            Ok(guard) => guard,
            Err(err) => return resolved_promise(Err(err.for_question(Some(method)))),
        };
        // Resolution happens under the connection lock; re-check.
        if let Some(target) = self.question.resolved_client(&self.transform) {
            drop(guard);
            return target.call(ctx, method, params).await;
        }
        let target = MessageTarget::PromisedAnswer {
            question_id: self.question.id.0,
            transform: self.transform.clone(),
        };
        match core
            .nested_call(&mut guard, &ctx, method, target, params)
            .await
        {
            Ok(question) => question.promise(),
            Err(err) => resolved_promise(Err(err.for_question(Some(method)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Ptr;

    #[test]
    fn one_transition_out_of_pending() {
        let q = Question::new(QuestionId(1), None);
        q.fulfill(Resolution::data("a"), HashMap::new());
        q.reject(QuestionStage::Canceled, Error::Canceled);
        assert_eq!(q.stage(), QuestionStage::Resolved);

        let target = q.resolved_client(&Transform::root()).unwrap();
        // Data content carries no capability, so the root client errs.
        assert!(matches!(target.kind(), ClientKind::Error(_) | ClientKind::Other));
    }

    #[test]
    fn canceled_question_reports_error() {
        let q = Question::new(QuestionId(2), None);
        assert!(q.resolved_client(&Transform::root()).is_none());
        q.reject(QuestionStage::Canceled, Error::Canceled);
        assert_eq!(q.stage(), QuestionStage::Canceled);
        assert!(q.resolved_client(&Transform::root()).is_some());
    }

    #[tokio::test]
    async fn promise_wraps_bootstrap_errors() {
        let q = Question::new(QuestionId(3), None);
        let promise = q.promise();
        q.reject(QuestionStage::Resolved, Error::NoMainInterface);
        assert!(matches!(promise.await, Err(Error::Bootstrap(_))));
    }

    #[test]
    fn derived_transforms_recorded_once() {
        let q = Question::new(QuestionId(4), None);
        q.register_derived(&Transform::root());
        q.register_derived(&Transform::root());
        q.register_derived(&Transform::field(0));
        assert_eq!(q.derived_transforms().len(), 2);
        // Registration after settling is a no-op.
        q.fulfill(
            Resolution {
                content: Ptr::Null,
                caps: Vec::new(),
            },
            HashMap::new(),
        );
        q.register_derived(&Transform::field(1));
        assert_eq!(q.derived_transforms().len(), 2);
    }
}
