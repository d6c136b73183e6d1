//! Inbound call state
//!
//! An answer tracks one call (or bootstrap) this vat is executing for the
//! peer. Calls pipelined onto the answer's future result queue here until
//! the answer resolves; disembargoes queue behind them so the loopback
//! echo cannot overtake queued deliveries.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::capability::{
    resolved_promise, Capability, Client, ClientKind, Method, Params, Promise, Resolution,
};
use crate::error::{Error, Result};
use crate::connection::ConnCore;
use crate::ids::{AnswerId, ExportId};
use crate::message::{MessageTarget, Transform};

/// Where a queued pipelined call delivers its outcome: a peer-facing
/// answer of this connection, or a local caller's promise.
pub(crate) enum CallSink {
    Answer(AnswerId),
    Promise(oneshot::Sender<Promise>),
}

/// One call queued on a not-yet-resolved answer, keyed by the transform
/// selecting its target inside the eventual result.
pub(crate) struct QueuedCall {
    pub transform: Transform,
    pub ctx: CancellationToken,
    pub method: Method,
    pub params: Params,
    pub sink: CallSink,
}

pub(crate) struct Answer {
    pub id: AnswerId,
    /// Cancels the local execution context; fired on `finish` and on
    /// connection shutdown.
    pub cancel: CancellationToken,
    resolution: Option<Result<Resolution>>,
    queue: Vec<QueuedCall>,
    /// Disembargoes waiting for the queued calls above to be dispatched,
    /// as (wire embargo ID, original target) pairs.
    pending_disembargoes: Vec<(u32, MessageTarget)>,
    /// Exports whose refcount the answer's results bumped; released when
    /// the peer's `finish` asks for it.
    pub result_caps: Vec<ExportId>,
}

impl Answer {
    pub(crate) fn new(id: AnswerId, cancel: CancellationToken) -> Self {
        Self {
            id,
            cancel,
            resolution: None,
            queue: Vec::new(),
            pending_disembargoes: Vec::new(),
            result_caps: Vec::new(),
        }
    }

    pub(crate) fn resolution(&self) -> Option<&Result<Resolution>> {
        self.resolution.as_ref()
    }

    /// First resolution wins; later ones are dropped.
    pub(crate) fn resolve(&mut self, outcome: Result<Resolution>) -> bool {
        if self.resolution.is_some() {
            return false;
        }
        self.resolution = Some(outcome);
        true
    }

    pub(crate) fn queue_call(&mut self, call: QueuedCall) {
        debug_assert!(self.resolution.is_none());
        self.queue.push(call);
    }

    /// Queue a disembargo behind the currently queued calls. Returns
    /// `false` if there is nothing left to wait for (already resolved and
    /// drained), in which case the caller echoes immediately.
    pub(crate) fn queue_disembargo(&mut self, id: u32, target: MessageTarget) -> bool {
        if self.resolution.is_some() {
            debug_assert!(self.queue.is_empty());
            return false;
        }
        self.pending_disembargoes.push((id, target));
        true
    }

    /// Drain queued work for dispatch, in queue order.
    pub(crate) fn take_queued(&mut self) -> (Vec<QueuedCall>, Vec<(u32, MessageTarget)>) {
        (
            std::mem::take(&mut self.queue),
            std::mem::take(&mut self.pending_disembargoes),
        )
    }

    /// The client a settled answer routes `transform` to.
    pub(crate) fn resolved_client(&self, transform: &Transform) -> Option<Client> {
        match &self.resolution {
            Some(Ok(resolution)) => Some(resolution.client(transform)),
            Some(Err(err)) => Some(Client::from_error(err.clone())),
            None => None,
        }
    }
}

/// A promise client for one transform of an answer's future result,
/// handed to local code when the peer's payload references one of its own
/// answers (`receiverAnswer`).
pub(crate) struct AnswerPipelineClient {
    conn: Weak<ConnCore>,
    answer: AnswerId,
    transform: Transform,
}

impl AnswerPipelineClient {
    pub(crate) fn client(conn: Weak<ConnCore>, answer: AnswerId, transform: Transform) -> Client {
        let hook = Arc::new(AnswerPipelineClient {
            conn: conn.clone(),
            answer,
            transform: transform.clone(),
        });
        Client::with_kind(
            hook,
            ClientKind::AnswerPipeline {
                conn,
                answer,
                transform,
            },
        )
    }
}

#[async_trait]
impl Capability for AnswerPipelineClient {
    async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise {
        let Some(core) = self.conn.upgrade() else {
            return resolved_promise(Err(Error::ConnClosed.for_question(Some(method))));
        };
        let mut guard = match core.lock(Some(&ctx)).await {
            Ok(guard) => guard,
            Err(err) => return resolved_promise(Err(err.for_question(Some(method)))),
        };
        let Some(answer) = guard.answers.get_mut(&self.answer) else {
            // The answer was finished; the promise this client came from
            // no longer has a delivery target.
            return resolved_promise(Err(Error::BadTarget.for_question(Some(method))));
        };
        if let Some(target) = answer.resolved_client(&self.transform) {
            drop(guard);
            return target.call(ctx, method, params).await;
        }
        let (tx, rx) = oneshot::channel();
        answer.queue_call(QueuedCall {
            transform: self.transform.clone(),
            ctx,
            method,
            params,
            sink: CallSink::Promise(tx),
        });
        drop(guard);
        Box::pin(async move {
            match rx.await {
                Ok(promise) => promise.await,
                Err(_) => Err(Error::ConnClosed),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_idempotent() {
        let mut answer = Answer::new(AnswerId(1), CancellationToken::new());
        assert!(answer.resolve(Ok(Resolution::data("first"))));
        assert!(!answer.resolve(Err(Error::BadTarget)));
        assert!(matches!(answer.resolution(), Some(Ok(_))));
    }

    #[test]
    fn disembargo_queues_only_while_pending() {
        let mut answer = Answer::new(AnswerId(2), CancellationToken::new());
        let target = MessageTarget::PromisedAnswer {
            question_id: 2,
            transform: Transform::root(),
        };
        assert!(answer.queue_disembargo(7, target.clone()));
        answer.resolve(Ok(Resolution::empty()));
        // take_queued clears the pending disembargo with the queue.
        let (calls, disembargoes) = answer.take_queued();
        assert!(calls.is_empty());
        assert_eq!(disembargoes, vec![(7, target.clone())]);
        assert!(!answer.queue_disembargo(8, target));
    }
}
