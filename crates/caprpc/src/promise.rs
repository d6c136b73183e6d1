//! Promise-backed clients
//!
//! A capability can be the future result of an arbitrary promise, not
//! only of a question on a connection. This client buffers calls until
//! the promise resolves, then replays them in order against the resolved
//! target and steps out of the way. It is the delivery vehicle behind
//! [`Client::call_with_pipeline`](crate::Client::call_with_pipeline) for
//! targets that have no wire path to pipeline over.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::capability::{
    resolved_promise, Capability, Client, ClientKind, Method, Params, Promise, Resolution,
};
use crate::error::{Error, Result};
use crate::message::Transform;

pub(crate) struct PromiseShared {
    state: Mutex<PromiseState>,
    done: watch::Sender<bool>,
}

struct PromiseState {
    /// Set once the driving promise has resolved and the queue drained.
    outcome: Option<Result<Resolution>>,
    queue: VecDeque<Queued>,
}

struct Queued {
    transform: Transform,
    ctx: CancellationToken,
    method: Method,
    params: Params,
    tx: oneshot::Sender<Promise>,
}

impl PromiseShared {
    /// Drive `promise` to completion, replaying buffered calls in order.
    /// Must be called from within a runtime.
    pub(crate) fn spawn(promise: Promise) -> Arc<PromiseShared> {
        let (done, _) = watch::channel(false);
        let shared = Arc::new(PromiseShared {
            state: Mutex::new(PromiseState {
                outcome: None,
                queue: VecDeque::new(),
            }),
            done,
        });
        let driver = Arc::clone(&shared);
        tokio::spawn(async move {
            let outcome = promise.await;
            loop {
                let next = {
                    let mut state = driver.state.lock();
                    match state.queue.pop_front() {
                        Some(next) => next,
                        None => {
                            state.outcome = Some(outcome.clone());
                            break;
                        }
                    }
                };
                let client = match &outcome {
                    Ok(resolution) => resolution.client(&next.transform),
                    Err(err) => Client::from_error(err.clone()),
                };
                // Sequential starts keep delivery in queue order.
                let promise = client.call(next.ctx, next.method, next.params).await;
                let _ = next.tx.send(promise);
            }
            driver.done.send_replace(true);
        });
        shared
    }

    /// A future for the promise's outcome, independent of any call.
    pub(crate) fn outcome(self: &Arc<Self>) -> Promise {
        let shared = Arc::clone(self);
        let mut rx = self.done.subscribe();
        Box::pin(async move {
            rx.wait_for(|done| *done)
                .await
                .map_err(|_| Error::ConnClosed)?;
            shared
                .state
                .lock()
                .outcome
                .clone()
                .unwrap_or(Err(Error::Unresolved))
        })
    }

    /// The client view for one transform of the eventual resolution.
    pub(crate) fn client(self: &Arc<Self>, transform: Transform) -> Client {
        let hook = Arc::new(PromiseClient {
            shared: Arc::clone(self),
            transform: transform.clone(),
        });
        Client::with_kind(
            hook,
            ClientKind::Promise {
                shared: Arc::clone(self),
                transform,
            },
        )
    }
}

pub(crate) struct PromiseClient {
    shared: Arc<PromiseShared>,
    transform: Transform,
}

#[async_trait]
impl Capability for PromiseClient {
    async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise {
        let target = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(Ok(resolution)) => resolution.client(&self.transform),
                Some(Err(err)) => return resolved_promise(Err(err.clone())),
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(Queued {
                        transform: self.transform.clone(),
                        ctx,
                        method,
                        params,
                        tx,
                    });
                    return Box::pin(async move {
                        match rx.await {
                            Ok(promise) => promise.await,
                            Err(_) => Err(Error::ConnClosed),
                        }
                    });
                }
            }
        };
        target.call(ctx, method, params).await
    }
}
