//! Embargoed delivery targets
//!
//! When a promise resolves to a capability hosted by the peer, calls sent
//! the short way could overtake calls still queued along the old promise
//! path. Until the peer echoes the disembargo loopback, the resolved
//! target is wrapped in an embargo client that buffers calls; lifting the
//! embargo replays them in order and then steps out of the way.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::capability::{
    resolved_promise, Capability, Client, ClientKind, Method, Params, Promise,
};
use crate::error::Error;
use crate::manager::Manager;

enum Phase {
    /// Waiting for the loopback echo; calls are buffered.
    Holding,
    /// Echo received; buffered calls are being replayed in order. New
    /// calls join the back of the queue.
    Draining,
    /// Buffer empty; calls pass straight through.
    Lifted,
    /// The connection died before the echo arrived.
    Failed(Error),
}

struct Queued {
    ctx: CancellationToken,
    method: Method,
    params: Params,
    tx: oneshot::Sender<Promise>,
}

pub(crate) struct EmbargoClient {
    inner: Client,
    state: Mutex<State>,
}

struct State {
    phase: Phase,
    queue: VecDeque<Queued>,
}

impl EmbargoClient {
    pub(crate) fn new(inner: Client) -> Arc<Self> {
        Arc::new(Self {
            inner,
            state: Mutex::new(State {
                phase: Phase::Holding,
                queue: VecDeque::new(),
            }),
        })
    }

    /// The client callers see. Classified as an ordinary capability: while
    /// embargoed it must not short-circuit back into the tables.
    pub(crate) fn client(self: &Arc<Self>) -> Client {
        Client::with_kind(Arc::clone(self) as Arc<dyn Capability>, ClientKind::Other)
    }

    /// The loopback echo arrived: replay buffered calls in order, then
    /// pass through. The replay runs as a supervised task because starting
    /// a buffered call may need the connection lock.
    pub(crate) fn lift(self: &Arc<Self>, manager: &Manager) {
        {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Holding) {
                return;
            }
            state.phase = Phase::Draining;
        }
        let this = Arc::clone(self);
        manager.spawn(async move {
            loop {
                let next = {
                    let mut state = this.state.lock();
                    match state.queue.pop_front() {
                        Some(next) => next,
                        None => {
                            state.phase = Phase::Lifted;
                            return;
                        }
                    }
                };
                // Start sequentially so the target observes queue order;
                // completion is awaited by each caller on its own promise.
                let promise = this.inner.call(next.ctx, next.method, next.params).await;
                let _ = next.tx.send(promise);
            }
        });
    }

    /// Terminate the embargo without an echo; buffered and future calls
    /// fail with `err`.
    pub(crate) fn fail(&self, err: Error) {
        let drained = {
            let mut state = self.state.lock();
            state.phase = Phase::Failed(err.clone());
            std::mem::take(&mut state.queue)
        };
        for queued in drained {
            let _ = queued.tx.send(resolved_promise(Err(err.clone())));
        }
    }
}

#[async_trait]
impl Capability for EmbargoClient {
    async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise {
        {
            let mut state = self.state.lock();
            match &state.phase {
                Phase::Lifted => {}
                Phase::Failed(err) => {
                    return resolved_promise(Err(err.clone()));
                }
                Phase::Holding | Phase::Draining => {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(Queued {
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
        }
        self.inner.call(ctx, method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Resolution;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        order: Mutex<Vec<u16>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Capability for Arc<Recorder> {
        async fn call(&self, _ctx: CancellationToken, method: Method, _p: Params) -> Promise {
            self.order.lock().push(method.method_id);
            self.calls.fetch_add(1, Ordering::SeqCst);
            resolved_promise(Ok(Resolution::empty()))
        }
    }

    fn method(id: u16) -> Method {
        Method {
            interface_id: 0,
            method_id: id,
        }
    }

    #[tokio::test]
    async fn buffers_until_lifted_and_preserves_order() {
        let recorder = Arc::new(Recorder {
            order: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let embargo = EmbargoClient::new(Client::new(Arc::clone(&recorder)));
        let manager = Manager::new();

        let ctx = CancellationToken::new();
        let p1 = embargo
            .call(ctx.clone(), method(1), Params::empty())
            .await;
        let p2 = embargo
            .call(ctx.clone(), method(2), Params::empty())
            .await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);

        embargo.lift(&manager);
        p1.await.unwrap();
        p2.await.unwrap();

        let p3 = embargo.call(ctx, method(3), Params::empty()).await;
        p3.await.unwrap();
        assert_eq!(*recorder.order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_embargo_rejects_buffered_calls() {
        let recorder = Arc::new(Recorder {
            order: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let embargo = EmbargoClient::new(Client::new(Arc::clone(&recorder)));

        let promise = embargo
            .call(CancellationToken::new(), method(1), Params::empty())
            .await;
        embargo.fail(Error::ConnClosed);
        assert!(matches!(promise.await, Err(Error::ConnClosed)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);

        let promise = embargo
            .call(CancellationToken::new(), method(2), Params::empty())
            .await;
        assert!(matches!(promise.await, Err(Error::ConnClosed)));
    }
}
