//! Reference-counted capability wrapper
//!
//! Several table entries (and the connection's own main-interface closer)
//! can hold independent references to one local capability. The wrapper
//! counts those references and releases the underlying capability exactly
//! once, when the last one drops.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::capability::{Capability, Client, Method, Params, Promise};

/// Shared core of a reference-counted capability.
pub struct RefCounted {
    inner: Client,
    refs: AtomicUsize,
}

impl RefCounted {
    /// Wrap `client`, returning the shared core and the first reference.
    pub fn new(client: Client) -> (Arc<RefCounted>, Client) {
        let rc = Arc::new(RefCounted {
            inner: client,
            refs: AtomicUsize::new(0),
        });
        let first = rc.new_ref();
        (rc, first)
    }

    /// Create one more tracked reference.
    pub fn new_ref(self: &Arc<Self>) -> Client {
        self.refs.fetch_add(1, Ordering::SeqCst);
        Client::new(RefClient {
            rc: Arc::clone(self),
            released: AtomicBool::new(false),
        })
    }

    fn drop_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.release();
        }
    }
}

/// One tracked reference. Releasing it (explicitly or by drop) decrements
/// the shared count; the count reaching zero releases the wrapped
/// capability.
struct RefClient {
    rc: Arc<RefCounted>,
    released: AtomicBool,
}

impl RefClient {
    fn release_once(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.rc.drop_ref();
        }
    }
}

#[async_trait]
impl Capability for RefClient {
    async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise {
        self.rc.inner.call(ctx, method, params).await
    }

    fn release(&self) {
        self.release_once();
    }
}

impl Drop for RefClient {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{resolved_promise, Resolution};

    struct CountingCap {
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for CountingCap {
        async fn call(&self, _ctx: CancellationToken, _m: Method, _p: Params) -> Promise {
            resolved_promise(Ok(Resolution::data("ok")))
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn releases_underlying_exactly_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let cap = Client::new(CountingCap {
            releases: Arc::clone(&releases),
        });
        let (rc, ref1) = RefCounted::new(cap);
        let ref2 = rc.new_ref();

        ref1.release();
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        // Releasing the same reference twice does not double-count.
        ref1.release();
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        ref2.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn calls_pass_through() {
        let releases = Arc::new(AtomicUsize::new(0));
        let (_rc, r) = RefCounted::new(Client::new(CountingCap { releases }));
        let method = Method {
            interface_id: 0,
            method_id: 0,
        };
        let out = r
            .call(CancellationToken::new(), method, Params::empty())
            .await
            .await
            .unwrap();
        assert_eq!(out.content.as_data().as_ref(), b"ok");
    }
}
