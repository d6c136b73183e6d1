//! Shared fixtures for the connection tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use caprpc::{
    resolved_promise, CancellationToken, Capability, ChannelTransport, Client, Error, Message,
    Method, Params, Promise, Ptr, Resolution, Transport,
};

pub const TEST_INTERFACE: u64 = 0x5bd1_e000;

pub fn method(method_id: u16) -> Method {
    Method {
        interface_id: TEST_INTERFACE,
        method_id,
    }
}

/// Receive the next message the vat under test sent, with a watchdog.
pub async fn recv(transport: &ChannelTransport) -> Message {
    tokio::time::timeout(Duration::from_secs(5), transport.recv_message())
        .await
        .expect("timed out waiting for a message")
        .expect("transport closed")
}

/// Assert the vat under test stays quiet for a little while.
pub async fn expect_silence(transport: &ChannelTransport) {
    let outcome =
        tokio::time::timeout(Duration::from_millis(200), transport.recv_message()).await;
    assert!(outcome.is_err(), "unexpected message: {:?}", outcome);
}

/// Replies to every call with its own parameter bytes.
pub struct EchoCap;

#[async_trait]
impl Capability for EchoCap {
    async fn call(&self, _ctx: CancellationToken, _method: Method, params: Params) -> Promise {
        resolved_promise(Ok(Resolution::data(params.content.as_data())))
    }
}

/// Records the method IDs it is called with, in order, and replies with
/// "pong".
pub struct RecorderCap {
    pub order: Arc<Mutex<Vec<u16>>>,
}

impl RecorderCap {
    pub fn new() -> (Self, Arc<Mutex<Vec<u16>>>) {
        let order = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                order: Arc::clone(&order),
            },
            order,
        )
    }
}

#[async_trait]
impl Capability for RecorderCap {
    async fn call(&self, _ctx: CancellationToken, method: Method, _params: Params) -> Promise {
        self.order.lock().push(method.method_id);
        resolved_promise(Ok(Resolution::data("pong")))
    }
}

/// Blocks every call on a shared gate, then resolves to a struct whose
/// pointer field 0 is `inner`.
pub struct GateCap {
    pub gate: Arc<Notify>,
    pub inner: Client,
}

#[async_trait]
impl Capability for GateCap {
    async fn call(&self, _ctx: CancellationToken, _method: Method, _params: Params) -> Promise {
        let gate = Arc::clone(&self.gate);
        let inner = self.inner.clone();
        Box::pin(async move {
            gate.notified().await;
            Ok(Resolution {
                content: Ptr::Struct(vec![Ptr::Capability(0)]),
                caps: vec![Some(inner)],
            })
        })
    }
}

/// Hands out the same shared capability from every call.
pub struct ProviderCap {
    pub shared: Client,
}

#[async_trait]
impl Capability for ProviderCap {
    async fn call(&self, _ctx: CancellationToken, _method: Method, _params: Params) -> Promise {
        let shared = self.shared.clone();
        resolved_promise(Ok(Resolution {
            content: Ptr::Struct(vec![Ptr::Capability(0)]),
            caps: vec![Some(shared)],
        }))
    }
}

/// Resolves to a struct holding a fresh echo capability at field 0.
pub struct SelfServingCap;

#[async_trait]
impl Capability for SelfServingCap {
    async fn call(&self, _ctx: CancellationToken, method: Method, params: Params) -> Promise {
        match method.method_id {
            0 => resolved_promise(Ok(Resolution::data(params.content.as_data()))),
            _ => resolved_promise(Ok(Resolution {
                content: Ptr::Struct(vec![Ptr::Capability(0)]),
                caps: vec![Some(Client::new(EchoCap))],
            })),
        }
    }
}

/// Unwrap the `Err` of an awaited promise.
pub fn expect_err(outcome: caprpc::Result<Resolution>) -> Error {
    match outcome {
        Ok(_) => panic!("call unexpectedly succeeded"),
        Err(err) => err,
    }
}
