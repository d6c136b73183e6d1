//! Echo Vat Demo
//!
//! Runs two vats in one process, connected by a channel transport. The
//! server vat exposes an echo capability as its main interface; the
//! client vat bootstraps it, makes a few direct calls, then demonstrates
//! promise pipelining by calling through a capability-valued result
//! before it has arrived.
//!
//! Usage:
//!   cargo run -p echo-vat

use async_trait::async_trait;
use bytes::Bytes;
use caprpc::{
    resolved_promise, CancellationToken, Capability, Client, Conn, ConnOptions, Error, Method,
    Params, Promise, Ptr, Resolution,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Interface ID for the echo service.
const ECHO_INTERFACE: u64 = 0xeceb_a11e_0001;

/// Operation numbers
const OP_ECHO: u16 = 0;
const OP_REVERSE: u16 = 1;
/// Returns a struct whose pointer field 0 is the echo capability itself.
const OP_SELF: u16 = 2;

struct EchoCap;

#[async_trait]
impl Capability for EchoCap {
    async fn call(&self, _ctx: CancellationToken, method: Method, params: Params) -> Promise {
        let input = params.content.as_data();
        match method.method_id {
            OP_ECHO => {
                info!("OP_ECHO called with {} bytes", input.len());
                resolved_promise(Ok(Resolution::data(input)))
            }
            OP_REVERSE => {
                info!("OP_REVERSE called with {} bytes", input.len());
                let mut reversed: Vec<u8> = input.to_vec();
                reversed.reverse();
                resolved_promise(Ok(Resolution::data(Bytes::from(reversed))))
            }
            OP_SELF => {
                info!("OP_SELF called");
                resolved_promise(Ok(Resolution {
                    content: Ptr::Struct(vec![Ptr::Capability(0)]),
                    caps: vec![Some(Client::new(EchoCap))],
                }))
            }
            other => resolved_promise(Err(Error::Remote(caprpc::Exception::new(format!(
                "no such operation: {other}"
            ))))),
        }
    }
}

fn method(method_id: u16) -> Method {
    Method {
        interface_id: ECHO_INTERFACE,
        method_id,
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing subscriber");

    let (server_side, client_side) = caprpc::transport::channel(16);

    let server = Conn::new(
        server_side,
        ConnOptions::new().main_interface(Client::new(EchoCap)),
    );
    let client = Conn::new(client_side, ConnOptions::new());

    let ctx = CancellationToken::new();
    let echo = client.bootstrap(ctx.clone()).await;

    // Direct calls on the bootstrap capability.
    let reply = echo
        .call(ctx.clone(), method(OP_ECHO), Params::data("hello, vat"))
        .await
        .await
        .expect("echo call");
    info!("echo replied: {:?}", reply.content.as_data());

    let reply = echo
        .call(ctx.clone(), method(OP_REVERSE), Params::data("pipelined"))
        .await
        .await
        .expect("reverse call");
    info!("reverse replied: {:?}", reply.content.as_data());

    // Promise pipelining: call OP_ECHO on field 0 of the OP_SELF result
    // without waiting for that result to come back.
    let (self_promise, self_result) = echo
        .call_with_pipeline(ctx.clone(), method(OP_SELF), Params::empty())
        .await;
    let pipelined = self_result.pipeline(0);
    let reply = pipelined
        .call(ctx.clone(), method(OP_ECHO), Params::data("early bird"))
        .await
        .await
        .expect("pipelined call");
    info!("pipelined echo replied: {:?}", reply.content.as_data());
    self_promise.await.expect("self call");

    client.close().await.expect("close client connection");
    let err = server.wait().await;
    info!("server connection finished: {err}");
}
