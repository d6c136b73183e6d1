//! End-to-end tests: two connections wired back to back through a
//! channel transport, exercising the public client surface.

mod common;

use std::time::Duration;

use caprpc::{CancellationToken, Client, Conn, ConnOptions, Error, Params};
use common::*;

fn vat_pair(options: ConnOptions) -> (Conn, Conn) {
    let (server_side, client_side) = caprpc::transport::channel(16);
    let server = Conn::new(server_side, options);
    let client = Conn::new(client_side, ConnOptions::new());
    (server, client)
}

#[tokio::test]
async fn echo_round_trip() {
    let (_server, client) =
        vat_pair(ConnOptions::new().main_interface(Client::new(EchoCap)));

    let ctx = CancellationToken::new();
    let echo = client.bootstrap(ctx.clone()).await;
    let reply = echo
        .call(ctx, method(0), Params::data("hello, vat"))
        .await
        .await
        .unwrap();
    assert_eq!(reply.content.as_data().as_ref(), b"hello, vat");
}

#[tokio::test]
async fn calls_pipeline_through_an_unreturned_result() {
    let (_server, client) =
        vat_pair(ConnOptions::new().main_interface(Client::new(SelfServingCap)));

    let ctx = CancellationToken::new();
    let root = client.bootstrap(ctx.clone()).await;

    // Ask for the struct-valued result, and call through its field 0
    // without waiting for it.
    let (self_promise, self_result) = root
        .call_with_pipeline(ctx.clone(), method(1), Params::empty())
        .await;
    let reply = self_result
        .pipeline(0)
        .call(ctx, method(0), Params::data("early bird"))
        .await
        .await
        .unwrap();
    assert_eq!(reply.content.as_data().as_ref(), b"early bird");
    self_promise.await.unwrap();
}

#[tokio::test]
async fn per_capability_order_survives_resolution_and_disembargo() {
    let (recorder, order) = RecorderCap::new();
    let (_server, client) =
        vat_pair(ConnOptions::new().main_interface(Client::new(recorder)));

    let ctx = CancellationToken::new();
    let target = client.bootstrap(ctx.clone()).await;

    // Two calls race the bootstrap resolution along the promise path.
    let first = target.call(ctx.clone(), method(1), Params::empty()).await;
    let second = target.call(ctx.clone(), method(2), Params::empty()).await;
    // After resolution the short path is embargoed until the loopback.
    target.when_resolved().await.unwrap();
    let third = target.call(ctx, method(3), Params::empty()).await;

    first.await.unwrap();
    second.await.unwrap();
    third.await.unwrap();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[tokio::test]
async fn bootstrap_errors_propagate_to_calls() {
    let (_server, client) = vat_pair(ConnOptions::new());

    let ctx = CancellationToken::new();
    let main = client.bootstrap(ctx.clone()).await;
    let err = expect_err(main.call(ctx, method(0), Params::empty()).await.await);
    // Depending on whether the call raced the bootstrap's return, the
    // rejection is either wrapped with the method identity or raw.
    assert!(
        err.to_string().contains("no main interface"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn close_is_idempotent_and_fails_outstanding_calls() {
    let gate = std::sync::Arc::new(tokio::sync::Notify::new());
    let (_server, client) = vat_pair(ConnOptions::new().main_interface(Client::new(GateCap {
        gate,
        inner: Client::new(EchoCap),
    })));

    let ctx = CancellationToken::new();
    let main = client.bootstrap(ctx.clone()).await;
    // This call never resolves: the gate stays shut.
    let stuck = main.call(ctx, method(1), Params::empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await.unwrap();
    assert!(client.close().await.is_err());

    let err = expect_err(stuck.await);
    assert!(
        err.to_string().contains("connection closed"),
        "unexpected error: {err}"
    );
    assert!(matches!(client.wait().await, Error::ConnClosed));
}

#[tokio::test]
async fn bootstrap_after_close_returns_an_error_client() {
    let (_server, client) = vat_pair(ConnOptions::new());
    client.close().await.unwrap();

    let ctx = CancellationToken::new();
    let main = client.bootstrap(ctx.clone()).await;
    let err = expect_err(main.call(ctx, method(0), Params::empty()).await.await);
    assert!(matches!(err, Error::ConnClosed | Error::Method { .. }));
}
