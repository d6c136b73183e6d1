//! Connection core for a capability-based object RPC protocol
//!
//! This crate implements one bidirectional vat-to-vat connection: the
//! bookkeeping of questions, answers, imports and exports, promise
//! pipelining, capability reference counting, and the embargo protocol
//! that preserves per-capability message ordering across path shortening.
//!
//! The wire serialization and the transport are external: the connection
//! consumes decoded [`message::Message`] values from a [`Transport`] and
//! emits them back. The in-process object model is external too; the core
//! depends only on the small [`Capability`] trait.
//!
//! # Example
//!
//! Two vats in one process, connected by a channel transport:
//!
//! ```no_run
//! use caprpc::{
//!     resolved_promise, CancellationToken, Capability, Client, Conn, ConnOptions, Method,
//!     Params, Promise, Resolution,
//! };
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Capability for Echo {
//!     async fn call(&self, _ctx: CancellationToken, _method: Method, params: Params) -> Promise {
//!         resolved_promise(Ok(Resolution::data(params.content.as_data())))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (server_side, client_side) = caprpc::transport::channel(16);
//!     let _server = Conn::new(
//!         server_side,
//!         ConnOptions::new().main_interface(Client::new(Echo)),
//!     );
//!     let client = Conn::new(client_side, ConnOptions::new());
//!
//!     let ctx = CancellationToken::new();
//!     let echo = client.bootstrap(ctx.clone()).await;
//!     let method = Method { interface_id: 1, method_id: 0 };
//!     let reply = echo
//!         .call(ctx, method, Params::data("hi"))
//!         .await
//!         .await
//!         .unwrap();
//!     assert_eq!(reply.content.as_data().as_ref(), b"hi");
//! }
//! ```
//!
//! # Level-1 simplifications
//!
//! `senderPromise` descriptors are handled exactly like `senderHosted`
//! ones and `resolve` messages are answered with `unimplemented`: promise
//! resolution updates from the peer are not tracked separately. Messages
//! keep flowing correctly, at the cost of the resolve-to-exception and
//! local-shortcut optimizations.

pub mod capability;
pub mod connection;
pub mod error;
pub mod ids;
pub mod manager;
pub mod message;
pub mod refcount;
pub mod transport;

mod answer;
mod embargo;
mod promise;
mod question;

pub use capability::{
    resolved_promise, Capability, Client, Method, Params, Promise, Resolution,
};
pub use connection::{Conn, ConnOptions, DEFAULT_SEND_BUFFER_SIZE};
pub use error::{Error, Result};
pub use message::{
    Call, CapDescriptor, DisembargoContext, Exception, Message, MessageTarget, Payload, Ptr,
    Return, ReturnVariant, SendResultsTo, Transform,
};
pub use refcount::RefCounted;
pub use transport::{ChannelTransport, Transport};

// Cancellation contexts are plain tokio-util tokens; re-exported so
// callers need not depend on tokio-util themselves.
pub use tokio_util::sync::CancellationToken;
