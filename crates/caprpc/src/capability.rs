//! The capability interface the connection core is built on
//!
//! The core does not define an object model. It depends on three things a
//! capability can do: start a call, release its underlying resource, and
//! report when a promised capability has resolved. Everything else (method
//! dispatch tables, generated stubs) lives above this crate.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::answer::AnswerPipelineClient;
use crate::connection::ConnCore;
use crate::error::{Error, Result};
use crate::ids::{AnswerId, ImportId};
use crate::message::{Ptr, Transform};
use crate::promise::PromiseShared;
use crate::question::Question;

/// Identity of one method on one interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Method {
    pub interface_id: u64,
    pub method_id: u16,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method {:#x}/{}", self.interface_id, self.method_id)
    }
}

/// The eventual outcome of a call.
pub type Promise = Pin<Box<dyn Future<Output = Result<Resolution>> + Send + 'static>>;

/// Build a promise that is already resolved.
pub fn resolved_promise(result: Result<Resolution>) -> Promise {
    Box::pin(std::future::ready(result))
}

/// A payload whose capability table has been resolved into live clients:
/// the parameters handed to a local call, or the result a question or
/// answer resolved to.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    pub content: Ptr,
    pub caps: Vec<Option<Client>>,
}

/// Call parameters are the same shape as a resolved result.
pub type Params = Resolution;

impl Resolution {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Plain byte content, no capabilities.
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self {
            content: Ptr::Data(bytes.into()),
            caps: Vec::new(),
        }
    }

    /// A single capability at the content root.
    pub fn capability(client: Client) -> Self {
        Self {
            content: Ptr::Capability(0),
            caps: vec![Some(client)],
        }
    }

    /// Extract the capability a transform points at. Produces an error
    /// client (rather than an error) so the result can always be called.
    pub fn client(&self, transform: &Transform) -> Client {
        match transform.apply(&self.content) {
            Ptr::Capability(index) => match self.caps.get(index as usize) {
                Some(Some(client)) => client.clone(),
                _ => Client::from_error(Error::NullCapability),
            },
            _ => Client::from_error(Error::NullCapability),
        }
    }
}

/// The minimal behavior the core requires of a capability implementation.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    /// Begin a call. The returned future is the call's promise; `call`
    /// itself resolves once the call has been dispatched and must not wait
    /// for other RPC activity first (run long work inside the promise).
    async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise;

    /// Invoked once when the last tracked reference to this capability is
    /// dropped.
    fn release(&self) {}
}

/// How the connection core classifies a client it is asked to transmit or
/// dispatch to. `Other` covers application capabilities; the remaining
/// variants are clients this crate itself created, which the dispatcher
/// must route through the connection tables instead of calling directly.
#[derive(Clone)]
pub(crate) enum ClientKind {
    Other,
    Error(Error),
    Import {
        conn: Weak<ConnCore>,
        id: ImportId,
    },
    QuestionPipeline {
        conn: Weak<ConnCore>,
        question: Arc<Question>,
        transform: Transform,
    },
    AnswerPipeline {
        conn: Weak<ConnCore>,
        answer: AnswerId,
        transform: Transform,
    },
    Promise {
        shared: Arc<PromiseShared>,
        transform: Transform,
    },
}

/// A reference to a capability, local or remote.
///
/// Cloning is cheap and shares the underlying capability; the capability's
/// `release` runs when its owning table entry is dropped, not per clone.
#[derive(Clone)]
pub struct Client {
    hook: Arc<dyn Capability>,
    kind: ClientKind,
}

impl Client {
    /// Wrap an application capability.
    pub fn new(capability: impl Capability) -> Self {
        Self {
            hook: Arc::new(capability),
            kind: ClientKind::Other,
        }
    }

    /// A promise client backed by an arbitrary promise: calls buffer
    /// until the promise resolves, then replay in order against the
    /// resolved target. Must be called from within a runtime.
    pub fn from_promise(promise: Promise) -> Self {
        PromiseShared::spawn(promise).client(Transform::root())
    }

    /// A client whose every call fails with `err`.
    pub fn from_error(err: Error) -> Self {
        Self {
            hook: Arc::new(ErrorClient { err: err.clone() }),
            kind: ClientKind::Error(err),
        }
    }

    pub(crate) fn with_kind(hook: Arc<dyn Capability>, kind: ClientKind) -> Self {
        Self { hook, kind }
    }

    pub(crate) fn kind(&self) -> &ClientKind {
        &self.kind
    }

    /// Identity comparison: two clients are the same capability if they
    /// share the same underlying hook.
    pub fn same_capability(&self, other: &Client) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.hook), Arc::as_ptr(&other.hook))
    }

    /// Begin a call on this capability.
    pub async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise {
        self.hook.call(ctx, method, params).await
    }

    /// Derive a client for a pointer field of this client's eventual
    /// resolution. Meaningful only for promise clients (pipelines); on a
    /// settled client this yields an error client.
    pub fn pipeline(&self, field: u16) -> Client {
        match &self.kind {
            ClientKind::QuestionPipeline {
                conn,
                question,
                transform,
            } => match conn.upgrade() {
                Some(core) => {
                    Question::pipeline_client(question, &core, transform.then_field(field))
                }
                None => Client::from_error(Error::ConnClosed),
            },
            ClientKind::AnswerPipeline {
                conn,
                answer,
                transform,
            } => AnswerPipelineClient::client(conn.clone(), *answer, transform.then_field(field)),
            ClientKind::Promise { shared, transform } => {
                shared.client(transform.then_field(field))
            }
            ClientKind::Error(err) => Client::from_error(err.clone()),
            ClientKind::Other | ClientKind::Import { .. } => {
                Client::from_error(Error::Unresolved)
            }
        }
    }

    /// Wait until a promise client has settled. Settled clients return
    /// immediately.
    pub async fn when_resolved(&self) -> Result<()> {
        match &self.kind {
            ClientKind::QuestionPipeline { question, .. } => question.resolved().await,
            ClientKind::Promise { shared, .. } => shared.outcome().await.map(|_| ()),
            ClientKind::Error(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Release the underlying capability. Called by the owning table when
    /// the last tracked reference drops.
    pub fn release(&self) {
        self.hook.release();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ClientKind::Other => "local",
            ClientKind::Error(_) => "error",
            ClientKind::Import { .. } => "import",
            ClientKind::QuestionPipeline { .. } => "question-pipeline",
            ClientKind::AnswerPipeline { .. } => "answer-pipeline",
            ClientKind::Promise { .. } => "promise",
        };
        write!(f, "Client({kind})")
    }
}

struct ErrorClient {
    err: Error,
}

#[async_trait]
impl Capability for ErrorClient {
    async fn call(&self, _ctx: CancellationToken, _method: Method, _params: Params) -> Promise {
        resolved_promise(Err(self.err.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_client_fails_calls() {
        let client = Client::from_error(Error::NoMainInterface);
        let method = Method {
            interface_id: 1,
            method_id: 0,
        };
        let promise = client
            .call(CancellationToken::new(), method, Params::empty())
            .await;
        assert!(matches!(promise.await, Err(Error::NoMainInterface)));
    }

    #[tokio::test]
    async fn resolution_extracts_capability() {
        let inner = Client::from_error(Error::BadTarget);
        let res = Resolution {
            content: Ptr::Struct(vec![Ptr::Null, Ptr::Capability(0)]),
            caps: vec![Some(inner.clone())],
        };
        let out = res.client(&Transform::field(1));
        assert!(out.same_capability(&inner));

        // Null slots and non-capability pointers surface as error clients.
        let promise = res
            .client(&Transform::field(0))
            .call(
                CancellationToken::new(),
                Method {
                    interface_id: 0,
                    method_id: 0,
                },
                Params::empty(),
            )
            .await;
        assert!(matches!(promise.await, Err(Error::NullCapability)));
    }

    #[test]
    fn pipeline_on_settled_client_is_an_error() {
        let client = Client::new(NoopCap);
        let derived = client.pipeline(0);
        assert!(matches!(derived.kind(), ClientKind::Error(_)));
    }

    struct NoopCap;

    #[async_trait]
    impl Capability for NoopCap {
        async fn call(&self, _ctx: CancellationToken, _m: Method, _p: Params) -> Promise {
            resolved_promise(Ok(Resolution::empty()))
        }
    }
}
