//! Error types for the RPC connection core

use std::sync::Arc;

use thiserror::Error;

use crate::capability::Method;
use crate::message::Exception;

/// Errors produced by the connection core.
///
/// The type is `Clone` because a connection's terminal error is fanned out
/// to every outstanding question and blocked caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("connection closed")]
    ConnClosed,

    /// The remote vat sent an `abort`; it will close its end.
    #[error("connection aborted by remote vat: {0}")]
    Aborted(Exception),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The caller's context was canceled before the call resolved.
    #[error("call canceled")]
    Canceled,

    /// The peer reported that it canceled execution of our call.
    #[error("receiver reported canceled")]
    ReceiverCanceled,

    /// An exception returned by the remote vat.
    #[error("remote exception: {0}")]
    Remote(Exception),

    #[error("no main interface")]
    NoMainInterface,

    #[error("question ID reused")]
    QuestionReused,

    /// The call target does not name a live export or answer.
    #[error("bad target")]
    BadTarget,

    /// A capability slot held no capability.
    #[error("null capability")]
    NullCapability,

    /// A capability was used after its promise terminated without a target.
    #[error("promise was never resolved")]
    Unresolved,

    /// The peer sent a message (or descriptor variant) this implementation
    /// does not handle; an `unimplemented` echo was returned.
    #[error("unimplemented message")]
    Unimplemented,

    #[error("capability table references unknown export ID {0}")]
    UnknownExport(u32),

    #[error("capability table references unknown answer ID {0}")]
    UnknownAnswer(u32),

    #[error("export ID {0} released too many times")]
    OverRelease(u32),

    #[error("disembargo target is not a promised answer")]
    DisembargoNonPromise,

    #[error("disembargo references unknown answer ID {0}")]
    DisembargoMissingAnswer(u32),

    #[error("disembargo echoes unknown embargo ID {0}")]
    UnknownEmbargo(u32),

    /// A call on a specific method failed; wraps the underlying error with
    /// the method identity.
    #[error("call to {method} failed: {source}")]
    Method {
        method: Method,
        #[source]
        source: Box<Error>,
    },

    /// A bootstrap question failed.
    #[error("bootstrap call failed: {0}")]
    Bootstrap(#[source] Box<Error>),
}

impl Error {
    /// Wrap an error with the identity of the call it failed, matching how
    /// the error will surface to the caller: method calls carry the method,
    /// bootstrap questions carry a bootstrap wrapper.
    pub(crate) fn for_question(self, method: Option<Method>) -> Error {
        match method {
            Some(method) => Error::Method {
                method,
                source: Box::new(self),
            },
            None => Error::Bootstrap(Box::new(self)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
