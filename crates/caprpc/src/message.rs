//! Decoded RPC message model
//!
//! The connection core operates on decoded messages; the schema-driven wire
//! serialization sits outside it. A [`Payload`] carries an opaque pointer
//! tree plus a capability table identifying which slots of that tree hold
//! capabilities, and a [`Transform`] selects a sub-object of a result by
//! walking pointer fields.

use std::fmt;

use bytes::Bytes;

/// An application-level or protocol-level exception carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exception {
    pub reason: String,
}

impl Exception {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl From<&crate::error::Error> for Exception {
    fn from(err: &crate::error::Error) -> Self {
        Exception::new(err.to_string())
    }
}

/// An opaque pointer tree: the decoded content of a payload.
///
/// Capability slots hold an index into the payload's capability table.
/// Transform application walks `Struct` pointer fields; null propagates,
/// matching pointer-default semantics of the wire encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Ptr {
    #[default]
    Null,
    Data(Bytes),
    Capability(u32),
    Struct(Vec<Ptr>),
}

impl Ptr {
    /// Read the byte content of a data pointer; null reads as empty.
    pub fn as_data(&self) -> Bytes {
        match self {
            Ptr::Data(b) => b.clone(),
            _ => Bytes::new(),
        }
    }
}

/// An ordered list of pointer-field indices locating a sub-object within a
/// result. The empty transform identifies the result root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Transform(pub Vec<u16>);

impl Transform {
    /// The identity transform.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn field(index: u16) -> Self {
        Self(vec![index])
    }

    /// Extend this transform with one more pointer-field selection.
    pub fn then_field(&self, index: u16) -> Self {
        let mut ops = self.0.clone();
        ops.push(index);
        Self(ops)
    }

    /// Apply the transform to a pointer tree. Absent fields and non-struct
    /// intermediates read as null.
    pub fn apply(&self, ptr: &Ptr) -> Ptr {
        let mut current = ptr;
        for &field in &self.0 {
            match current {
                Ptr::Struct(fields) => {
                    current = fields.get(field as usize).unwrap_or(&Ptr::Null);
                }
                _ => return Ptr::Null,
            }
        }
        current.clone()
    }
}

/// The wire taxonomy of capability references inside message payloads.
///
/// Sender and receiver are from the perspective of the vat sending the
/// enclosing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapDescriptor {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer { question_id: u32, transform: Transform },
    /// Level-3 three-party handoff; never produced, answered with
    /// `unimplemented` on receipt.
    ThirdPartyHosted,
}

/// A payload as carried by `call` and `return` messages: content plus the
/// capability table describing its capability slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    pub content: Ptr,
    pub cap_table: Vec<CapDescriptor>,
}

impl Payload {
    /// A payload with plain byte content and no capabilities.
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self {
            content: Ptr::Data(bytes.into()),
            cap_table: Vec::new(),
        }
    }
}

/// The addressee of a `call` or `disembargo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageTarget {
    /// A capability previously exported by the receiver.
    ImportedCap(u32),
    /// The (possibly future) result of one of the receiver's answers.
    PromisedAnswer { question_id: u32, transform: Transform },
}

/// Where the callee should deliver results. Only `Caller` is produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendResultsTo {
    #[default]
    Caller,
}

/// A method call on a target capability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub question_id: u32,
    pub target: MessageTarget,
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Payload,
    pub send_results_to: SendResultsTo,
    pub allow_third_party_tail_call: bool,
}

/// The body of a `return` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnVariant {
    Results(Payload),
    Exception(Exception),
    Canceled,
    /// Remaining variants belong to protocol levels this implementation
    /// does not speak; they are answered with `unimplemented` on receipt.
    ResultsSentElsewhere,
    TakeFromOtherQuestion(u32),
    AcceptFromThirdParty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Return {
    pub answer_id: u32,
    pub release_param_caps: bool,
    pub variant: ReturnVariant,
}

/// Disembargo context. Only the loopback variants are supported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisembargoContext {
    SenderLoopback(u32),
    ReceiverLoopback(u32),
    Accept,
    Provide(u32),
}

/// One decoded vat-to-vat message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Echo of a message the sender did not recognize.
    Unimplemented(Box<Message>),
    /// Terminal; the sender will close the connection.
    Abort(Exception),
    Bootstrap {
        question_id: u32,
    },
    Call(Call),
    Return(Return),
    Finish {
        question_id: u32,
        release_result_caps: bool,
    },
    Release {
        id: u32,
        reference_count: u32,
    },
    Disembargo {
        target: MessageTarget,
        context: DisembargoContext,
    },
    // Recognized but unsupported message kinds. Their bodies are not
    // modeled; the dispatcher echoes them back as `unimplemented`.
    Resolve,
    Provide,
    Accept,
    Join,
}

impl Message {
    pub fn unimplemented(original: Message) -> Message {
        Message::Unimplemented(Box::new(original))
    }

    pub fn abort(exception: Exception) -> Message {
        Message::Abort(exception)
    }

    pub fn finish(question_id: u32, release_result_caps: bool) -> Message {
        Message::Finish {
            question_id,
            release_result_caps,
        }
    }

    pub fn return_results(answer_id: u32, results: Payload) -> Message {
        Message::Return(Return {
            answer_id,
            release_param_caps: false,
            variant: ReturnVariant::Results(results),
        })
    }

    pub fn return_exception(answer_id: u32, exception: Exception) -> Message {
        Message::Return(Return {
            answer_id,
            release_param_caps: false,
            variant: ReturnVariant::Exception(exception),
        })
    }

    pub fn return_canceled(answer_id: u32) -> Message {
        Message::Return(Return {
            answer_id,
            release_param_caps: false,
            variant: ReturnVariant::Canceled,
        })
    }

    pub fn disembargo_sender_loopback(id: u32, target: MessageTarget) -> Message {
        Message::Disembargo {
            target,
            context: DisembargoContext::SenderLoopback(id),
        }
    }

    pub fn disembargo_receiver_loopback(id: u32, target: MessageTarget) -> Message {
        Message::Disembargo {
            target,
            context: DisembargoContext::ReceiverLoopback(id),
        }
    }

    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Unimplemented(_) => "unimplemented",
            Message::Abort(_) => "abort",
            Message::Bootstrap { .. } => "bootstrap",
            Message::Call(_) => "call",
            Message::Return(_) => "return",
            Message::Finish { .. } => "finish",
            Message::Release { .. } => "release",
            Message::Disembargo { .. } => "disembargo",
            Message::Resolve => "resolve",
            Message::Provide => "provide",
            Message::Accept => "accept",
            Message::Join => "join",
        }
    }
}
