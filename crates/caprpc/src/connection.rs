//! The vat-to-vat connection
//!
//! One `Conn` multiplexes method calls, promise pipelining, capability
//! reference counting and disembargoes over a framed message transport.
//! All four tables (questions, answers, imports, exports) plus the
//! embargo registry live behind a single connection mutex; the mutex is a
//! `tokio::sync::Mutex` so acquisition composes with cancellation in a
//! `select!`. Outbound `call` and `bootstrap` messages are enqueued while
//! the mutex is held, which makes the order the peer observes equal to
//! the order the table mutations happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::answer::{Answer, AnswerPipelineClient, CallSink, QueuedCall};
use crate::capability::{
    resolved_promise, Capability, Client, ClientKind, Method, Params, Promise, Resolution,
};
use crate::embargo::EmbargoClient;
use crate::error::{Error, Result};
use crate::ids::{AnswerId, EmbargoId, ExportId, IdGen, ImportId, QuestionId};
use crate::manager::Manager;
use crate::message::{
    Call, CapDescriptor, DisembargoContext, Exception, Message, MessageTarget, Payload, Return,
    ReturnVariant, SendResultsTo, Transform,
};
use crate::promise::PromiseShared;
use crate::question::{Question, QuestionStage};
use crate::refcount::RefCounted;
use crate::transport::Transport;

/// Default number of outbound messages buffered ahead of the transport.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 4;

/// Cap on how many promise-resolution hops the dispatcher follows before
/// declaring a client undeliverable. A hostile peer can tie answers to
/// each other in a knot; well-formed traffic never gets near this.
const MAX_TARGET_HOPS: usize = 32;

type BootstrapFn = Arc<dyn Fn(CancellationToken) -> Result<Client> + Send + Sync>;

/// Configuration for a connection.
#[derive(Default)]
pub struct ConnOptions {
    main_func: Option<BootstrapFn>,
    main_closer: Option<Client>,
    send_buffer_size: Option<usize>,
}

impl ConnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer bootstrap messages with references to `client`. The client
    /// is released when the connection shuts down. Mutually exclusive
    /// with [`ConnOptions::bootstrap_func`]; the last setting wins, and
    /// a previously configured main interface is released.
    pub fn main_interface(mut self, client: Client) -> Self {
        if let Some(closer) = self.main_closer.take() {
            closer.release();
        }
        let (rc, closer) = RefCounted::new(client);
        self.main_func = Some(Arc::new(move |_ctx| Ok(rc.new_ref())));
        self.main_closer = Some(closer);
        self
    }

    /// Answer bootstrap messages by calling `f`. The function must not
    /// make RPCs or block. A previously configured main interface is
    /// released.
    pub fn bootstrap_func<F>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Result<Client> + Send + Sync + 'static,
    {
        if let Some(closer) = self.main_closer.take() {
            closer.release();
        }
        self.main_func = Some(Arc::new(f));
        self.main_closer = None;
        self
    }

    /// Number of outgoing messages to buffer, in addition to whatever
    /// buffering the transport performs. Defaults to 4.
    pub fn send_buffer_size(mut self, messages: usize) -> Self {
        self.send_buffer_size = Some(messages.max(1));
        self
    }
}

struct Export {
    client: Client,
    /// References the peer holds; the entry exists only while this is
    /// positive.
    refs: u32,
}

pub(crate) struct ConnState {
    questions: HashMap<QuestionId, Arc<Question>>,
    question_ids: IdGen,
    pub(crate) answers: HashMap<AnswerId, Answer>,
    exports: HashMap<ExportId, Export>,
    export_ids: IdGen,
    imports: HashMap<ImportId, Weak<ImportClient>>,
    embargoes: HashMap<EmbargoId, Arc<EmbargoClient>>,
    embargo_ids: IdGen,
}

impl ConnState {
    fn new() -> Self {
        Self {
            questions: HashMap::new(),
            question_ids: IdGen::new(),
            answers: HashMap::new(),
            exports: HashMap::new(),
            export_ids: IdGen::new(),
            imports: HashMap::new(),
            embargoes: HashMap::new(),
            embargo_ids: IdGen::new(),
        }
    }
}

pub(crate) struct ConnCore {
    pub(crate) manager: Manager,
    out: mpsc::Sender<Message>,
    state: Mutex<ConnState>,
    transport: Arc<dyn Transport>,
    /// Root context for inbound call execution; canceled on shutdown.
    root_ctx: CancellationToken,
    main_func: Option<BootstrapFn>,
    main_closer: Option<Client>,
}

/// A connection to another vat. Cheap to share; all methods take `&self`.
pub struct Conn {
    core: Arc<ConnCore>,
}

impl Conn {
    /// Create a connection speaking over `transport` and start its
    /// background tasks. Must be called within a tokio runtime.
    pub fn new(transport: impl Transport, options: ConnOptions) -> Conn {
        let manager = Manager::new();
        let send_buffer = options.send_buffer_size.unwrap_or(DEFAULT_SEND_BUFFER_SIZE);
        let (out_tx, out_rx) = mpsc::channel(send_buffer);
        let core = Arc::new(ConnCore {
            manager: manager.clone(),
            out: out_tx,
            state: Mutex::new(ConnState::new()),
            transport: Arc::new(transport),
            root_ctx: CancellationToken::new(),
            main_func: options.main_func,
            main_closer: options.main_closer,
        });
        manager.spawn(recv_loop(Arc::clone(&core)));
        manager.spawn(send_loop(Arc::clone(&core), out_rx));
        manager.spawn(finalize(Arc::clone(&core)));
        Conn { core }
    }

    /// Ask the remote vat for its main interface. The returned client can
    /// be used immediately; calls pipeline on the outstanding bootstrap
    /// question until it resolves.
    pub async fn bootstrap(&self, ctx: CancellationToken) -> Client {
        let core = &self.core;
        let mut state = match core.lock(Some(&ctx)).await {
            Ok(state) => state,
            Err(err) => return Client::from_error(err),
        };
        let id = QuestionId(state.question_ids.next());
        let question = Question::new(id, None);
        state.questions.insert(id, Arc::clone(&question));
        let msg = Message::Bootstrap { question_id: id.0 };
        // The mutex is held while enqueueing so call order is preserved.
        tokio::select! {
            sent = core.out.send(msg) => match sent {
                Ok(()) => {
                    question.start();
                    core.watch_cancellation(&question, ctx.clone());
                    Question::pipeline_client(&question, core, Transform::root())
                }
                Err(_) => {
                    core.drop_question(&mut state, id);
                    Client::from_error(Error::ConnClosed)
                }
            },
            _ = ctx.cancelled() => {
                core.drop_question(&mut state, id);
                Client::from_error(Error::Canceled)
            }
            _ = core.manager.cancelled() => {
                core.drop_question(&mut state, id);
                Client::from_error(core.manager.error())
            }
        }
    }

    /// Block until the connection terminates; returns the terminal error
    /// (a closed-connection error or the remote abort).
    pub async fn wait(&self) -> Error {
        self.core.manager.wait().await;
        self.core.manager.error()
    }

    /// Shut the connection down: stop the loops, send a best-effort abort
    /// and close the transport. Idempotent; later calls return the closed
    /// error.
    pub async fn close(&self) -> Result<()> {
        if !self.core.manager.shutdown(Error::ConnClosed) {
            return Err(Error::ConnClosed);
        }
        self.core.manager.wait().await;
        // The loops are gone; talk to the transport directly.
        if let Err(err) = self
            .core
            .transport
            .send_message(Message::abort(Exception::new("connection closed")))
            .await
        {
            debug!("abort on close not delivered: {err}");
        }
        self.core.transport.close().await
    }
}

async fn recv_loop(core: Arc<ConnCore>) {
    loop {
        let msg = tokio::select! {
            msg = core.transport.recv_message() => msg,
            _ = core.manager.cancelled() => return,
        };
        match msg {
            Ok(msg) => core.handle_message(msg).await,
            Err(err) => {
                core.manager.shutdown(err);
                return;
            }
        }
    }
}

async fn send_loop(core: Arc<ConnCore>, mut out: mpsc::Receiver<Message>) {
    loop {
        tokio::select! {
            // Prefer draining queued messages over the shutdown signal so
            // a final abort still reaches the peer.
            biased;

            next = out.recv() => match next {
                Some(msg) => {
                    if let Err(err) = core.transport.send_message(msg).await {
                        core.manager.shutdown(err);
                        return;
                    }
                }
                None => return,
            },
            _ = core.manager.cancelled() => return,
        }
    }
}

/// Runs once shutdown begins: cancels inbound work, fails everything
/// still outstanding and releases held capabilities.
async fn finalize(core: Arc<ConnCore>) {
    core.manager.cancelled().await;
    core.root_ctx.cancel();
    let err = core.manager.error();
    let mut state = core.state.lock().await;
    for (_, question) in state.questions.drain() {
        question.reject(QuestionStage::Resolved, err.clone());
    }
    for (_, embargo) in state.embargoes.drain() {
        embargo.fail(err.clone());
    }
    for (_, answer) in state.answers.drain() {
        answer.cancel.cancel();
    }
    for (_, export) in state.exports.drain() {
        export.client.release();
    }
    if let Some(closer) = &core.main_closer {
        closer.release();
    }
}

impl ConnCore {
    /// Acquire the connection mutex, giving up if the caller's context or
    /// the connection itself is canceled first.
    pub(crate) async fn lock(
        &self,
        ctx: Option<&CancellationToken>,
    ) -> Result<MutexGuard<'_, ConnState>> {
        match ctx {
            Some(ctx) => tokio::select! {
                guard = self.state.lock() => Ok(guard),
                _ = ctx.cancelled() => Err(Error::Canceled),
                _ = self.manager.cancelled() => Err(self.manager.error()),
            },
            None => tokio::select! {
                guard = self.state.lock() => Ok(guard),
                _ = self.manager.cancelled() => Err(self.manager.error()),
            },
        }
    }

    /// Enqueue one outbound message, blocking for send-buffer
    /// backpressure. Fails once shutdown has begun.
    async fn send_message(&self, msg: Message) -> Result<()> {
        tokio::select! {
            sent = self.out.send(msg) => sent.map_err(|_| Error::ConnClosed),
            _ = self.manager.cancelled() => Err(self.manager.error()),
        }
    }

    /// Send a protocol-violation abort and begin shutdown.
    async fn abort(&self, err: Error) {
        let _ = self
            .send_message(Message::abort(Exception::from(&err)))
            .await;
        self.manager.shutdown(err);
    }

    fn is_self(self: &Arc<Self>, conn: &Weak<ConnCore>) -> bool {
        std::ptr::eq(conn.as_ptr(), Arc::as_ptr(self))
    }

    fn drop_question(&self, state: &mut ConnState, id: QuestionId) {
        if let Some(question) = state.questions.remove(&id) {
            state.question_ids.release(id.0);
            for export in question.param_caps() {
                if let Err(err) = release_export(state, export, 1) {
                    warn!("rolling back param cap: {err}");
                }
            }
        }
    }

    /// Allocate a question and enqueue its `call` message, all under the
    /// connection mutex.
    pub(crate) async fn nested_call(
        self: &Arc<Self>,
        state: &mut ConnState,
        ctx: &CancellationToken,
        method: Method,
        target: MessageTarget,
        params: Params,
    ) -> Result<Arc<Question>> {
        let id = QuestionId(state.question_ids.next());
        let question = Question::new(id, Some(method));
        state.questions.insert(id, Arc::clone(&question));
        let (payload, param_caps) = self.make_cap_table(state, &params);
        question.set_param_caps(param_caps);
        let msg = Message::Call(Call {
            question_id: id.0,
            target,
            interface_id: method.interface_id,
            method_id: method.method_id,
            params: payload,
            send_results_to: SendResultsTo::Caller,
            allow_third_party_tail_call: false,
        });
        tokio::select! {
            sent = self.out.send(msg) => {
                if sent.is_err() {
                    self.drop_question(state, id);
                    return Err(Error::ConnClosed);
                }
            }
            _ = ctx.cancelled() => {
                self.drop_question(state, id);
                return Err(Error::Canceled);
            }
            _ = self.manager.cancelled() => {
                self.drop_question(state, id);
                return Err(self.manager.error());
            }
        }
        question.start();
        self.watch_cancellation(&question, ctx.clone());
        Ok(question)
    }

    /// User-facing pipelined call on a wire target: the promise resolves
    /// with the result, and the returned client pipelines further calls
    /// on that result.
    async fn pipelined_call(
        self: &Arc<Self>,
        ctx: CancellationToken,
        method: Method,
        target: MessageTarget,
        params: Params,
        via: Option<Arc<Question>>,
    ) -> (Promise, Client) {
        let mut state = match self.lock(Some(&ctx)).await {
            Ok(state) => state,
            Err(err) => return error_pair(err, method),
        };
        // The question we meant to pipeline over may have settled while
        // we waited for the lock; its promised-answer path is then gone.
        if let (Some(question), MessageTarget::PromisedAnswer { transform, .. }) =
            (&via, &target)
        {
            if let Some(resolved) = question.resolved_client(transform) {
                drop(state);
                let promise = resolved.call(ctx, method, params).await;
                let shared = PromiseShared::spawn(promise);
                return (shared.outcome(), shared.client(Transform::root()));
            }
        }
        match self.nested_call(&mut state, &ctx, method, target, params).await {
            Ok(question) => {
                drop(state);
                let pipeline = Question::pipeline_client(&question, self, Transform::root());
                (question.promise(), pipeline)
            }
            Err(err) => error_pair(err, method),
        }
    }

    /// Watch a started question's context; cancellation before resolution
    /// transitions it to canceled and sends `finish`.
    fn watch_cancellation(self: &Arc<Self>, question: &Arc<Question>, ctx: CancellationToken) {
        let core = Arc::clone(self);
        let question = Arc::clone(question);
        self.manager.spawn(async move {
            tokio::select! {
                _ = question.settled() => {}
                _ = core.manager.cancelled() => {}
                _ = ctx.cancelled() => {
                    let Ok(_guard) = core.lock(None).await else { return };
                    if question.stage() == QuestionStage::InFlight {
                        question.reject(QuestionStage::Canceled, Error::Canceled);
                        if question.started() {
                            // The question entry stays in the table so a
                            // late return can release its param caps.
                            let _ = core
                                .send_message(Message::finish(question.id.0, true))
                                .await;
                        }
                    }
                }
            }
        });
    }

    /// Process one inbound message. Called synchronously from the receive
    /// loop; anything retained is copied out of the message here.
    async fn handle_message(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Unimplemented(_) => {
                // No-op, to avoid a feedback loop.
                debug!("peer reported a message unimplemented");
            }
            Message::Abort(exception) => {
                warn!("connection aborted by remote vat: {exception}");
                self.manager.shutdown(Error::Aborted(exception));
            }
            Message::Bootstrap { question_id } => {
                let Ok(mut state) = self.lock(None).await else {
                    return;
                };
                if let Err(err) = self.handle_bootstrap(&mut state, question_id).await {
                    warn!("handle bootstrap: {err}");
                }
            }
            Message::Call(call) => {
                let Ok(mut state) = self.lock(None).await else {
                    return;
                };
                if let Err(err) = self.handle_call(&mut state, call).await {
                    warn!("handle call: {err}");
                }
            }
            Message::Return(ret) => {
                let Ok(mut state) = self.lock(None).await else {
                    return;
                };
                if let Err(err) = self.handle_return(&mut state, ret).await {
                    warn!("handle return: {err}");
                }
            }
            Message::Finish {
                question_id,
                release_result_caps,
            } => {
                let Ok(mut state) = self.lock(None).await else {
                    return;
                };
                self.handle_finish(&mut state, question_id, release_result_caps)
                    .await;
            }
            Message::Release {
                id,
                reference_count,
            } => {
                let Ok(mut state) = self.lock(None).await else {
                    return;
                };
                if let Err(err) = release_export(&mut state, ExportId(id), reference_count) {
                    drop(state);
                    self.abort(err).await;
                }
            }
            Message::Disembargo { target, context } => {
                let Ok(mut state) = self.lock(None).await else {
                    return;
                };
                if let Err(err) = self.handle_disembargo(&mut state, target, context).await {
                    drop(state);
                    // Any failure in a disembargo is a protocol violation.
                    self.abort(err).await;
                }
            }
            other @ (Message::Resolve | Message::Provide | Message::Accept | Message::Join) => {
                debug!("received unimplemented message: {}", other.kind());
                let _ = self.send_message(Message::unimplemented(other)).await;
            }
        }
    }

    async fn handle_bootstrap(self: &Arc<Self>, state: &mut ConnState, id: u32) -> Result<()> {
        let answer_id = AnswerId(id);
        if state.answers.contains_key(&answer_id) {
            return self
                .send_message(Message::return_exception(
                    id,
                    Exception::from(&Error::QuestionReused),
                ))
                .await;
        }
        let cancel = self.root_ctx.child_token();
        state.answers.insert(answer_id, Answer::new(answer_id, cancel.clone()));
        let outcome = match &self.main_func {
            Some(main_func) => main_func(cancel)
                .map(Resolution::capability)
                .map_err(|_| Error::NoMainInterface),
            None => Err(Error::NoMainInterface),
        };
        self.fulfill_answer(state, answer_id, outcome).await;
        Ok(())
    }

    async fn handle_call(self: &Arc<Self>, state: &mut ConnState, call: Call) -> Result<()> {
        let params = match self.populate(state, call.params.clone()) {
            Ok(params) => params,
            Err(Error::Unimplemented) => {
                self.send_message(Message::unimplemented(Message::Call(call)))
                    .await?;
                return Err(Error::Unimplemented);
            }
            Err(err) => {
                // A cap-table violation poisons the tables; abort.
                self.abort(err.clone()).await;
                return Err(err);
            }
        };
        let id = AnswerId(call.question_id);
        if state.answers.contains_key(&id) {
            self.abort(Error::QuestionReused).await;
            return Err(Error::QuestionReused);
        }
        let cancel = self.root_ctx.child_token();
        state.answers.insert(id, Answer::new(id, cancel.clone()));
        let method = Method {
            interface_id: call.interface_id,
            method_id: call.method_id,
        };
        if let Err(err) = self
            .route_call(state, id, call.target, cancel, method, params)
            .await
        {
            // Routing errors reject the answer; the connection stays up.
            self.fulfill_answer(state, id, Err(err)).await;
        }
        Ok(())
    }

    async fn route_call(
        self: &Arc<Self>,
        state: &mut ConnState,
        result: AnswerId,
        target: MessageTarget,
        ctx: CancellationToken,
        method: Method,
        params: Params,
    ) -> Result<()> {
        match target {
            MessageTarget::ImportedCap(id) => {
                let client = state
                    .exports
                    .get(&ExportId(id))
                    .map(|export| export.client.clone())
                    .ok_or(Error::BadTarget)?;
                let promise = self.start_call(state, ctx, method, params, &client).await;
                self.spawn_join(result, promise);
                Ok(())
            }
            MessageTarget::PromisedAnswer {
                question_id,
                transform,
            } => {
                let promised = AnswerId(question_id);
                if promised == result {
                    // Grandfather paradox: a call cannot target its own
                    // answer.
                    return Err(Error::BadTarget);
                }
                let resolved = state
                    .answers
                    .get(&promised)
                    .ok_or(Error::BadTarget)?
                    .resolved_client(&transform);
                match resolved {
                    Some(client) => {
                        let promise =
                            self.start_call(state, ctx, method, params, &client).await;
                        self.spawn_join(result, promise);
                    }
                    None => {
                        let answer = state
                            .answers
                            .get_mut(&promised)
                            .expect("answer checked above");
                        answer.queue_call(QueuedCall {
                            transform,
                            ctx,
                            method,
                            params,
                            sink: CallSink::Answer(result),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Begin a call on `client` from inside the dispatcher, with the
    /// connection mutex held. Clients owned by this connection are routed
    /// through the tables directly (calling them would re-take the lock);
    /// anything else is started via its `call`, which by contract returns
    /// its promise without blocking on other RPC activity.
    async fn start_call(
        self: &Arc<Self>,
        state: &mut ConnState,
        ctx: CancellationToken,
        method: Method,
        params: Params,
        client: &Client,
    ) -> Promise {
        let mut current = client.clone();
        for _ in 0..MAX_TARGET_HOPS {
            let next = match current.kind() {
                ClientKind::Error(err) => {
                    return resolved_promise(Err(err.clone()));
                }
                ClientKind::Import { conn, id } if self.is_self(conn) => {
                    let target = MessageTarget::ImportedCap(id.0);
                    return match self.nested_call(state, &ctx, method, target, params).await {
                        Ok(question) => question.promise(),
                        Err(err) => resolved_promise(Err(err)),
                    };
                }
                ClientKind::QuestionPipeline {
                    conn,
                    question,
                    transform,
                } if self.is_self(conn) => match question.resolved_client(transform) {
                    None => {
                        let target = MessageTarget::PromisedAnswer {
                            question_id: question.id.0,
                            transform: transform.clone(),
                        };
                        return match self.nested_call(state, &ctx, method, target, params).await
                        {
                            Ok(question) => question.promise(),
                            Err(err) => resolved_promise(Err(err)),
                        };
                    }
                    Some(next) => next,
                },
                ClientKind::AnswerPipeline {
                    conn,
                    answer,
                    transform,
                } if self.is_self(conn) => {
                    let Some(entry) = state.answers.get(answer) else {
                        return resolved_promise(Err(Error::BadTarget));
                    };
                    match entry.resolved_client(transform) {
                        Some(next) => next,
                        None => {
                            let (tx, rx) = tokio::sync::oneshot::channel();
                            let transform = transform.clone();
                            let answer = *answer;
                            state
                                .answers
                                .get_mut(&answer)
                                .expect("answer checked above")
                                .queue_call(QueuedCall {
                                    transform,
                                    ctx,
                                    method,
                                    params,
                                    sink: CallSink::Promise(tx),
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
                _ => {
                    return current.call(ctx, method, params).await;
                }
            };
            current = next;
        }
        warn!("call target did not settle after {MAX_TARGET_HOPS} hops");
        resolved_promise(Err(Error::BadTarget))
    }

    /// Splice a promise into an answer: when the promise resolves, the
    /// answer resolves identically.
    fn spawn_join(self: &Arc<Self>, id: AnswerId, promise: Promise) {
        let core = Arc::clone(self);
        self.manager.spawn(async move {
            let outcome = tokio::select! {
                outcome = promise => outcome,
                _ = core.manager.cancelled() => return,
            };
            let Ok(mut state) = core.lock(None).await else {
                return;
            };
            core.fulfill_answer(&mut state, id, outcome).await;
        });
    }

    /// Resolve an answer: send its `return`, then dispatch queued
    /// pipelined calls in queue order, then let queued disembargoes
    /// through.
    async fn fulfill_answer(
        self: &Arc<Self>,
        state: &mut ConnState,
        id: AnswerId,
        outcome: Result<Resolution>,
    ) {
        let (calls, disembargoes) = {
            let Some(answer) = state.answers.get_mut(&id) else {
                // The peer finished the question before the result came.
                debug!("dropping result for finished answer {id}");
                return;
            };
            if !answer.resolve(outcome.clone()) {
                return;
            }
            answer.take_queued()
        };
        let msg = match &outcome {
            Ok(resolution) => {
                let (payload, result_caps) = self.make_cap_table(state, resolution);
                if let Some(answer) = state.answers.get_mut(&id) {
                    answer.result_caps = result_caps;
                }
                Message::return_results(id.0, payload)
            }
            Err(Error::Canceled) => Message::return_canceled(id.0),
            Err(err) => Message::return_exception(id.0, Exception::from(err)),
        };
        if let Err(err) = self.send_message(msg).await {
            debug!("return for answer {id} not sent: {err}");
        }
        for queued in calls {
            let client = match &outcome {
                Ok(resolution) => resolution.client(&queued.transform),
                Err(err) => Client::from_error(err.clone()),
            };
            let promise = self
                .start_call(state, queued.ctx, queued.method, queued.params, &client)
                .await;
            match queued.sink {
                CallSink::Answer(target) => self.spawn_join(target, promise),
                CallSink::Promise(tx) => {
                    let _ = tx.send(promise);
                }
            }
        }
        for (embargo_id, target) in disembargoes {
            let _ = self
                .send_message(Message::disembargo_receiver_loopback(embargo_id, target))
                .await;
        }
    }

    async fn handle_return(self: &Arc<Self>, state: &mut ConnState, ret: Return) -> Result<()> {
        let Return {
            answer_id,
            release_param_caps,
            variant,
        } = ret;
        let id = QuestionId(answer_id);
        let Some(question) = state.questions.remove(&id) else {
            warn!("received return for unknown question ID {answer_id}");
            return Ok(());
        };
        state.question_ids.release(id.0);
        if release_param_caps {
            for export in question.param_caps() {
                if let Err(err) = release_export(state, export, 1) {
                    warn!("releasing param cap: {err}");
                }
            }
        }
        if question.stage() == QuestionStage::Canceled {
            // We already sent the finish message.
            return Ok(());
        }
        let release_result_caps = match variant {
            ReturnVariant::Results(payload) => {
                let resolution = match self.populate(state, payload.clone()) {
                    Ok(resolution) => resolution,
                    Err(Error::Unimplemented) => {
                        let echo = Message::Return(Return {
                            answer_id,
                            release_param_caps,
                            variant: ReturnVariant::Results(payload),
                        });
                        self.send_message(Message::unimplemented(echo)).await?;
                        return Err(Error::Unimplemented);
                    }
                    Err(err) => {
                        self.abort(err.clone()).await;
                        return Err(err);
                    }
                };
                self.fulfill_question(state, &question, resolution).await;
                false
            }
            ReturnVariant::Exception(exception) => {
                question.reject(QuestionStage::Resolved, Error::Remote(exception));
                true
            }
            ReturnVariant::Canceled => {
                question.reject(QuestionStage::Resolved, Error::ReceiverCanceled);
                // The remote is already done; it expects no finish.
                return Ok(());
            }
            other => {
                let echo = Message::Return(Return {
                    answer_id,
                    release_param_caps,
                    variant: other,
                });
                self.send_message(Message::unimplemented(echo)).await?;
                return Err(Error::Unimplemented);
            }
        };
        self.send_message(Message::finish(id.0, release_result_caps))
            .await
    }

    /// Fulfill a question, wrapping path-shortened delivery targets in
    /// embargoes. A derived transform that resolved to a capability the
    /// peer hosts, or to one we host ourselves via a receiver-answer,
    /// must not be messaged directly until the peer has drained the
    /// calls pipelined along the old path; the disembargo loopback tells
    /// us when.
    async fn fulfill_question(
        self: &Arc<Self>,
        state: &mut ConnState,
        question: &Arc<Question>,
        resolution: Resolution,
    ) {
        let mut targets = HashMap::new();
        for transform in question.derived_transforms() {
            let client = resolution.client(&transform);
            let shortened = matches!(
                client.kind(),
                ClientKind::Import { conn, .. } | ClientKind::AnswerPipeline { conn, .. }
                    if self.is_self(conn)
            );
            if shortened {
                let embargo_id = EmbargoId(state.embargo_ids.next());
                let embargo = EmbargoClient::new(client);
                state.embargoes.insert(embargo_id, Arc::clone(&embargo));
                targets.insert(transform.clone(), embargo.client());
                let target = MessageTarget::PromisedAnswer {
                    question_id: question.id.0,
                    transform,
                };
                if let Err(err) = self
                    .send_message(Message::disembargo_sender_loopback(embargo_id.0, target))
                    .await
                {
                    debug!("disembargo not sent: {err}");
                }
            } else {
                targets.insert(transform, client);
            }
        }
        question.fulfill(resolution, targets);
    }

    async fn handle_finish(
        self: &Arc<Self>,
        state: &mut ConnState,
        question_id: u32,
        release_result_caps: bool,
    ) {
        let id = AnswerId(question_id);
        let Some(mut answer) = state.answers.remove(&id) else {
            warn!("received finish for unknown answer ID {question_id}");
            return;
        };
        answer.cancel.cancel();
        if release_result_caps {
            for export in answer.result_caps.drain(..) {
                if let Err(err) = release_export(state, export, 1) {
                    warn!("releasing result cap: {err}");
                }
            }
        }
        // Work still queued on an unresolved answer has lost its target.
        let (calls, _) = answer.take_queued();
        for queued in calls {
            match queued.sink {
                CallSink::Answer(target) => {
                    self.fulfill_answer(state, target, Err(Error::Canceled)).await;
                }
                CallSink::Promise(tx) => {
                    let _ = tx.send(resolved_promise(Err(Error::Canceled)));
                }
            }
        }
    }

    async fn handle_disembargo(
        self: &Arc<Self>,
        state: &mut ConnState,
        target: MessageTarget,
        context: DisembargoContext,
    ) -> Result<()> {
        match context {
            DisembargoContext::SenderLoopback(id) => {
                let MessageTarget::PromisedAnswer { question_id, .. } = &target else {
                    return Err(Error::DisembargoNonPromise);
                };
                let answer_id = AnswerId(*question_id);
                let Some(answer) = state.answers.get_mut(&answer_id) else {
                    return Err(Error::DisembargoMissingAnswer(*question_id));
                };
                if answer.queue_disembargo(id, target.clone()) {
                    return Ok(());
                }
                // Everything queued has been delivered; echo immediately.
                self.send_message(Message::disembargo_receiver_loopback(id, target))
                    .await
            }
            DisembargoContext::ReceiverLoopback(id) => {
                let embargo_id = EmbargoId(id);
                let Some(embargo) = state.embargoes.remove(&embargo_id) else {
                    return Err(Error::UnknownEmbargo(id));
                };
                state.embargo_ids.release(id);
                embargo.lift(&self.manager);
                Ok(())
            }
            DisembargoContext::Accept | DisembargoContext::Provide(_) => {
                // Unsupported disembargo variants break ordering silently
                // if ignored; treat them as fatal.
                Err(Error::Unimplemented)
            }
        }
    }

    /// Resolve each descriptor of an inbound payload into a live client.
    fn populate(
        self: &Arc<Self>,
        state: &mut ConnState,
        payload: Payload,
    ) -> Result<Resolution> {
        let mut caps = Vec::with_capacity(payload.cap_table.len());
        for descriptor in payload.cap_table {
            match descriptor {
                CapDescriptor::None => caps.push(None),
                // Promises are handled like settled capabilities; see the
                // crate docs for what that simplification gives up.
                CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => {
                    caps.push(Some(self.add_import(state, ImportId(id))));
                }
                CapDescriptor::ReceiverHosted(id) => {
                    let export = state
                        .exports
                        .get(&ExportId(id))
                        .ok_or(Error::UnknownExport(id))?;
                    caps.push(Some(export.client.clone()));
                }
                CapDescriptor::ReceiverAnswer {
                    question_id,
                    transform,
                } => {
                    let id = AnswerId(question_id);
                    if !state.answers.contains_key(&id) {
                        return Err(Error::UnknownAnswer(question_id));
                    }
                    caps.push(Some(AnswerPipelineClient::client(
                        Arc::downgrade(self),
                        id,
                        transform,
                    )));
                }
                CapDescriptor::ThirdPartyHosted => return Err(Error::Unimplemented),
            }
        }
        Ok(Resolution {
            content: payload.content,
            caps,
        })
    }

    /// Find or create the import entry for `id`, absorbing one wire
    /// reference, and return its proxy client.
    fn add_import(self: &Arc<Self>, state: &mut ConnState, id: ImportId) -> Client {
        if let Some(existing) = state.imports.get(&id).and_then(Weak::upgrade) {
            existing.refs.fetch_add(1, Ordering::SeqCst);
            return ImportClient::wrap(existing);
        }
        let import = Arc::new(ImportClient {
            conn: Arc::downgrade(self),
            id,
            refs: AtomicU32::new(1),
        });
        state.imports.insert(id, Arc::downgrade(&import));
        ImportClient::wrap(import)
    }

    /// Convert the clients of an outbound payload into descriptors.
    /// Returns the wire payload plus the export IDs whose refcount this
    /// payload bumped.
    fn make_cap_table(
        self: &Arc<Self>,
        state: &mut ConnState,
        resolution: &Resolution,
    ) -> (Payload, Vec<ExportId>) {
        let mut cap_table = Vec::with_capacity(resolution.caps.len());
        let mut bumped = Vec::new();
        for cap in &resolution.caps {
            let descriptor = match cap {
                None => CapDescriptor::None,
                Some(client) => self.descriptor_for_client(state, client, &mut bumped),
            };
            cap_table.push(descriptor);
        }
        (
            Payload {
                content: resolution.content.clone(),
                cap_table,
            },
            bumped,
        )
    }

    fn descriptor_for_client(
        self: &Arc<Self>,
        state: &mut ConnState,
        client: &Client,
        bumped: &mut Vec<ExportId>,
    ) -> CapDescriptor {
        let mut current = client.clone();
        for _ in 0..MAX_TARGET_HOPS {
            let next = match current.kind() {
                ClientKind::Import { conn, id } if self.is_self(conn) => {
                    return CapDescriptor::ReceiverHosted(id.0);
                }
                ClientKind::QuestionPipeline {
                    conn,
                    question,
                    transform,
                } if self.is_self(conn) => match question.resolved_client(transform) {
                    None => {
                        return CapDescriptor::ReceiverAnswer {
                            question_id: question.id.0,
                            transform: transform.clone(),
                        };
                    }
                    Some(next) => next,
                },
                _ => break,
            };
            current = next;
        }
        let id = send_export(state, &current);
        bumped.push(id);
        CapDescriptor::SenderHosted(id.0)
    }
}

/// Find or allocate an export entry for `client` and bump its count.
fn send_export(state: &mut ConnState, client: &Client) -> ExportId {
    let existing = state
        .exports
        .iter()
        .find(|(_, export)| export.client.same_capability(client))
        .map(|(&id, _)| id);
    if let Some(id) = existing {
        state.exports.get_mut(&id).expect("entry exists").refs += 1;
        return id;
    }
    let id = ExportId(state.export_ids.next());
    state.exports.insert(
        id,
        Export {
            client: client.clone(),
            refs: 1,
        },
    );
    id
}

/// Drop `count` of the peer's references to an export; the count hitting
/// zero removes the entry, releases the capability and recycles the ID.
fn release_export(state: &mut ConnState, id: ExportId, count: u32) -> Result<()> {
    let Some(export) = state.exports.get_mut(&id) else {
        warn!("release for unknown export ID {id}");
        return Ok(());
    };
    if count > export.refs {
        return Err(Error::OverRelease(id.0));
    }
    export.refs -= count;
    if export.refs == 0 {
        let export = state.exports.remove(&id).expect("entry exists");
        state.export_ids.release(id.0);
        export.client.release();
    }
    Ok(())
}

/// Proxy for a capability the peer hosts. Calls become `call` messages
/// targeting the peer's export; dropping the last handle sends a
/// `release` carrying every wire reference the entry absorbed.
pub(crate) struct ImportClient {
    conn: Weak<ConnCore>,
    id: ImportId,
    refs: AtomicU32,
}

impl ImportClient {
    fn wrap(import: Arc<ImportClient>) -> Client {
        let kind = ClientKind::Import {
            conn: import.conn.clone(),
            id: import.id,
        };
        Client::with_kind(import as Arc<dyn Capability>, kind)
    }
}

#[async_trait]
impl Capability for ImportClient {
    async fn call(&self, ctx: CancellationToken, method: Method, params: Params) -> Promise {
        let Some(core) = self.conn.upgrade() else {
            return resolved_promise(Err(Error::ConnClosed.for_question(Some(method))));
        };
        let mut state = match core.lock(Some(&ctx)).await {
            Ok(state) => state,
            Err(err) => return resolved_promise(Err(err.for_question(Some(method)))),
        };
        let target = MessageTarget::ImportedCap(self.id.0);
        match core
            .nested_call(&mut state, &ctx, method, target, params)
            .await
        {
            Ok(question) => question.promise(),
            Err(err) => resolved_promise(Err(err.for_question(Some(method)))),
        }
    }
}

fn error_pair(err: Error, method: Method) -> (Promise, Client) {
    (
        resolved_promise(Err(err.clone().for_question(Some(method)))),
        Client::from_error(err),
    )
}

impl Client {
    /// Begin a call and additionally return a promise client for the
    /// call's result, through which further calls pipeline before the
    /// result arrives. On connection-backed targets the pipelined calls
    /// travel as promised-answer calls on the wire; elsewhere they buffer
    /// locally until the result is known.
    pub async fn call_with_pipeline(
        &self,
        ctx: CancellationToken,
        method: Method,
        params: Params,
    ) -> (Promise, Client) {
        let mut current = self.clone();
        for _ in 0..MAX_TARGET_HOPS {
            let next = match current.kind() {
                ClientKind::Import { conn, id } => match conn.upgrade() {
                    Some(core) => {
                        let target = MessageTarget::ImportedCap(id.0);
                        return core.pipelined_call(ctx, method, target, params, None).await;
                    }
                    None => {
                        return error_pair(Error::ConnClosed, method);
                    }
                },
                ClientKind::QuestionPipeline {
                    conn,
                    question,
                    transform,
                } => match question.resolved_client(transform) {
                    Some(next) => next,
                    None => match conn.upgrade() {
                        Some(core) => {
                            let target = MessageTarget::PromisedAnswer {
                                question_id: question.id.0,
                                transform: transform.clone(),
                            };
                            let via = Some(Arc::clone(question));
                            return core.pipelined_call(ctx, method, target, params, via).await;
                        }
                        None => {
                            return error_pair(Error::ConnClosed, method);
                        }
                    },
                },
                _ => break,
            };
            current = next;
        }
        let promise = current.call(ctx, method, params).await;
        let shared = PromiseShared::spawn(promise);
        (shared.outcome(), shared.client(Transform::root()))
    }
}

impl Drop for ImportClient {
    fn drop(&mut self) {
        let Some(core) = self.conn.upgrade() else {
            return;
        };
        if core.manager.is_shutdown() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let id = self.id;
        let refs = self.refs.load(Ordering::SeqCst);
        let manager = core.manager.clone();
        manager.spawn(async move {
            let Ok(mut state) = core.lock(None).await else {
                return;
            };
            // A fresh proxy may have replaced this entry already.
            let stale = state
                .imports
                .get(&id)
                .is_some_and(|weak| weak.strong_count() == 0);
            if !stale {
                return;
            }
            state.imports.remove(&id);
            let _ = core
                .send_message(Message::Release {
                    id: id.0,
                    reference_count: refs,
                })
                .await;
        });
    }
}
