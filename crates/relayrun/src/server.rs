//! # Invocation Server
//!
//! Serves named methods to remote clients. Each `Invoke` runs its handler
//! on its own task with an `InvocationContext` that carries the callback
//! service, the root execution and the question service.
//!
//! ## Lifecycle of one invocation
//!
//! 1. Unknown method: a `MethodNotFound` exception is sent and nothing runs.
//! 2. The id is registered with the cancel service and a cancellation token
//!    is attached as its listener.
//! 3. A progress reporter starts polling the root execution.
//! 4. The handler runs. Its outcome becomes exactly one terminal message:
//!    `Finished` on success, `Exception` on error or panic.
//! 5. The reporter is stopped before the terminal message is sent, and the
//!    id is unregistered afterwards.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relaynet::BrokerId;
use relaynet::Envelope;
use relaynet::Inbox;
use relaynet::MessageServer;
use relaynet::Peer;
use relaynet::channel;
use relayrpc::InvocationId;
use relayrpc::RemoteError;
use relayrpc::RequestId;
use relayrpc::ServerBound;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::debug_span;
use tracing::warn;

use crate::callback;
use crate::callback::CallbackService;
use crate::cancel::CancelService;
use crate::cancel::token_listener;
use crate::execution::Canceled;
use crate::execution::ExecutionCallback;
use crate::question::QuestionService;
use crate::reporter::ProgressReporter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A handler is already registered under this name.
    DuplicateMethod(String),
    /// The invocation was canceled while waiting.
    Canceled,
    /// The question was discarded before it was answered.
    Abandoned(RequestId),
    Callback(callback::Error),
    Channel(channel::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateMethod(name) => write!(f, "Method '{}' already registered", name),
            Self::Canceled => write!(f, "Invocation canceled"),
            Self::Abandoned(id) => write!(f, "Question {} abandoned", id),
            Self::Callback(e) => write!(f, "Callback error: {}", e),
            Self::Channel(e) => write!(f, "Channel error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<callback::Error> for Error {
    fn from(e: callback::Error) -> Self {
        Self::Callback(e)
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Channel(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Application code behind one method name.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn invoke(&self, ctx: InvocationContext, parameter: Value) -> anyhow::Result<Value>;
}

/// Adapts an async closure to `MethodHandler`.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(InvocationContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, ctx: InvocationContext, parameter: Value) -> anyhow::Result<Value> {
        (self.0)(ctx, parameter).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(InvocationContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Everything a handler can reach during one invocation.
#[derive(Clone)]
pub struct InvocationContext {
    invocation_id: InvocationId,
    callback: CallbackService,
    execution: ExecutionCallback,
    questions: Arc<QuestionService>,
}

impl InvocationContext {
    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    /// Sends interim messages to the client. The terminal message belongs to
    /// the server; a handler that sends one itself makes the server's own
    /// attempt fail with `Terminated`.
    pub fn callback(&self) -> &CallbackService {
        &self.callback
    }

    /// Root of this invocation's progress tree.
    pub fn execution(&self) -> &ExecutionCallback {
        &self.execution
    }

    pub fn is_canceled(&self) -> bool {
        self.execution.is_canceled()
    }

    /// Asks the client a question and waits for the answer, or for the
    /// invocation to be canceled.
    pub async fn ask(&self, request: Value) -> Result<Value> {
        let (request_id, answer) = self.questions.ask();
        if let Err(e) = self.callback.interim_request(request_id, request) {
            self.questions.discard(request_id);
            return Err(e.into());
        }

        tokio::select! {
            answer = answer => answer.map_err(|_| Error::Abandoned(request_id)),
            _ = self.execution.canceled() => {
                self.questions.discard(request_id);
                Err(Error::Canceled)
            }
        }
    }
}

#[derive(Clone)]
pub struct InvocationServer {
    inner: Arc<Inner>,
}

struct Inner {
    message_server: MessageServer,
    methods: DashMap<String, Arc<dyn MethodHandler>>,
    cancel: Arc<CancelService>,
    questions: Arc<QuestionService>,
    progress_interval: Duration,
}

impl InvocationServer {
    pub fn new(message_server: MessageServer, progress_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                message_server,
                methods: DashMap::new(),
                cancel: Arc::new(CancelService::new()),
                questions: Arc::new(QuestionService::new()),
                progress_interval,
            }),
        }
    }

    pub fn broker_id(&self) -> &BrokerId {
        self.inner.message_server.broker_id()
    }

    pub fn local_peer(&self) -> &Peer {
        self.inner.message_server.local_peer()
    }

    pub fn register_method(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<()> {
        match self.inner.methods.entry(name.into()) {
            Entry::Occupied(entry) => Err(Error::DuplicateMethod(entry.key().clone())),
            Entry::Vacant(slot) => {
                debug!(broker = %self.broker_id(), method = %slot.key(), "method registered");
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub fn unregister_method(&self, name: &str) -> bool {
        self.inner.methods.remove(name).is_some()
    }

    pub fn cancel_service(&self) -> &Arc<CancelService> {
        &self.inner.cancel
    }

    pub fn question_service(&self) -> &Arc<QuestionService> {
        &self.inner.questions
    }

    /// A callback service speaking to `client` about `invocation_id`.
    pub fn callback_service(
        &self,
        client: &Peer,
        invocation_id: InvocationId,
    ) -> Result<CallbackService> {
        let channel = self.inner.message_server.channel_to(client)?;
        Ok(CallbackService::new(invocation_id, channel))
    }

    /// Inbox to register as this broker's server receiver. Holds the server
    /// weakly so the registry does not keep it alive.
    pub fn receiver(&self) -> Arc<dyn Inbox> {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |envelope: Envelope| {
            if let Some(inner) = weak.upgrade() {
                InvocationServer { inner }.receive(envelope);
            }
        })
    }

    fn receive(&self, envelope: Envelope) {
        let message = match ServerBound::decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => return self.reject(envelope, e),
        };

        match message {
            ServerBound::Invoke {
                invocation_id,
                method,
                parameter,
            } => self.start(envelope.sender, invocation_id, method, parameter),
            ServerBound::Cancel { invocation_id } => {
                self.inner.cancel.canceled(invocation_id);
            }
            ServerBound::Response {
                request_id,
                response,
                ..
            } => {
                self.inner.questions.set_result(request_id, response);
            }
        }
    }

    /// Answers a malformed invoke with `BadRequest` when it names an
    /// invocation; anything else is dropped.
    fn reject(&self, envelope: Envelope, error: relayrpc::Error) {
        warn!(sender = %envelope.sender, %error, "undecodable server-bound message");

        let payload = &envelope.payload;
        if payload.get("type").and_then(Value::as_str) != Some("invoke") {
            return;
        }
        let Some(id) = payload
            .get("invocation_id")
            .and_then(|raw| InvocationId::deserialize(raw).ok())
        else {
            return;
        };

        if let Ok(callback) = self.callback_service(&envelope.sender, id) {
            let _ = callback.exception(RemoteError::bad_request(error.to_string()));
        }
    }

    fn start(&self, client: Peer, id: InvocationId, method: String, parameter: Value) {
        let callback = match self.callback_service(&client, id) {
            Ok(callback) => callback,
            Err(e) => {
                warn!(invocation = %id, %client, error = %e, "cannot reply to client, dropping invoke");
                return;
            }
        };

        let handler = self
            .inner
            .methods
            .get(&method)
            .map(|entry| entry.value().clone());
        let Some(handler) = handler else {
            debug!(invocation = %id, %method, "method not found");
            let _ = callback.exception(RemoteError::method_not_found(&method));
            return;
        };

        if !self.inner.cancel.register_invocation(id) {
            warn!(invocation = %id, "invocation already running, dropping repeated invoke");
            return;
        }

        let token = CancellationToken::new();
        self.inner
            .cancel
            .register_cancel_listener(id, token_listener(token.clone()));

        let ctx = InvocationContext {
            invocation_id: id,
            callback,
            execution: ExecutionCallback::new(token),
            questions: Arc::clone(&self.inner.questions),
        };

        let span = debug_span!("invocation", invocation = %id, %method, %client);
        tokio::spawn(run(Arc::clone(&self.inner), handler, ctx, parameter).instrument(span));
    }
}

async fn run(
    inner: Arc<Inner>,
    handler: Arc<dyn MethodHandler>,
    ctx: InvocationContext,
    parameter: Value,
) {
    let id = ctx.invocation_id;
    let callback = ctx.callback.clone();
    let reporter = ProgressReporter::start(
        ctx.execution.clone(),
        callback.clone(),
        inner.progress_interval,
    );
    debug!("invocation started");

    // a nested task turns a handler panic into a JoinError
    let outcome = tokio::spawn(
        async move { handler.invoke(ctx, parameter).await }.in_current_span(),
    )
    .await;

    if let Err(e) = reporter.stop().await {
        debug!(error = %e, "final progress not sent");
    }

    let sent = match outcome {
        Ok(Ok(result)) => callback.finished(result),
        Ok(Err(error)) => {
            let exception = classify(&error);
            debug!(kind = %exception.kind, %error, "invocation failed");
            callback.exception(exception)
        }
        Err(join) => {
            let message = match join.try_into_panic() {
                Ok(payload) => panic_message(payload),
                Err(join) => join.to_string(),
            };
            warn!(%message, "handler panicked");
            callback.exception(RemoteError::panicked(message))
        }
    };
    if let Err(e) = sent {
        warn!(error = %e, "terminal message not sent");
    }

    inner.cancel.unregister_invocation(id);
    debug!("invocation complete");
}

fn classify(error: &anyhow::Error) -> RemoteError {
    let canceled = error.downcast_ref::<Canceled>().is_some()
        || matches!(error.downcast_ref::<Error>(), Some(Error::Canceled));
    if canceled {
        RemoteError::canceled()
    } else {
        RemoteError::application(format!("{:#}", error))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "handler panicked".to_string()
}
