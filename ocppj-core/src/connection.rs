//! Connection façade
//!
//! A `Connection` ties one link to one correlation queue and one router.
//! Its receive task settles replies straight away and hands inbound calls
//! to a dispatch task, which answers them one at a time, so a slow handler
//! never holds up the replies the local side is waiting for.
//!
//! Connections are one-shot: once stopped, or once the peer goes away,
//! build a new one to reconnect.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, ErrorReporter, OcppError};
use crate::messages::{salvage_call_id, Call, CallError, IdStrategy, MessageIdGenerator, OcppMessage};
use crate::profile::{Feature, Profile, ProfileRegistry, Role};
use crate::queue::{CallOutcome, CorrelationQueue, SendFn};
use crate::router::{HandlerTable, ProfileHandler, Router};
use crate::timer::{Timer, TokioTimer};
use crate::transport::{FrameSender, Link, Transport};
use crate::validation::{PayloadValidator, Validate, Violation};

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Role the local side plays
    pub role: Role,
    /// Identity used in log lines (station id or CSMS name)
    pub identity: String,
    /// Deadline for a reply once a call is in flight
    pub request_timeout: Duration,
    /// Capacity of the error-observation channel
    pub error_capacity: usize,
    pub id_strategy: IdStrategy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            role: Role::ChargingStation,
            identity: "ocppj".to_string(),
            request_timeout: Duration::from_secs(30),
            error_capacity: 64,
            id_strategy: IdStrategy::Sequential,
        }
    }
}

impl ConnectionConfig {
    pub fn new(role: Role, identity: impl Into<String>) -> Self {
        Self {
            role,
            identity: identity.into(),
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    pub fn with_id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }
}

/// Assembles a connection: profiles, handlers and collaborators
///
/// Everything is fixed at `build`; registry and handler table are read-only
/// for the life of the connection.
#[derive(Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    registry: ProfileRegistry,
    handlers: HandlerTable,
    validator: Option<Arc<dyn PayloadValidator>>,
    timer: Option<Arc<dyn Timer>>,
}

impl ConnectionBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Register a profile the local side supports
    pub fn with_profile(mut self, profile: Profile) -> Result<Self, OcppError> {
        self.registry.register(profile)?;
        Ok(self)
    }

    /// Replace the registry wholesale
    pub fn with_registry(mut self, registry: ProfileRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Install the handler servicing inbound calls of a profile
    pub fn with_handler(mut self, profile: &str, handler: impl ProfileHandler + 'static) -> Self {
        self.handlers.install(profile, Arc::new(handler));
        self
    }

    /// Use an external schema check instead of the registry's typed shapes
    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn build(self) -> Result<Connection, OcppError> {
        let timer: Arc<dyn Timer> = match self.timer {
            Some(timer) => timer,
            None => {
                let timer = TokioTimer::current().ok_or_else(|| {
                    OcppError::Config("no timer given and no tokio runtime to arm deadlines on".to_string())
                })?;
                Arc::new(timer)
            }
        };

        if self.registry.is_empty() {
            warn!("[{}] Connection has no registered profiles", self.config.identity);
        }

        let registry = Arc::new(self.registry);
        let validator: Arc<dyn PayloadValidator> = match self.validator {
            Some(validator) => validator,
            None => registry.clone() as Arc<dyn PayloadValidator>,
        };

        let (reporter, errors_rx) = ErrorReporter::channel(self.config.error_capacity);
        let router = Router::new(
            registry.clone(),
            Arc::new(self.handlers),
            validator.clone(),
            self.config.role,
            reporter.clone(),
        );
        let queue = CorrelationQueue::new(timer, self.config.request_timeout);
        let (closed, _) = watch::channel(false);

        Ok(Connection {
            inner: Arc::new(Inner {
                ids: Arc::new(MessageIdGenerator::new(self.config.id_strategy)),
                config: self.config,
                registry,
                validator,
                router,
                queue,
                reporter,
                errors_rx: Mutex::new(Some(errors_rx)),
                state: Mutex::new(LinkState::Unstarted),
                closed: Arc::new(closed),
            }),
        })
    }
}

enum LinkState {
    Unstarted,
    Running {
        outbound: FrameSender,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

struct Inner {
    config: ConnectionConfig,
    registry: Arc<ProfileRegistry>,
    validator: Arc<dyn PayloadValidator>,
    router: Router,
    queue: CorrelationQueue,
    ids: Arc<MessageIdGenerator>,
    reporter: ErrorReporter,
    errors_rx: Mutex<Option<mpsc::Receiver<OcppError>>>,
    state: Mutex<LinkState>,
    closed: Arc<watch::Sender<bool>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.queue.shutdown();
        if let LinkState::Running { tasks, .. } = &*self.state.lock() {
            for task in tasks {
                task.abort();
            }
        }
    }
}

/// One OCPP-J connection to a peer
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(config)
    }

    /// Open a link through `transport` and start servicing it
    pub async fn start(&self, transport: &dyn Transport, address: &str) -> Result<(), OcppError> {
        if !matches!(*self.inner.state.lock(), LinkState::Unstarted) {
            return Err(OcppError::AlreadyStarted);
        }
        info!("[{}] Connecting to {}", self.inner.config.identity, address);
        let link = transport.open(address).await?;
        self.attach(link)
    }

    /// Service an already open link; must run inside a tokio runtime
    pub fn attach(&self, link: Link) -> Result<(), OcppError> {
        let mut state = self.inner.state.lock();
        if !matches!(*state, LinkState::Unstarted) {
            return Err(OcppError::AlreadyStarted);
        }

        let (outbound, inbound, mut tasks) = link.into_parts();
        let (calls_tx, calls_rx) = mpsc::unbounded_channel::<Call>();

        let dispatcher = Dispatcher {
            router: self.inner.router.clone(),
            outbound: outbound.clone(),
            reporter: self.inner.reporter.clone(),
        };
        tasks.push(tokio::spawn(dispatcher.run(calls_rx)));

        let reader = Reader {
            identity: self.inner.config.identity.clone(),
            queue: self.inner.queue.clone(),
            outbound: outbound.clone(),
            reporter: self.inner.reporter.clone(),
            calls: calls_tx,
            closed: self.inner.closed.clone(),
        };
        tasks.push(tokio::spawn(reader.run(inbound)));

        *state = LinkState::Running { outbound, tasks };
        info!("[{}] Link attached as {}", self.inner.config.identity, self.inner.config.role);
        Ok(())
    }

    /// Cancel all outstanding calls and tear the link down
    ///
    /// The receive side is aborted. The write side is released rather than
    /// killed, so a WebSocket link still sends its Close frame.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), LinkState::Stopped);
        self.inner.queue.shutdown();
        if let LinkState::Running { outbound, tasks } = previous {
            drop(outbound);
            for task in tasks {
                task.abort();
            }
            info!("[{}] Connection stopped", self.inner.config.identity);
        }
        self.inner.closed.send_replace(true);
    }

    /// Send a call and hand its outcome to `callback`
    ///
    /// Gating failures (not started, unsupported action, invalid payload)
    /// are returned directly and nothing is written. Once admitted,
    /// `callback` runs exactly once: with the reply, the peer's CALLERROR,
    /// a timeout, a write failure or a cancellation.
    pub fn send_request_async(
        &self,
        action: &str,
        payload: Value,
        callback: impl FnOnce(CallOutcome) + Send + 'static,
    ) -> Result<(), OcppError> {
        let outbound = self.admit(action, &payload)?;

        let ids = self.inner.ids.clone();
        let name = action.to_string();
        let send: SendFn = Box::new(move || {
            // Sends only run while the slot is free: no id is outstanding.
            let (message_id, text) = ids.encode_call(&name, payload, |_| false)?;
            outbound.send(text)?;
            debug!("Sent {} ({})", name, message_id);
            Ok(message_id)
        });

        let validator = self.inner.validator.clone();
        let name = action.to_string();
        let settle = Box::new(move |outcome: CallOutcome| {
            let outcome = outcome.and_then(|response| {
                validator.validate_response(&name, &response)?;
                Ok(response)
            });
            callback(outcome)
        });

        self.inner.queue.enqueue(send, settle)
    }

    /// Send a call and wait for its outcome
    pub async fn send_request(&self, action: &str, payload: Value) -> Result<Value, OcppError> {
        let (tx, rx) = oneshot::channel();
        self.send_request_async(action, payload, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.await.map_err(|_| OcppError::Cancelled)?
    }

    /// Send a call and block the current thread until its outcome
    ///
    /// For plain OS threads outside the tokio runtime. Called from a thread
    /// that has a runtime context (including `spawn_blocking`), it fails with
    /// `Config` before anything is written; use `send_request` there.
    pub fn send_request_blocking(&self, action: &str, payload: Value) -> Result<Value, OcppError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(OcppError::Config(
                "send_request_blocking called from within a tokio runtime".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        self.send_request_async(action, payload, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.blocking_recv().map_err(|_| OcppError::Cancelled)?
    }

    /// Typed call: encode `request`, send it and decode the response
    pub async fn call<F: Feature>(&self, request: F::Request) -> Result<F::Response, OcppError> {
        request.validate()?;
        let payload = serde_json::to_value(&request)?;
        let response = self.send_request(F::ACTION, payload).await?;
        let response: F::Response =
            serde_json::from_value(response).map_err(|e| Violation::from_serde(&e))?;
        response.validate()?;
        Ok(response)
    }

    /// Receiving end of the error-observation channel; handed out once
    pub fn errors(&self) -> Option<mpsc::Receiver<OcppError>> {
        self.inner.errors_rx.lock().take()
    }

    /// Resolves once the link has ended
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Id of the outbound call awaiting its reply
    pub fn in_flight(&self) -> Option<String> {
        self.inner.queue.in_flight()
    }

    /// Number of outbound calls waiting for the flight slot
    pub fn buffered(&self) -> usize {
        self.inner.queue.buffered()
    }

    pub fn role(&self) -> Role {
        self.inner.config.role
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.inner.registry
    }

    /// Check an outbound call may be sent; returns the link to write it to
    fn admit(&self, action: &str, payload: &Value) -> Result<FrameSender, OcppError> {
        let outbound = match &*self.inner.state.lock() {
            LinkState::Running { outbound, .. } => outbound.clone(),
            LinkState::Unstarted => return Err(OcppError::NotStarted),
            LinkState::Stopped => return Err(OcppError::QueueClosed),
        };

        let descriptor =
            self.inner
                .registry
                .resolve(action)
                .ok_or_else(|| OcppError::UnsupportedAction {
                    action: action.to_string(),
                    reason: "no registered profile declares it".to_string(),
                })?;

        let role = self.inner.config.role;
        if !descriptor.direction().may_initiate(role) {
            return Err(OcppError::UnsupportedAction {
                action: action.to_string(),
                reason: format!("may not be initiated by the {}", role),
            });
        }

        self.inner.validator.validate_request(action, payload)?;
        Ok(outbound)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.inner.config.identity)
            .field("role", &self.inner.config.role)
            .field("queue", &self.inner.queue)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receive task: classifies inbound frames
struct Reader {
    identity: String,
    queue: CorrelationQueue,
    outbound: FrameSender,
    reporter: ErrorReporter,
    calls: mpsc::UnboundedSender<Call>,
    closed: Arc<watch::Sender<bool>>,
}

impl Reader {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = inbound.recv().await {
            self.handle_frame(&frame);
        }

        info!("[{}] Link closed by peer", self.identity);
        self.queue.shutdown();
        self.closed.send_replace(true);
    }

    fn handle_frame(&self, frame: &str) {
        match OcppMessage::parse(frame.as_bytes()) {
            Ok(OcppMessage::Call(call)) => {
                if self.calls.send(call).is_err() {
                    debug!("Dispatcher gone, dropping inbound call");
                }
            }
            Ok(OcppMessage::CallResult(result)) => {
                self.settle(&result.message_id, Ok(result.payload));
            }
            Ok(OcppMessage::CallError(error)) => {
                let message_id = error.message_id.clone();
                self.settle(&message_id, Err(error.into_error()));
            }
            Err(e) => {
                if let Some(message_id) = salvage_call_id(frame.as_bytes()) {
                    let reply = CallError::new(message_id, ErrorCode::ProtocolError, e.to_string());
                    if let Err(send_err) = reply.to_text().and_then(|text| self.outbound.send(text)) {
                        self.reporter.report(send_err);
                    }
                }
                self.reporter.report(e);
            }
        }
    }

    fn settle(&self, message_id: &str, outcome: CallOutcome) {
        if let Err(e) = self.queue.resolve(message_id, outcome) {
            self.reporter.report(e);
        }
    }
}

/// Dispatch task: answers inbound calls in arrival order
struct Dispatcher {
    router: Router,
    outbound: FrameSender,
    reporter: ErrorReporter,
}

impl Dispatcher {
    async fn run(self, mut calls: mpsc::UnboundedReceiver<Call>) {
        while let Some(call) = calls.recv().await {
            let reply = self.router.dispatch(call).await;
            if let Err(e) = reply.to_text().and_then(|text| self.outbound.send(text)) {
                self.reporter.report(e);
            }
        }
    }
}
