//! Inbound call dispatch
//!
//! Every inbound CALL produces exactly one reply. The router resolves the
//! action, checks that the peer may initiate it, finds the handler installed
//! for the owning profile, validates the payload and runs the handler.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ErrorCode, ErrorReporter, OcppError};
use crate::messages::{Call, CallError, CallResult, OcppMessage};
use crate::profile::{Feature, ProfileRegistry, Role};
use crate::validation::{PayloadValidator, Violation};

/// Domain error returned by a handler, sent back as a CALLERROR
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn not_supported(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.code, self.description)
    }
}

impl std::error::Error for HandlerError {}

impl From<Violation> for HandlerError {
    fn from(v: Violation) -> Self {
        Self::new(v.kind.code(), v.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("Failed to encode response: {}", e))
    }
}

impl From<OcppError> for HandlerError {
    fn from(e: OcppError) -> Self {
        match e {
            OcppError::Fault { code, description, details } => Self {
                code,
                description,
                details,
            },
            other => Self::new(other.code(), other.to_string()),
        }
    }
}

/// Outcome of a handler: a response payload, a domain error, or (faulty
/// handlers only) neither
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// Inbound side of one profile's actions
pub trait ProfileHandler: Send + Sync {
    fn handle<'a>(&'a self, action: &'a str, payload: Value) -> BoxFuture<'a, HandlerResult>;
}

type Invoke = Box<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Profile handler assembled from per-action closures
///
/// ```ignore
/// let handlers = ActionHandlers::new()
///     .on::<Heartbeat, _, _>(|_req| async { Ok(HeartbeatResponse { current_time: Utc::now() }) });
/// ```
#[derive(Default)]
pub struct ActionHandlers {
    actions: HashMap<String, Invoke>,
}

impl ActionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a typed action
    pub fn on<F, H, Fut>(mut self, handler: H) -> Self
    where
        F: Feature,
        H: Fn(F::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<F::Response, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoke: Invoke = Box::new(move |payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let request: F::Request = serde_json::from_value(payload)
                    .map_err(|e| HandlerError::from(Violation::from_serde(&e)))?;
                let response = (*handler)(request).await?;
                let payload = serde_json::to_value(response)?;
                Ok::<_, HandlerError>(Some(payload))
            })
        });
        self.actions.insert(F::ACTION.to_string(), invoke);
        self
    }

    /// Handle an action on raw JSON payloads
    pub fn on_untyped<H, Fut>(mut self, action: impl Into<String>, handler: H) -> Self
    where
        H: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoke: Invoke = Box::new(move |payload| {
            let handler = handler.clone();
            Box::pin(async move { (*handler)(payload).await })
        });
        self.actions.insert(action.into(), invoke);
        self
    }

    pub fn handles(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }
}

impl ProfileHandler for ActionHandlers {
    fn handle<'a>(&'a self, action: &'a str, payload: Value) -> BoxFuture<'a, HandlerResult> {
        match self.actions.get(action) {
            Some(invoke) => invoke(payload),
            None => Box::pin(async move {
                let result: HandlerResult = Err(HandlerError::not_supported(format!(
                    "No handler for action {}",
                    action
                )));
                result
            }),
        }
    }
}

impl std::fmt::Debug for ActionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandlers")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Installed handlers, keyed by profile name
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn ProfileHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the handler for a profile
    pub fn install(&mut self, profile: impl Into<String>, handler: Arc<dyn ProfileHandler>) {
        self.handlers.insert(profile.into(), handler);
    }

    pub fn get(&self, profile: &str) -> Option<&Arc<dyn ProfileHandler>> {
        self.handlers.get(profile)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("profiles", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Turns inbound calls into replies
#[derive(Clone)]
pub struct Router {
    registry: Arc<ProfileRegistry>,
    handlers: Arc<HandlerTable>,
    validator: Arc<dyn PayloadValidator>,
    role: Role,
    reporter: ErrorReporter,
}

impl Router {
    /// `role` is the local role; calls are initiated by its peer
    pub fn new(
        registry: Arc<ProfileRegistry>,
        handlers: Arc<HandlerTable>,
        validator: Arc<dyn PayloadValidator>,
        role: Role,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            registry,
            handlers,
            validator,
            role,
            reporter,
        }
    }

    /// Produce the single reply for `call`
    pub async fn dispatch(&self, call: Call) -> OcppMessage {
        let Call {
            message_id,
            action,
            payload,
        } = call;
        debug!("Dispatching {} ({})", action, message_id);

        let Some(descriptor) = self.registry.resolve(&action) else {
            return reply_error(
                message_id,
                ErrorCode::NotImplemented,
                format!("Action {} is not implemented", action),
            );
        };

        if !descriptor.direction().may_initiate(self.role.peer()) {
            return reply_error(
                message_id,
                ErrorCode::NotSupported,
                format!("Action {} may not be initiated by the {}", action, self.role.peer()),
            );
        }

        let Some(handler) = self.handlers.get(descriptor.profile()) else {
            return reply_error(
                message_id,
                ErrorCode::NotSupported,
                format!("No handler installed for profile {}", descriptor.profile()),
            );
        };

        if let Err(violation) = self.validator.validate_request(&action, &payload) {
            debug!("Rejecting {} ({}): {}", action, message_id, violation);
            return reply_error(message_id, violation.kind.code(), violation.to_string());
        }

        let outcome = AssertUnwindSafe(handler.handle(&action, payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(Some(response))) => match self.validator.validate_response(&action, &response) {
                Ok(()) => OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: response,
                }),
                Err(violation) => self.fault(
                    message_id,
                    action,
                    format!("response failed validation: {}", violation),
                ),
            },
            Ok(Ok(None)) => self.fault(
                message_id,
                action,
                "returned neither a response nor an error".to_string(),
            ),
            Ok(Err(e)) => {
                debug!("Handler for {} ({}) answered {}", action, message_id, e);
                OcppMessage::CallError(
                    CallError::new(message_id, e.code, e.description).with_details(e.details),
                )
            }
            Err(_) => self.fault(message_id, action, "panicked".to_string()),
        }
    }

    fn fault(&self, message_id: String, action: String, reason: String) -> OcppMessage {
        warn!("Handler for {} failed on call {}: {}", action, message_id, reason);
        self.reporter.report(OcppError::HandlerFault {
            action,
            message_id: message_id.clone(),
            reason,
        });
        reply_error(message_id, ErrorCode::InternalError, "Internal handler error")
    }
}

fn reply_error(message_id: String, code: ErrorCode, description: impl Into<String>) -> OcppMessage {
    OcppMessage::CallError(CallError::new(message_id, code, description))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ActionDescriptor, Direction, Profile};
    use crate::validation::{check_gte, Validate};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct CountRequest {
        count: i64,
    }

    impl Validate for CountRequest {
        fn validate(&self) -> Result<(), Violation> {
            check_gte("count", self.count, 0)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct CountResponse {
        doubled: i64,
    }

    impl Validate for CountResponse {
        fn validate(&self) -> Result<(), Violation> {
            Ok(())
        }
    }

    struct Double;

    impl Feature for Double {
        const ACTION: &'static str = "Double";
        const DIRECTION: Direction = Direction::CsmsToStation;
        type Request = CountRequest;
        type Response = CountResponse;
    }

    fn registry() -> Arc<ProfileRegistry> {
        let registry = ProfileRegistry::new()
            .with_profile(
                Profile::new("P").with_action(ActionDescriptor::untyped("Ping", Direction::Both)),
            )
            .unwrap()
            .with_profile(Profile::new("Math").with_feature::<Double>())
            .unwrap()
            .with_profile(Profile::new("Upstream").with_action(ActionDescriptor::untyped(
                "Report",
                Direction::StationToCsms,
            )))
            .unwrap();
        Arc::new(registry)
    }

    fn router(handlers: HandlerTable) -> (Router, tokio::sync::mpsc::Receiver<OcppError>) {
        let (reporter, rx) = ErrorReporter::channel(8);
        let registry = registry();
        let router = Router::new(
            registry.clone(),
            Arc::new(handlers),
            registry,
            Role::ChargingStation,
            reporter,
        );
        (router, rx)
    }

    fn math_handlers() -> HandlerTable {
        let mut table = HandlerTable::new();
        table.install(
            "Math",
            Arc::new(ActionHandlers::new().on::<Double, _, _>(|req| async move {
                Ok(CountResponse {
                    doubled: req.count * 2,
                })
            })),
        );
        table
    }

    fn expect_error(reply: OcppMessage) -> CallError {
        match reply {
            OcppMessage::CallError(e) => e,
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_known_action_without_handler_is_not_supported() {
        let (router, _rx) = router(HandlerTable::new());
        let reply = router.dispatch(Call::new("1", "Ping", json!({}))).await;

        let error = expect_error(reply);
        assert_eq!(error.message_id, "1");
        assert_eq!(error.error_code, ErrorCode::NotSupported);
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_implemented() {
        let (router, _rx) = router(math_handlers());
        let error = expect_error(router.dispatch(Call::new("7", "Reboot", json!({}))).await);
        assert_eq!(error.message_id, "7");
        assert_eq!(error.error_code, ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        let (router, _rx) = router(math_handlers());
        match router.dispatch(Call::new("2", "Double", json!({"count": 21}))).await {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "2");
                assert_eq!(result.payload, json!({"doubled": 42}));
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_violations_map_to_their_codes() {
        let (router, _rx) = router(math_handlers());

        let range = expect_error(router.dispatch(Call::new("3", "Double", json!({"count": -1}))).await);
        assert_eq!(range.error_code, ErrorCode::PropertyConstraintViolation);

        let missing = expect_error(router.dispatch(Call::new("4", "Double", json!({}))).await);
        assert_eq!(missing.error_code, ErrorCode::OccurrenceConstraintViolation);

        let wrong_type =
            expect_error(router.dispatch(Call::new("5", "Double", json!({"count": "x"}))).await);
        assert_eq!(wrong_type.error_code, ErrorCode::TypeConstraintViolation);
    }

    #[tokio::test]
    async fn test_peer_may_not_initiate_upstream_action() {
        let mut table = HandlerTable::new();
        table.install(
            "Upstream",
            Arc::new(ActionHandlers::new().on_untyped("Report", |_| async { Ok(Some(json!({}))) })),
        );
        let (router, _rx) = router(table);

        let error = expect_error(router.dispatch(Call::new("6", "Report", json!({}))).await);
        assert_eq!(error.error_code, ErrorCode::NotSupported);
    }

    #[tokio::test]
    async fn test_domain_error_is_forwarded() {
        let mut table = HandlerTable::new();
        table.install(
            "P",
            Arc::new(ActionHandlers::new().on_untyped("Ping", |_| async {
                Err(HandlerError::new(ErrorCode::SecurityError, "not allowed")
                    .with_details(json!({"reason": "locked"})))
            })),
        );
        let (router, mut rx) = router(table);

        let error = expect_error(router.dispatch(Call::new("8", "Ping", json!({}))).await);
        assert_eq!(error.error_code, ErrorCode::SecurityError);
        assert_eq!(error.error_description, "not allowed");
        assert_eq!(error.error_details, json!({"reason": "locked"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_handler_outcome_is_internal_error() {
        let mut table = HandlerTable::new();
        table.install(
            "P",
            Arc::new(ActionHandlers::new().on_untyped("Ping", |_| async { Ok(None) })),
        );
        let (router, mut rx) = router(table);

        let error = expect_error(router.dispatch(Call::new("9", "Ping", json!({}))).await);
        assert_eq!(error.error_code, ErrorCode::InternalError);
        match rx.try_recv() {
            Ok(OcppError::HandlerFault { action, message_id, .. }) => {
                assert_eq!(action, "Ping");
                assert_eq!(message_id, "9");
            }
            other => panic!("Expected HandlerFault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_internal_error() {
        let mut table = HandlerTable::new();
        table.install(
            "P",
            Arc::new(ActionHandlers::new().on_untyped("Ping", |_| async {
                if true {
                    panic!("boom");
                }
                Ok(None)
            })),
        );
        let (router, mut rx) = router(table);

        let error = expect_error(router.dispatch(Call::new("10", "Ping", json!({}))).await);
        assert_eq!(error.error_code, ErrorCode::InternalError);
        assert!(matches!(rx.try_recv(), Ok(OcppError::HandlerFault { .. })));
    }

    #[tokio::test]
    async fn test_profile_handler_without_action_is_not_supported() {
        let mut table = HandlerTable::new();
        table.install("P", Arc::new(ActionHandlers::new()));
        let (router, _rx) = router(table);

        let error = expect_error(router.dispatch(Call::new("11", "Ping", json!({}))).await);
        assert_eq!(error.error_code, ErrorCode::NotSupported);
    }
}
