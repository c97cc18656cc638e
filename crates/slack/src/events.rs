use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ack::AckToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventClass {
    Command,
    Message,
    Reaction,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Message => "message",
            Self::Reaction => "reaction",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform fields carried by an inbound event. Which optional fields are
/// populated depends on the event class.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventPayload {
    pub user_id: String,
    pub channel_id: String,
    pub text: Option<String>,
    pub reaction: Option<String>,
    pub ts: Option<String>,
    pub team_id: Option<String>,
}

/// A parsed inbound event that has not yet been issued an ack token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingEvent {
    pub event_class: EventClass,
    pub discriminator: String,
    pub payload: EventPayload,
}

impl IncomingEvent {
    pub fn into_envelope(
        self,
        correlation_id: impl Into<String>,
        ack_token: AckToken,
    ) -> EventEnvelope {
        EventEnvelope {
            correlation_id: correlation_id.into(),
            event_class: self.event_class,
            discriminator: self.discriminator,
            payload: self.payload,
            ack_token,
        }
    }
}

/// One inbound occurrence, normalized. Not `Clone`: an envelope is
/// moved into exactly one processing call.
#[derive(Debug)]
pub struct EventEnvelope {
    pub correlation_id: String,
    pub event_class: EventClass,
    pub discriminator: String,
    pub payload: EventPayload,
    pub ack_token: AckToken,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Text(String),
    NoResponse,
}

impl Response {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn to_message(&self) -> Option<OutboundMessage> {
        match self {
            Self::Text(text) => Some(OutboundMessage { text: text.clone() }),
            Self::NoResponse => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(Response),
    Unhandled,
}

/// A dispatched envelope: what the handler decided, plus the token needed to
/// acknowledge it.
#[derive(Debug)]
pub struct Dispatched {
    pub outcome: DispatchOutcome,
    pub ack_token: AckToken,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("handler already registered for ({event_class}, `{discriminator}`)")]
    DuplicateRegistration { event_class: EventClass, discriminator: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("handler for ({event_class}, `{discriminator}`) exceeded its {budget_ms}ms budget")]
    HandlerTimeout { event_class: EventClass, discriminator: String, budget_ms: u128 },
    #[error("handler for ({event_class}, `{discriminator}`) failed: {reason}")]
    HandlerFailed { event_class: EventClass, discriminator: String, reason: String },
}

/// Synchronous acknowledgement logic. Any `Fn(&EventPayload) -> Response` is a
/// handler.
pub trait EventHandler: Send + Sync {
    fn handle(&self, payload: &EventPayload) -> Response;
}

impl<F> EventHandler for F
where
    F: Fn(&EventPayload) -> Response + Send + Sync,
{
    fn handle(&self, payload: &EventPayload) -> Response {
        self(payload)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct HandlerKey {
    event_class: EventClass,
    discriminator: String,
}

/// Startup-time registration table. Frozen into an [`EventDispatcher`] before
/// ingestion begins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(
        &mut self,
        event_class: EventClass,
        discriminator: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistrationError>
    where
        H: EventHandler + 'static,
    {
        let key = HandlerKey { event_class, discriminator: discriminator.into() };
        if self.handlers.contains_key(&key) {
            return Err(RegistrationError::DuplicateRegistration {
                event_class: key.event_class,
                discriminator: key.discriminator,
            });
        }

        self.handlers.insert(key, Arc::new(handler));
        Ok(())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn freeze(self, handler_timeout: Duration) -> EventDispatcher {
        EventDispatcher { handlers: Arc::new(self.handlers), handler_timeout }
    }
}

/// Read-only routing table shared by every concurrent dispatch.
#[derive(Clone)]
pub struct EventDispatcher {
    handlers: Arc<HashMap<HandlerKey, Arc<dyn EventHandler>>>,
    handler_timeout: Duration,
}

impl EventDispatcher {
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    pub fn is_registered(&self, event_class: EventClass, discriminator: &str) -> bool {
        self.handlers
            .contains_key(&HandlerKey { event_class, discriminator: discriminator.to_owned() })
    }

    /// Routes `envelope` to its handler under the handler timeout. The
    /// envelope is consumed, so it reaches a handler at most once; its ack
    /// token comes back with the outcome.
    ///
    /// ```compile_fail
    /// # use greeter_slack::events::{EventDispatcher, EventEnvelope};
    /// # async fn twice(dispatcher: EventDispatcher, envelope: EventEnvelope) {
    /// let _ = dispatcher.dispatch(envelope).await;
    /// let _ = dispatcher.dispatch(envelope).await;
    /// # }
    /// ```
    pub async fn dispatch(&self, envelope: EventEnvelope) -> Result<Dispatched, DispatchError> {
        let EventEnvelope { correlation_id, event_class, discriminator, payload, ack_token } =
            envelope;
        let key = HandlerKey { event_class, discriminator };
        let Some(handler) = self.handlers.get(&key) else {
            info!(
                event_name = "dispatch.unhandled",
                correlation_id = %correlation_id,
                event_class = %event_class,
                discriminator = %key.discriminator,
                "no handler registered for event"
            );
            return Ok(Dispatched { outcome: DispatchOutcome::Unhandled, ack_token });
        };

        debug!(
            event_name = "dispatch.invoke",
            correlation_id = %correlation_id,
            event_class = %event_class,
            discriminator = %key.discriminator,
            "invoking handler"
        );

        let handler = Arc::clone(handler);
        let invocation = tokio::task::spawn_blocking(move || handler.handle(&payload));

        // On timeout the join handle is dropped; the blocking task finishes on
        // its own and its result is discarded.
        match tokio::time::timeout(self.handler_timeout, invocation).await {
            Ok(Ok(response)) => {
                Ok(Dispatched { outcome: DispatchOutcome::Handled(response), ack_token })
            }
            Ok(Err(join_error)) => {
                warn!(
                    event_name = "dispatch.handler_failed",
                    correlation_id = %correlation_id,
                    event_class = %event_class,
                    discriminator = %key.discriminator,
                    error = %join_error,
                    "handler invocation failed"
                );
                Err(DispatchError::HandlerFailed {
                    event_class,
                    discriminator: key.discriminator,
                    reason: join_error.to_string(),
                })
            }
            Err(_elapsed) => {
                warn!(
                    event_name = "dispatch.handler_timeout",
                    correlation_id = %correlation_id,
                    event_class = %event_class,
                    discriminator = %key.discriminator,
                    budget_ms = self.handler_timeout.as_millis() as u64,
                    "handler exceeded its time budget; invocation abandoned"
                );
                Err(DispatchError::HandlerTimeout {
                    event_class,
                    discriminator: key.discriminator,
                    budget_ms: self.handler_timeout.as_millis(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use super::{
        DispatchError, DispatchOutcome, EventClass, EventEnvelope, EventPayload, HandlerRegistry,
        IncomingEvent, RegistrationError, Response,
    };
    use crate::ack::AckToken;

    fn envelope(event_class: EventClass, discriminator: &str) -> EventEnvelope {
        IncomingEvent {
            event_class,
            discriminator: discriminator.to_owned(),
            payload: EventPayload {
                user_id: "U1".to_owned(),
                channel_id: "C1".to_owned(),
                text: Some(String::new()),
                ..EventPayload::default()
            },
        }
        .into_envelope("env-1", AckToken::with_window("env-1", "C1", Duration::from_secs(3)))
    }

    #[tokio::test]
    async fn dispatcher_invokes_exactly_the_registered_handler_once() {
        let hello_calls = Arc::new(AtomicUsize::new(0));
        let other_calls = Arc::new(AtomicUsize::new(0));

        let mut registry = HandlerRegistry::new();
        let counter = Arc::clone(&hello_calls);
        registry
            .register(EventClass::Command, "/hello", move |_payload: &EventPayload| {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::text("Hello!")
            })
            .expect("register /hello");
        let counter = Arc::clone(&other_calls);
        registry
            .register(EventClass::Command, "/other", move |_payload: &EventPayload| {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::NoResponse
            })
            .expect("register /other");
        let dispatcher = registry.freeze(Duration::from_secs(1));

        let outcome = dispatcher
            .dispatch(envelope(EventClass::Command, "/hello"))
            .await
            .expect("dispatch")
            .outcome;

        assert_eq!(outcome, DispatchOutcome::Handled(Response::text("Hello!")));
        assert_eq!(hello_calls.load(Ordering::SeqCst), 1);
        assert_eq!(other_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatcher_returns_unhandled_when_no_handler_registered() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventClass::Command, "/hello", |_payload: &EventPayload| {
                Response::text("Hello!")
            })
            .expect("register");
        let dispatcher = registry.freeze(Duration::from_secs(1));

        // Same discriminator under a different class is a different key.
        let outcome = dispatcher
            .dispatch(envelope(EventClass::Message, "/hello"))
            .await
            .expect("dispatch")
            .outcome;

        assert_eq!(outcome, DispatchOutcome::Unhandled);
    }

    #[test]
    fn duplicate_registration_is_rejected_and_first_registration_holds() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventClass::Reaction, "reaction_added", |_payload: &EventPayload| {
                Response::text("first")
            })
            .expect("first registration");

        let error = registry
            .register(EventClass::Reaction, "reaction_added", |_payload: &EventPayload| {
                Response::text("second")
            })
            .expect_err("duplicate should fail");

        assert_eq!(
            error,
            RegistrationError::DuplicateRegistration {
                event_class: EventClass::Reaction,
                discriminator: "reaction_added".to_owned(),
            }
        );
        assert_eq!(registry.handler_count(), 1);
    }

    #[tokio::test]
    async fn first_registration_still_answers_after_duplicate_attempt() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventClass::Command, "/hello", |_payload: &EventPayload| {
                Response::text("first")
            })
            .expect("first registration");
        let _ = registry.register(EventClass::Command, "/hello", |_payload: &EventPayload| {
            Response::text("second")
        });
        let dispatcher = registry.freeze(Duration::from_secs(1));

        let outcome = dispatcher
            .dispatch(envelope(EventClass::Command, "/hello"))
            .await
            .expect("dispatch")
            .outcome;

        assert_eq!(outcome, DispatchOutcome::Handled(Response::text("first")));
    }

    #[tokio::test]
    async fn slow_handler_times_out_without_blocking_other_dispatches() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventClass::Command, "/slow", |_payload: &EventPayload| {
                std::thread::sleep(Duration::from_millis(400));
                Response::text("too late")
            })
            .expect("register /slow");
        registry
            .register(EventClass::Command, "/hello", |_payload: &EventPayload| {
                Response::text("Hello!")
            })
            .expect("register /hello");
        let dispatcher = registry.freeze(Duration::from_millis(100));

        let slow_envelope = envelope(EventClass::Command, "/slow");
        let fast_envelope = envelope(EventClass::Command, "/hello");
        let (slow, fast) =
            tokio::join!(dispatcher.dispatch(slow_envelope), dispatcher.dispatch(fast_envelope));

        assert!(matches!(
            slow,
            Err(DispatchError::HandlerTimeout { ref discriminator, .. }) if discriminator == "/slow"
        ));
        assert_eq!(
            fast.map(|dispatched| dispatched.outcome),
            Ok(DispatchOutcome::Handled(Response::text("Hello!")))
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated_as_handler_failure() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventClass::Message, "message", |_payload: &EventPayload| -> Response {
                panic!("handler bug")
            })
            .expect("register");
        let dispatcher = registry.freeze(Duration::from_secs(1));

        let result = dispatcher.dispatch(envelope(EventClass::Message, "message")).await;

        assert!(matches!(result, Err(DispatchError::HandlerFailed { .. })));
    }

    #[tokio::test]
    async fn dispatch_consumes_envelope_and_returns_its_unsent_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        registry
            .register(EventClass::Command, "/hello", move |_payload: &EventPayload| {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::text("Hello!")
            })
            .expect("register /hello");
        let dispatcher = registry.freeze(Duration::from_secs(1));
        let envelope = envelope(EventClass::Command, "/hello");
        let issued = envelope.ack_token.clone();

        let dispatched = dispatcher.dispatch(envelope).await.expect("dispatch");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatched.ack_token.id(), "env-1");
        assert_eq!(dispatched.ack_token.channel_id(), "C1");
        assert!(!dispatched.ack_token.is_sent());
        // The returned token is the envelope's own, not a fresh one.
        assert_eq!(dispatched.ack_token.deadline(), issued.deadline());
    }

    #[test]
    fn frozen_dispatcher_reports_registered_keys() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventClass::Reaction, "reaction_removed", |_payload: &EventPayload| {
                Response::NoResponse
            })
            .expect("register");
        let dispatcher = registry.freeze(Duration::from_millis(250));

        assert!(dispatcher.is_registered(EventClass::Reaction, "reaction_removed"));
        assert!(!dispatcher.is_registered(EventClass::Reaction, "reaction_added"));
        assert_eq!(dispatcher.handler_timeout(), Duration::from_millis(250));
    }
}
