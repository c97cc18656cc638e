//! Slack integration for greeter.
//!
//! - **Events** (`events`) - envelope model, handler registry and dispatcher
//! - **Ingest** (`ingest`) - wire payloads into events
//! - **Ack** (`ack`) - single-use acknowledgement tokens
//! - **Pipeline** (`pipeline`) - ingest, dispatch, acknowledge
//! - **Socket Mode** (`socket`) - Session transport over a websocket
//! - **Events API** (`listener`) - Listener transport over HTTP
//!
//! # Architecture
//!
//! ```text
//! Socket Mode / Events API → EventPipeline → EventDispatcher → handler
//!                                 ↓
//!                       Acknowledger → chat.postMessage
//! ```

pub mod ack;
pub mod events;
pub mod handlers;
pub mod ingest;
pub mod listener;
pub mod pipeline;
pub mod signature;
pub mod socket;
pub mod web;

pub use ack::{AckError, AckToken, Acknowledger, ResponsePoster};
pub use events::{
    DispatchError, DispatchOutcome, Dispatched, EventClass, EventDispatcher, EventEnvelope,
    EventHandler, EventPayload, HandlerRegistry, OutboundMessage, RegistrationError, Response,
};
pub use ingest::IngestError;
pub use pipeline::{EventPipeline, PipelineError, PipelineOutcome};
pub use socket::{ReconnectPolicy, SessionRunner, TransportError, WebSocketTransport};
pub use web::SlackWebClient;
