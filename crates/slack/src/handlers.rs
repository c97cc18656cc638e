//! Built-in handler registrations.

use tracing::info;

use crate::events::{EventClass, EventPayload, HandlerRegistry, RegistrationError, Response};

pub const HELLO_COMMAND: &str = "/hello";

/// The bot's handler table, ready to be frozen into a dispatcher.
pub fn default_registry() -> Result<HandlerRegistry, RegistrationError> {
    let mut registry = HandlerRegistry::new();
    registry.register(EventClass::Command, HELLO_COMMAND, hello_command)?;
    registry.register(EventClass::Message, "message", log_message)?;
    registry.register(EventClass::Reaction, "reaction_added", log_reaction)?;
    registry.register(EventClass::Reaction, "reaction_removed", log_reaction)?;
    Ok(registry)
}

pub fn hello_command(payload: &EventPayload) -> Response {
    Response::text(format!("Hey there <@{}>!", payload.user_id))
}

fn log_message(payload: &EventPayload) -> Response {
    info!(
        event_name = "handler.message",
        channel_id = %payload.channel_id,
        user_id = %payload.user_id,
        ts = payload.ts.as_deref().unwrap_or("unknown"),
        "message received"
    );
    Response::NoResponse
}

fn log_reaction(payload: &EventPayload) -> Response {
    info!(
        event_name = "handler.reaction",
        channel_id = %payload.channel_id,
        user_id = %payload.user_id,
        reaction = payload.reaction.as_deref().unwrap_or("unknown"),
        ts = payload.ts.as_deref().unwrap_or("unknown"),
        "reaction changed"
    );
    Response::NoResponse
}
