//! Wire-level parsing of inbound platform payloads.
//!
//! Accepts the flat event shapes, the same events wrapped in an
//! `event_callback`, slash commands (JSON or form fields), and the
//! `url_verification` handshake.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::{EventClass, EventPayload, IncomingEvent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Answered by the transport without involving the dispatcher.
    Handshake { challenge: String },
    Event(IncomingEvent),
    /// A well-formed `event_callback` whose event type the bot has no parser
    /// for. Accepted and dropped.
    Unrecognized { event_type: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },
}

impl IngestError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload { reason: reason.into() }
    }
}

pub fn ingest_bytes(body: &[u8]) -> Result<Inbound, IngestError> {
    let raw: Value = serde_json::from_slice(body)
        .map_err(|error| IngestError::malformed(format!("body is not valid JSON: {error}")))?;
    ingest(&raw)
}

/// Slash commands posted as `application/x-www-form-urlencoded` fields.
pub fn ingest_form(fields: &HashMap<String, String>) -> Result<Inbound, IngestError> {
    let object = fields
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.clone())))
        .collect::<Map<String, Value>>();
    ingest(&Value::Object(object))
}

pub fn ingest(raw: &Value) -> Result<Inbound, IngestError> {
    let Some(object) = raw.as_object() else {
        return Err(IngestError::malformed("payload is not a JSON object"));
    };

    if object.contains_key("command") {
        return parse_command(object).map(Inbound::Event);
    }

    let event_type = required_str(object, "type")?;
    match event_type {
        "url_verification" => {
            let challenge = required_str(object, "challenge")?;
            Ok(Inbound::Handshake { challenge: challenge.to_owned() })
        }
        "event_callback" => {
            let Some(event) = object.get("event").and_then(Value::as_object) else {
                return Err(IngestError::malformed("event_callback is missing `event` object"));
            };
            let event_type = required_str(event, "type")?;
            if !is_known_event_type(event_type) {
                return Ok(Inbound::Unrecognized { event_type: event_type.to_owned() });
            }
            let team_id = optional_str(object, "team_id");
            let mut incoming = parse_event(event)?;
            if incoming.payload.team_id.is_none() {
                incoming.payload.team_id = team_id;
            }
            Ok(Inbound::Event(incoming))
        }
        _ => parse_event(object).map(Inbound::Event),
    }
}

fn parse_command(object: &Map<String, Value>) -> Result<IncomingEvent, IngestError> {
    let command = required_str(object, "command")?;
    if !command.starts_with('/') {
        return Err(IngestError::malformed(format!("command `{command}` must start with `/`")));
    }

    Ok(IncomingEvent {
        event_class: EventClass::Command,
        discriminator: command.to_owned(),
        payload: EventPayload {
            user_id: required_str(object, "user_id")?.to_owned(),
            channel_id: required_str(object, "channel_id")?.to_owned(),
            text: Some(optional_str(object, "text").unwrap_or_default()),
            reaction: None,
            ts: None,
            team_id: optional_str(object, "team_id"),
        },
    })
}

fn is_known_event_type(event_type: &str) -> bool {
    matches!(event_type, "message" | "reaction_added" | "reaction_removed")
}

fn parse_event(event: &Map<String, Value>) -> Result<IncomingEvent, IngestError> {
    let event_type = required_str(event, "type")?;
    match event_type {
        "message" => parse_message(event),
        "reaction_added" | "reaction_removed" => parse_reaction(event_type, event),
        other => Err(IngestError::malformed(format!("unsupported event type `{other}`"))),
    }
}

fn parse_message(event: &Map<String, Value>) -> Result<IncomingEvent, IngestError> {
    // Bot-authored and edited messages carry no author fields, so only plain
    // messages must have them.
    let discriminator = match optional_str(event, "subtype") {
        Some(subtype) => subtype,
        None if event.contains_key("bot_id") => "bot_message".to_owned(),
        None => "message".to_owned(),
    };
    let channel_id = either_str(event, "channel_id", "channel")?.to_owned();

    let payload = if discriminator == "message" {
        EventPayload {
            user_id: either_str(event, "user_id", "user")?.to_owned(),
            channel_id,
            text: Some(required_str(event, "text")?.to_owned()),
            reaction: None,
            ts: Some(required_str(event, "ts")?.to_owned()),
            team_id: optional_str(event, "team"),
        }
    } else {
        EventPayload {
            user_id: optional_str(event, "user_id")
                .or_else(|| optional_str(event, "user"))
                .unwrap_or_default(),
            channel_id,
            text: optional_str(event, "text"),
            reaction: None,
            ts: optional_str(event, "ts"),
            team_id: optional_str(event, "team"),
        }
    };

    Ok(IncomingEvent { event_class: EventClass::Message, discriminator, payload })
}

fn parse_reaction(
    event_type: &str,
    event: &Map<String, Value>,
) -> Result<IncomingEvent, IngestError> {
    let Some(item) = event.get("item").and_then(Value::as_object) else {
        return Err(IngestError::malformed(format!("{event_type} is missing `item` object")));
    };

    Ok(IncomingEvent {
        event_class: EventClass::Reaction,
        discriminator: event_type.to_owned(),
        payload: EventPayload {
            user_id: either_str(event, "user_id", "user")?.to_owned(),
            channel_id: required_str(item, "channel")?.to_owned(),
            text: None,
            reaction: Some(required_str(event, "reaction")?.to_owned()),
            ts: Some(required_str(item, "ts")?.to_owned()),
            team_id: optional_str(event, "team"),
        },
    })
}

fn required_str<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str, IngestError> {
    match object.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() || key == "text" => {
            Ok(value.as_str())
        }
        Some(Value::String(_)) => Err(IngestError::malformed(format!("field `{key}` is empty"))),
        Some(_) => Err(IngestError::malformed(format!("field `{key}` must be a string"))),
        None => Err(IngestError::malformed(format!("missing required field `{key}`"))),
    }
}

fn either_str<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    alias: &str,
) -> Result<&'a str, IngestError> {
    if object.contains_key(key) {
        required_str(object, key)
    } else {
        required_str(object, alias)
    }
}

fn optional_str(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_owned)
}
