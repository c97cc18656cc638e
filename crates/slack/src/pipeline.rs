use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    ack::{AckError, AckToken, Acknowledger},
    events::{DispatchError, DispatchOutcome, Dispatched, EventDispatcher, EventEnvelope},
    ingest::{self, Inbound, IngestError},
};

/// Result of admitting a raw payload.
#[derive(Debug)]
pub enum Admitted {
    Challenge(String),
    Envelope(EventEnvelope),
    /// Well-formed but of a type with no handler route; never dispatched.
    Unrecognized,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Challenge(String),
    Responded,
    NoResponse,
    Unhandled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Malformed(#[from] IngestError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Ack(#[from] AckError),
}

/// Ingest, dispatch and acknowledge, shared by both transport modes.
pub struct EventPipeline {
    dispatcher: EventDispatcher,
    acknowledger: Acknowledger,
    ack_window: Duration,
}

impl EventPipeline {
    pub fn new(dispatcher: EventDispatcher, acknowledger: Acknowledger, ack_window: Duration) -> Self {
        Self { dispatcher, acknowledger, ack_window }
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Parses `raw` and, for events, issues the envelope's ack token. The ack
    /// deadline starts counting here.
    pub fn admit(&self, raw: &Value, correlation_id: &str) -> Result<Admitted, IngestError> {
        self.admit_inbound(ingest::ingest(raw), correlation_id)
    }

    pub fn admit_inbound(
        &self,
        inbound: Result<Inbound, IngestError>,
        correlation_id: &str,
    ) -> Result<Admitted, IngestError> {
        match inbound {
            Ok(Inbound::Handshake { challenge }) => {
                debug!(
                    event_name = "ingress.handshake",
                    correlation_id,
                    "answering url verification handshake"
                );
                Ok(Admitted::Challenge(challenge))
            }
            Ok(Inbound::Event(incoming)) => {
                let token = AckToken::with_window(
                    correlation_id,
                    incoming.payload.channel_id.clone(),
                    self.ack_window,
                );
                info!(
                    event_name = "ingress.event_received",
                    correlation_id,
                    event_class = %incoming.event_class,
                    discriminator = %incoming.discriminator,
                    channel_id = %incoming.payload.channel_id,
                    "received platform event"
                );
                Ok(Admitted::Envelope(incoming.into_envelope(correlation_id, token)))
            }
            Ok(Inbound::Unrecognized { event_type }) => {
                info!(
                    event_name = "dispatch.unhandled",
                    correlation_id,
                    event_type = %event_type,
                    "ignoring unrecognized event type"
                );
                Ok(Admitted::Unrecognized)
            }
            Err(error) => {
                warn!(
                    event_name = "ingress.rejected",
                    correlation_id,
                    error = %error,
                    "rejected malformed platform payload"
                );
                Err(error)
            }
        }
    }

    /// Runs one envelope to its terminal outcome. Consumes the envelope, so it
    /// is dispatched at most once.
    pub async fn process(&self, envelope: EventEnvelope) -> Result<PipelineOutcome, PipelineError> {
        let correlation_id = envelope.correlation_id.clone();
        let event_class = envelope.event_class;
        let discriminator = envelope.discriminator.clone();

        let Dispatched { outcome, ack_token } = match self.dispatcher.dispatch(envelope).await {
            Ok(dispatched) => dispatched,
            Err(error) => {
                warn!(
                    event_name = "pipeline.dispatch_failed",
                    correlation_id = %correlation_id,
                    event_class = %event_class,
                    discriminator = %discriminator,
                    error = %error,
                    "event dispatch failed; no acknowledgement sent"
                );
                return Err(error.into());
            }
        };

        let response = match outcome {
            DispatchOutcome::Unhandled => return Ok(PipelineOutcome::Unhandled),
            DispatchOutcome::Handled(response) => response,
        };
        let Some(message) = response.to_message() else {
            return Ok(PipelineOutcome::NoResponse);
        };

        if let Err(error) = self.acknowledger.acknowledge(&ack_token, &message).await {
            warn!(
                event_name = "pipeline.ack_failed",
                correlation_id = %correlation_id,
                event_class = %event_class,
                discriminator = %discriminator,
                error = %error,
                "acknowledgement failed; not retrying"
            );
            return Err(error.into());
        }

        Ok(PipelineOutcome::Responded)
    }

    pub async fn handle(
        &self,
        raw: &Value,
        correlation_id: &str,
    ) -> Result<PipelineOutcome, PipelineError> {
        match self.admit(raw, correlation_id)? {
            Admitted::Challenge(challenge) => Ok(PipelineOutcome::Challenge(challenge)),
            Admitted::Envelope(envelope) => self.process(envelope).await,
            Admitted::Unrecognized => Ok(PipelineOutcome::Unhandled),
        }
    }
}
