use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{events::OutboundMessage, socket::TransportError};

/// Handle for the single acknowledgement an envelope may send. Clones share the
/// sent flag, so a second acknowledgement through any clone is rejected.
#[derive(Clone, Debug)]
pub struct AckToken {
    id: String,
    channel_id: String,
    deadline: Instant,
    sent: Arc<AtomicBool>,
}

impl AckToken {
    pub fn issue(id: impl Into<String>, channel_id: impl Into<String>, deadline: Instant) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            deadline,
            sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_window(
        id: impl Into<String>,
        channel_id: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self::issue(id, channel_id, Instant::now() + window)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("acknowledgement for `{token_id}` is {overdue_ms}ms past its deadline")]
    AckExpired { token_id: String, overdue_ms: u128 },
    #[error("acknowledgement for `{token_id}` was already sent")]
    AckAlreadySent { token_id: String },
    #[error("acknowledgement for `{token_id}` could not be delivered: {source}")]
    Delivery { token_id: String, source: TransportError },
}

/// Outbound path for acknowledgement text.
#[async_trait]
pub trait ResponsePoster: Send + Sync {
    async fn post(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), TransportError>;
}

#[derive(Clone)]
pub struct Acknowledger {
    poster: Arc<dyn ResponsePoster>,
}

impl Acknowledger {
    pub fn new(poster: Arc<dyn ResponsePoster>) -> Self {
        Self { poster }
    }

    /// Posts `message` to the token's originating channel. The token's deadline
    /// is checked before the sent flag is claimed, so an expired token stays
    /// unsent. The post itself is also bounded by the deadline; a post cut off
    /// there leaves the token spent and reports `AckExpired`.
    pub async fn acknowledge(
        &self,
        token: &AckToken,
        message: &OutboundMessage,
    ) -> Result<(), AckError> {
        let now = Instant::now();
        if now > token.deadline {
            return Err(AckError::AckExpired {
                token_id: token.id.clone(),
                overdue_ms: now.duration_since(token.deadline).as_millis(),
            });
        }

        if token.sent.swap(true, Ordering::AcqRel) {
            return Err(AckError::AckAlreadySent { token_id: token.id.clone() });
        }

        let deadline = tokio::time::Instant::from_std(token.deadline);
        match tokio::time::timeout_at(deadline, self.poster.post(&token.channel_id, message)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(AckError::Delivery { token_id: token.id.clone(), source });
            }
            Err(_elapsed) => {
                warn!(
                    event_name = "ack.post_timeout",
                    correlation_id = %token.id,
                    channel_id = %token.channel_id,
                    "acknowledgement post outlived the ack deadline; abandoned"
                );
                let overdue = Instant::now().saturating_duration_since(token.deadline);
                return Err(AckError::AckExpired {
                    token_id: token.id.clone(),
                    overdue_ms: overdue.as_millis(),
                });
            }
        }

        debug!(
            event_name = "ack.sent",
            correlation_id = %token.id,
            channel_id = %token.channel_id,
            "acknowledgement delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::ResponsePoster;
    use crate::{events::OutboundMessage, socket::TransportError};

    /// Records every posted message instead of calling the platform.
    #[derive(Default)]
    pub(crate) struct RecordingPoster {
        posted: Mutex<Vec<(String, OutboundMessage)>>,
    }

    impl RecordingPoster {
        pub(crate) async fn posted(&self) -> Vec<(String, OutboundMessage)> {
            self.posted.lock().await.clone()
        }
    }

    #[async_trait]
    impl ResponsePoster for RecordingPoster {
        async fn post(
            &self,
            channel_id: &str,
            message: &OutboundMessage,
        ) -> Result<(), TransportError> {
            self.posted.lock().await.push((channel_id.to_owned(), message.clone()));
            Ok(())
        }
    }
}
