use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use secrecy::SecretString;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{watch, Mutex},
    task::JoinSet,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{
    pipeline::{Admitted, EventPipeline, PipelineOutcome},
    web::{validate_wss_url, SlackWebClient},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("platform api call failed: {0}")]
    Api(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

/// One decoded Socket Mode frame.
#[derive(Clone, Debug, PartialEq)]
pub enum SocketFrame {
    Hello,
    Disconnect { reason: Option<String> },
    Envelope { envelope_id: String, kind: String, payload: Value },
    Other { kind: String },
}

pub fn parse_frame(text: &str) -> Result<SocketFrame, TransportError> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|error| TransportError::Receive(format!("frame is not valid JSON: {error}")))?;
    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default().to_owned();

    match kind.as_str() {
        "hello" => Ok(SocketFrame::Hello),
        "disconnect" => Ok(SocketFrame::Disconnect {
            reason: raw.get("reason").and_then(Value::as_str).map(str::to_owned),
        }),
        _ => match raw.get("envelope_id").and_then(Value::as_str) {
            Some(envelope_id) => Ok(SocketFrame::Envelope {
                envelope_id: envelope_id.to_owned(),
                kind,
                payload: raw.get("payload").cloned().unwrap_or(Value::Null),
            }),
            None => Ok(SocketFrame::Other { kind }),
        },
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// `Ok(None)` means the peer closed the stream.
    async fn next_frame(&self) -> Result<Option<SocketFrame>, TransportError>;
    async fn send_receipt(&self, envelope_id: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket Mode over a real websocket. The URL comes from
/// `apps.connections.open` on every connect.
pub struct WebSocketTransport {
    client: Arc<SlackWebClient>,
    app_token: SecretString,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    writer: Mutex<Option<SplitSink<WsStream, WsMessage>>>,
}

impl WebSocketTransport {
    pub fn new(client: Arc<SlackWebClient>, app_token: SecretString) -> Self {
        Self { client, app_token, reader: Mutex::new(None), writer: Mutex::new(None) }
    }

    async fn send(&self, message: WsMessage) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(TransportError::Send("websocket is not connected".to_owned()));
        };
        sink.send(message).await.map_err(|error| TransportError::Send(error.to_string()))
    }
}

#[async_trait]
impl SocketTransport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = self.client.connections_open(&self.app_token).await?;
        validate_wss_url(&url)?;

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| TransportError::Connect(format!("websocket connect failed: {error}")))?;
        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(source);
        Ok(())
    }

    async fn next_frame(&self) -> Result<Option<SocketFrame>, TransportError> {
        loop {
            let message = {
                let mut reader = self.reader.lock().await;
                let Some(source) = reader.as_mut() else {
                    return Err(TransportError::Receive("websocket is not connected".to_owned()));
                };
                source.next().await
            };

            match message {
                None => return Ok(None),
                Some(Err(error)) => return Err(TransportError::Receive(error.to_string())),
                Some(Ok(WsMessage::Text(text))) => match parse_frame(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(error) => {
                        warn!(
                            event_name = "ingress.session.frame_rejected",
                            error = %error,
                            "skipping undecodable socket frame"
                        );
                    }
                },
                Some(Ok(WsMessage::Ping(data))) => self.send(WsMessage::Pong(data)).await?,
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(_)) => {}
            }
        }
    }

    async fn send_receipt(&self, envelope_id: &str) -> Result<(), TransportError> {
        let receipt = serde_json::json!({ "envelope_id": envelope_id });
        self.send(WsMessage::Text(receipt.to_string())).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let sink = self.writer.lock().await.take();
        self.reader.lock().await.take();
        if let Some(mut sink) = sink {
            sink.close().await.map_err(|error| TransportError::Disconnect(error.to_string()))?;
        }
        Ok(())
    }
}

enum SessionExit {
    Shutdown,
    Closed,
}

/// Session-mode event loop: keeps one connection open, hands every envelope to
/// the pipeline on its own task and reconnects with backoff when the
/// connection drops.
pub struct SessionRunner {
    transport: Arc<dyn SocketTransport>,
    pipeline: Arc<EventPipeline>,
    reconnect_policy: ReconnectPolicy,
    shutdown_grace: Duration,
}

impl SessionRunner {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        pipeline: Arc<EventPipeline>,
        reconnect_policy: ReconnectPolicy,
        shutdown_grace: Duration,
    ) -> Self {
        Self { transport, pipeline, reconnect_policy, shutdown_grace }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// # Errors
    ///
    /// Only the very first connection attempt is fatal; later failures are
    /// retried without limit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut tasks = JoinSet::new();
        let mut attempt: u32 = 0;
        let mut connected_once = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!(event_name = "session.connecting", attempt, "opening session connection");
            match self.transport.connect().await {
                Ok(()) => {
                    info!(event_name = "session.connected", attempt, "session connection established");
                    connected_once = true;
                    attempt = 0;
                }
                Err(error) if !connected_once => {
                    warn!(
                        event_name = "session.connect_failed",
                        error = %error,
                        "initial session connection failed"
                    );
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.reconnect_policy.backoff(attempt);
                    warn!(
                        event_name = "session.connect_failed",
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %error,
                        "session reconnect failed; retrying after backoff"
                    );
                    attempt = attempt.saturating_add(1);
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            let exit = self.pump(&mut shutdown, &mut tasks).await;
            if let Err(error) = self.transport.disconnect().await {
                debug!(event_name = "session.disconnect_failed", error = %error, "ignoring disconnect failure");
            }

            match exit {
                Ok(SessionExit::Shutdown) => break,
                Ok(SessionExit::Closed) => {
                    info!(event_name = "session.closed", "session connection closed; reconnecting");
                }
                Err(error) => {
                    warn!(
                        event_name = "session.transport_failed",
                        error = %error,
                        "session transport failed; reconnecting"
                    );
                }
            }

            let delay = self.reconnect_policy.backoff(attempt);
            attempt = attempt.saturating_add(1);
            if wait_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        self.drain(&mut tasks).await;
        Ok(())
    }

    async fn pump(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        tasks: &mut JoinSet<()>,
    ) -> Result<SessionExit, TransportError> {
        loop {
            while let Some(finished) = tasks.try_join_next() {
                log_task_result(finished);
            }

            let frame = tokio::select! {
                frame = self.transport.next_frame() => frame?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionExit::Shutdown);
                    }
                    continue;
                }
            };

            match frame {
                None => return Ok(SessionExit::Closed),
                Some(SocketFrame::Hello) => {
                    info!(event_name = "session.hello", "session handshake received");
                }
                Some(SocketFrame::Disconnect { reason }) => {
                    info!(
                        event_name = "session.disconnect_requested",
                        reason = reason.as_deref().unwrap_or("unknown"),
                        "platform requested reconnect"
                    );
                    return Ok(SessionExit::Closed);
                }
                Some(SocketFrame::Envelope { envelope_id, kind, payload }) => {
                    self.transport.send_receipt(&envelope_id).await?;
                    debug!(
                        event_name = "session.receipt_sent",
                        correlation_id = %envelope_id,
                        envelope_type = %kind,
                        "sent envelope receipt"
                    );

                    match self.pipeline.admit(&payload, &envelope_id) {
                        Ok(Admitted::Envelope(envelope)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            tasks.spawn(async move {
                                let correlation_id = envelope.correlation_id.clone();
                                if let Ok(outcome) = pipeline.process(envelope).await {
                                    log_outcome(&correlation_id, &outcome);
                                }
                            });
                        }
                        Ok(Admitted::Challenge(_)) => {
                            debug!(
                                correlation_id = %envelope_id,
                                "ignoring handshake delivered over session transport"
                            );
                        }
                        // Logged by the pipeline.
                        Ok(Admitted::Unrecognized) | Err(_) => {}
                    }
                }
                Some(SocketFrame::Other { kind }) => {
                    debug!(envelope_type = %kind, "ignoring unrecognized socket frame");
                }
            }
        }
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        info!(
            event_name = "session.draining",
            in_flight = tasks.len(),
            grace_ms = self.shutdown_grace.as_millis() as u64,
            "waiting for in-flight events"
        );
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(finished) = tasks.join_next().await {
                log_task_result(finished);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                event_name = "session.drain_timeout",
                remaining = tasks.len(),
                "shutdown grace elapsed; aborting in-flight events"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn log_outcome(correlation_id: &str, outcome: &PipelineOutcome) {
    debug!(
        event_name = "session.event_processed",
        correlation_id,
        outcome = ?outcome,
        "session event processed"
    );
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        if !error.is_cancelled() {
            warn!(event_name = "session.task_failed", error = %error, "event task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{watch, Mutex};

    use super::{
        parse_frame, ReconnectPolicy, SessionRunner, SocketFrame, SocketTransport, TransportError,
    };
    use crate::{
        ack::{testing::RecordingPoster, Acknowledger},
        events::{EventClass, EventPayload, HandlerRegistry, Response},
        pipeline::EventPipeline,
    };

    type FrameResult = Result<Option<SocketFrame>, TransportError>;

    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
        exhausted: watch::Sender<bool>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        frames: VecDeque<FrameResult>,
        connect_attempts: usize,
        receipts: Vec<String>,
        disconnect_calls: usize,
    }

    impl ScriptedTransport {
        /// Flips `exhausted` to `true` once the frame script runs out, which
        /// stops the runner under test.
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            frames: Vec<FrameResult>,
            exhausted: watch::Sender<bool>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    frames: frames.into(),
                    ..ScriptedState::default()
                }),
                exhausted,
            }
        }

        async fn connect_attempts(&self) -> usize {
            self.state.lock().await.connect_attempts
        }

        async fn receipts(&self) -> Vec<String> {
            self.state.lock().await.receipts.clone()
        }

        async fn disconnect_calls(&self) -> usize {
            self.state.lock().await.disconnect_calls
        }
    }

    #[async_trait]
    impl SocketTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_frame(&self) -> Result<Option<SocketFrame>, TransportError> {
            let next = self.state.lock().await.frames.pop_front();
            match next {
                Some(frame) => frame,
                None => {
                    let _ = self.exhausted.send(true);
                    std::future::pending().await
                }
            }
        }

        async fn send_receipt(&self, envelope_id: &str) -> Result<(), TransportError> {
            self.state.lock().await.receipts.push(envelope_id.to_owned());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            self.state.lock().await.disconnect_calls += 1;
            Ok(())
        }
    }

    fn command_frame(envelope_id: &str, command: &str, channel_id: &str) -> FrameResult {
        Ok(Some(SocketFrame::Envelope {
            envelope_id: envelope_id.to_owned(),
            kind: "slash_commands".to_owned(),
            payload: json!({
                "command": command,
                "text": "",
                "user_id": "U1",
                "channel_id": channel_id
            }),
        }))
    }

    fn runner_for(
        transport: Arc<ScriptedTransport>,
        handler_timeout: Duration,
        shutdown_grace: Duration,
    ) -> (SessionRunner, Arc<RecordingPoster>) {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventClass::Command, "/hello", |_payload: &EventPayload| {
                Response::text("Hello!")
            })
            .expect("register /hello");
        registry
            .register(EventClass::Command, "/slow", |_payload: &EventPayload| {
                std::thread::sleep(Duration::from_millis(300));
                Response::text("finally")
            })
            .expect("register /slow");

        let poster = Arc::new(RecordingPoster::default());
        let pipeline = EventPipeline::new(
            registry.freeze(handler_timeout),
            Acknowledger::new(poster.clone()),
            Duration::from_secs(3),
        );
        let runner = SessionRunner::new(
            transport,
            Arc::new(pipeline),
            ReconnectPolicy { base_delay_ms: 0, max_delay_ms: 0 },
            shutdown_grace,
        );
        (runner, poster)
    }

    #[tokio::test]
    async fn reconnects_after_dropped_connection_and_keeps_dispatching() {
        let (exhausted, shutdown) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(()), Ok(())],
            vec![
                Ok(Some(SocketFrame::Hello)),
                command_frame("env-1", "/hello", "C1"),
                Ok(None),
                command_frame("env-2", "/hello", "C2"),
            ],
            exhausted,
        ));
        let (runner, poster) =
            runner_for(transport.clone(), Duration::from_secs(1), Duration::from_secs(1));

        runner.run(shutdown).await.expect("runner should stop cleanly");

        assert_eq!(transport.connect_attempts().await, 2);
        assert_eq!(transport.receipts().await, vec!["env-1", "env-2"]);
        let mut channels =
            poster.posted().await.into_iter().map(|(channel, _)| channel).collect::<Vec<_>>();
        channels.sort();
        assert_eq!(channels, vec!["C1", "C2"]);
    }

    #[tokio::test]
    async fn initial_connect_failure_is_fatal() {
        let (exhausted, shutdown) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned()))],
            vec![],
            exhausted,
        ));
        let (runner, _poster) =
            runner_for(transport.clone(), Duration::from_secs(1), Duration::from_secs(1));

        let result = runner.run(shutdown).await;

        assert_eq!(result, Err(TransportError::Connect("network down".to_owned())));
        assert_eq!(transport.connect_attempts().await, 1);
    }

    #[tokio::test]
    async fn later_connect_failures_are_retried() {
        let (exhausted, shutdown) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Ok(()),
                Err(TransportError::Connect("flap-1".to_owned())),
                Err(TransportError::Connect("flap-2".to_owned())),
                Ok(()),
            ],
            vec![Err(TransportError::Receive("connection reset".to_owned()))],
            exhausted,
        ));
        let (runner, _poster) =
            runner_for(transport.clone(), Duration::from_secs(1), Duration::from_secs(1));

        runner.run(shutdown).await.expect("runner should survive reconnect failures");

        assert_eq!(transport.connect_attempts().await, 4);
        assert_eq!(transport.disconnect_calls().await, 2);
    }

    #[tokio::test]
    async fn disconnect_frame_triggers_reconnect() {
        let (exhausted, shutdown) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(()), Ok(())],
            vec![Ok(Some(SocketFrame::Disconnect { reason: Some("refresh_requested".to_owned()) }))],
            exhausted,
        ));
        let (runner, _poster) =
            runner_for(transport.clone(), Duration::from_secs(1), Duration::from_secs(1));

        runner.run(shutdown).await.expect("runner should stop cleanly");

        assert_eq!(transport.connect_attempts().await, 2);
    }

    #[tokio::test]
    async fn malformed_envelope_gets_receipt_but_no_response() {
        let (exhausted, shutdown) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(())],
            vec![Ok(Some(SocketFrame::Envelope {
                envelope_id: "env-bad".to_owned(),
                kind: "events_api".to_owned(),
                payload: json!({"type": "event_callback"}),
            }))],
            exhausted,
        ));
        let (runner, poster) =
            runner_for(transport.clone(), Duration::from_secs(1), Duration::from_secs(1));

        runner.run(shutdown).await.expect("runner should stop cleanly");

        assert_eq!(transport.receipts().await, vec!["env-bad"]);
        assert!(poster.posted().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_events_still_running_after_grace() {
        let (exhausted, shutdown) = watch::channel(false);
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Ok(())],
            vec![command_frame("env-slow", "/slow", "C1")],
            exhausted,
        ));
        let (runner, poster) =
            runner_for(transport.clone(), Duration::from_secs(2), Duration::from_millis(20));

        runner.run(shutdown).await.expect("runner should stop cleanly");
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(poster.posted().await.is_empty());
    }

    #[test]
    fn parses_socket_frames() {
        assert_eq!(parse_frame(r#"{"type":"hello","num_connections":1}"#), Ok(SocketFrame::Hello));
        assert_eq!(
            parse_frame(r#"{"type":"disconnect","reason":"warning"}"#),
            Ok(SocketFrame::Disconnect { reason: Some("warning".to_owned()) })
        );
        assert_eq!(
            parse_frame(
                r#"{"type":"events_api","envelope_id":"e1","payload":{"type":"event_callback"}}"#
            ),
            Ok(SocketFrame::Envelope {
                envelope_id: "e1".to_owned(),
                kind: "events_api".to_owned(),
                payload: json!({"type": "event_callback"}),
            })
        );
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }
}
