use std::{sync::Arc, time::Duration};

use greeter_core::config::{AppConfig, ConfigError, LoadOptions, TransportMode};
use greeter_slack::{
    ack::{Acknowledger, ResponsePoster},
    events::RegistrationError,
    handlers::default_registry,
    listener::{self, ListenerState},
    pipeline::EventPipeline,
    signature::SignatureVerifier,
    socket::{ReconnectPolicy, SessionRunner, TransportError, WebSocketTransport},
    web::SlackWebClient,
};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub mode: TransportMode,
    pub pipeline: Arc<EventPipeline>,
    web_client: Arc<SlackWebClient>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("handler registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error("`{0}` is required for the selected transport mode")]
    MissingSecret(&'static str),
    #[error("could not bind listener on `{address}`: {source}")]
    Bind { address: String, source: std::io::Error },
    #[error("listener terminated: {0}")]
    Serve(#[source] std::io::Error),
    #[error("web api client setup failed: {0}")]
    WebClient(#[source] TransportError),
    #[error("session transport failed: {0}")]
    Session(#[from] TransportError),
}

pub fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config)
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let web_client = Arc::new(
        SlackWebClient::new(config.slack.bot_token.clone()).map_err(BootstrapError::WebClient)?,
    );
    let pipeline = build_pipeline(&config, web_client.clone())?;
    let mode = config.transport_mode();

    info!(
        event_name = "system.bootstrap.handlers_registered",
        correlation_id = "bootstrap",
        handler_count = pipeline.dispatcher().handler_count(),
        transport_mode = mode.as_str(),
        "handler table frozen"
    );

    Ok(Application { config, mode, pipeline: Arc::new(pipeline), web_client })
}

/// Registers the default handlers and wires them to `poster`. Registration
/// finishes here, before any transport starts ingesting.
pub fn build_pipeline(
    config: &AppConfig,
    poster: Arc<dyn ResponsePoster>,
) -> Result<EventPipeline, RegistrationError> {
    let dispatcher =
        default_registry()?.freeze(Duration::from_millis(config.dispatch.handler_timeout_ms));
    Ok(EventPipeline::new(
        dispatcher,
        Acknowledger::new(poster),
        Duration::from_millis(config.dispatch.ack_window_ms),
    ))
}

impl Application {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.config.dispatch.shutdown_grace_secs)
    }

    /// Runs the configured transport until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Fails when the first session connection cannot be established or the
    /// listener cannot bind.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), BootstrapError> {
        match self.mode {
            TransportMode::Session => self.run_session(shutdown).await,
            TransportMode::Listener => {
                let listener = self.bind_listener().await?;
                self.run_listener(listener, shutdown).await
            }
        }
    }

    async fn run_session(self, shutdown: watch::Receiver<bool>) -> Result<(), BootstrapError> {
        let app_token = self
            .config
            .slack
            .app_level_token
            .clone()
            .ok_or(BootstrapError::MissingSecret("slack.app_level_token"))?;
        let transport = WebSocketTransport::new(self.web_client.clone(), app_token);
        let runner = SessionRunner::new(
            Arc::new(transport),
            self.pipeline.clone(),
            ReconnectPolicy::default(),
            self.shutdown_grace(),
        );

        info!(
            event_name = "system.server.session_starting",
            correlation_id = "bootstrap",
            "starting session transport"
        );
        runner.run(shutdown).await?;
        Ok(())
    }

    pub async fn bind_listener(&self) -> Result<TcpListener, BootstrapError> {
        let address = self.config.transport.listen_address.clone();
        TcpListener::bind(&address).await.map_err(|source| BootstrapError::Bind { address, source })
    }

    pub async fn run_listener(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BootstrapError> {
        let secret = self
            .config
            .slack
            .signing_secret
            .clone()
            .ok_or(BootstrapError::MissingSecret("slack.signing_secret"))?;
        let grace = self.shutdown_grace();
        let state = ListenerState::new(self.pipeline.clone(), SignatureVerifier::new(secret));

        info!(
            event_name = "system.server.listener_starting",
            correlation_id = "bootstrap",
            listen_address = %listener
                .local_addr()
                .map(|address| address.to_string())
                .unwrap_or_else(|_| self.config.transport.listen_address.clone()),
            path = listener::EVENTS_PATH,
            "starting listener transport"
        );
        listener::serve(listener, state, shutdown, grace).await.map_err(BootstrapError::Serve)
    }
}
