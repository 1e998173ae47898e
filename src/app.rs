use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::CallEngine;
use crate::monitor::MonitorClient;
use crate::mqtt::{MqttPublisher, StatusPublisher};
use crate::store::CallStore;

pub struct App {
    pub config: Config,
    token: CancellationToken,
    publisher: Option<Arc<dyn StatusPublisher>>,
}

pub struct AppBuilder {
    config: Option<Config>,
    cancel_token: Option<CancellationToken>,
    publisher: Option<Arc<dyn StatusPublisher>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            publisher: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Replaces the broker-backed publisher, used by scenario tests.
    pub fn with_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> Result<App> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(App {
            config,
            token: self.cancel_token.unwrap_or_default(),
            publisher: self.publisher,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// Brings up store, broker session and engine, then supervises the
    /// router connection until the cancellation token fires. Shutdown runs
    /// in reverse creation order: reader, timers, offline publish, broker
    /// session, database.
    pub async fn run(self) -> Result<()> {
        let store = CallStore::open(&self.config.db.data_dir).await?;
        info!(data_dir = %self.config.db.data_dir, "database ready");

        let publisher: Arc<dyn StatusPublisher> = match self.publisher {
            Some(publisher) => publisher,
            None => Arc::new(MqttPublisher::connect(&self.config.broker)?),
        };

        let mut engine = CallEngine::new(
            store.clone(),
            publisher.clone(),
            self.token.child_token(),
            self.config.app.call_history_size,
            self.config.debug_topics_enabled(),
        );
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let engine_token = self.token.child_token();
        let engine_task =
            tokio::spawn(async move { engine.run(&mut event_rx, engine_token).await });

        let mut monitor = MonitorClient::new(&self.config)?;
        let reconnect_delay = Duration::from_secs(self.config.app.reconnect_delay);

        // Malformed records are dropped by the reader; surface them here.
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        let error_token = self.token.child_token();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = error_token.cancelled() => break,
                    error = error_rx.recv() => match error {
                        Some(error) => {
                            warn!(error = %error, "dropping malformed call monitor record")
                        }
                        None => break,
                    },
                }
            }
        });

        // Per-line machines and their timers survive a lost router
        // connection; only the reader restarts.
        while !self.token.is_cancelled() {
            match monitor.connect().await {
                Ok(stream) => {
                    info!(
                        host = %self.config.router.host,
                        port = self.config.router.port,
                        "connected to call monitor"
                    );
                    if let Err(e) = monitor
                        .run(
                            stream,
                            event_tx.clone(),
                            error_tx.clone(),
                            self.token.child_token(),
                        )
                        .await
                    {
                        error!(error = %e, "call monitor connection lost");
                    }
                }
                Err(e) => error!(error = %e, "failed to connect to call monitor"),
            }

            if self.token.is_cancelled() {
                break;
            }
            info!(
                delay_secs = self.config.app.reconnect_delay,
                "reconnecting to call monitor"
            );
            select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = self.token.cancelled() => break,
            }
        }

        // Closing the event channel lets the engine drain in-flight events.
        drop(event_tx);
        drop(error_tx);
        if let Err(e) = engine_task.await? {
            warn!(error = %e, "engine stopped with error");
        }

        if let Err(e) = publisher.shutdown().await {
            warn!(error = %e, "failed to publish offline status");
        }
        store.close().await?;
        info!("fritz2mqtt stopped");
        Ok(())
    }
}
