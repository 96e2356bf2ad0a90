//! Lifecycle of the streaming connection: connect, subscribe, receive, reconnect.
use std::sync::Arc;
use std::time;

use ais_common::ais::{BoundingBox, Envelope, Subscription};
use ais_common::health::{ComponentStatus, HealthHandle};
use futures::{SinkExt, StreamExt};
use tokio::sync::{watch, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::config::{ApiKey, StreamConfig};
use crate::dispatch::Dispatcher;
use crate::error::StreamError;
use crate::metrics_consts::{
    FRAMES_RECEIVED, FRAMES_UNDECODABLE, STREAM_CONNECTION_STATE, STREAM_RECONNECTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Error,
    /// Terminal.
    Shutdown,
}

impl ConnectionState {
    fn as_gauge(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Closing => 3.0,
            ConnectionState::Error => 4.0,
            ConnectionState::Shutdown => 5.0,
        }
    }
}

/// Why a connection that did open came to an end.
#[derive(Debug)]
enum Disconnect {
    Shutdown,
    Closed { code: Option<u16>, reason: String },
}

/// Owns the one connection to the stream and keeps it alive until shutdown.
///
/// Frames are decoded here and handed to the dispatcher on their own tasks, so a slow
/// handler never holds up the socket. At most `max_concurrent_handlers` run at once; past
/// that the receive loop waits for one to finish.
pub struct ConnectionManager {
    url: String,
    api_key: ApiKey,
    bounding_box: BoundingBox,
    connect_timeout: time::Duration,
    idle_timeout: time::Duration,
    backoff: ReconnectBackoff,
    dispatcher: Arc<Dispatcher>,
    handler_permits: Arc<Semaphore>,
    max_concurrent_handlers: u32,
    state: watch::Sender<ConnectionState>,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: &StreamConfig,
        dispatcher: Arc<Dispatcher>,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        let max_concurrent_handlers =
            u32::try_from(config.max_concurrent_handlers.max(1)).unwrap_or(u32::MAX);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            bounding_box: config.bounding_box,
            connect_timeout: config.connect_timeout.0,
            idle_timeout: config.idle_timeout.0,
            backoff: ReconnectBackoff::new(
                config.reconnect_floor.0,
                config.reconnect_max.0,
                config.reconnect_jitter.0,
            ),
            dispatcher,
            handler_permits: Arc::new(Semaphore::new(max_concurrent_handlers as usize)),
            max_concurrent_handlers,
            state,
            liveness,
            shutdown,
        }
    }

    /// Follow state transitions from outside the manager.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "stream connection state");
        metrics::gauge!(STREAM_CONNECTION_STATE).set(state.as_gauge());
        self.state.send_replace(state);
    }

    /// Connect and reconnect until `shutdown` is cancelled, then wait for in-flight
    /// handlers to finish.
    pub async fn run(mut self) {
        while !self.shutdown.is_cancelled() {
            self.set_state(ConnectionState::Connecting);

            match self.connect_and_receive().await {
                Ok(Disconnect::Shutdown) => break,
                Ok(Disconnect::Closed { code, reason }) => {
                    warn!(?code, %reason, "stream closed by server");
                    self.set_state(ConnectionState::Closing);
                }
                Err(e) => {
                    error!(error = %e, "stream connection lost");
                    self.set_state(ConnectionState::Error);
                }
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting to stream");
            metrics::counter!(STREAM_RECONNECTS).increment(1);
            // Waiting out the backoff is expected, not a stall.
            self.liveness.report_healthy();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Shutdown);
        self.liveness.report_status(ComponentStatus::Unhealthy);

        // Every permit back means every dispatched handler has returned.
        match self
            .handler_permits
            .acquire_many(self.max_concurrent_handlers)
            .await
        {
            Ok(_permits) => info!("stream stopped, all handlers finished"),
            Err(e) => error!(error = %e, "failed to wait for in-flight handlers"),
        }
    }

    async fn connect_and_receive(&mut self) -> Result<Disconnect, StreamError> {
        let connect = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        );
        let (socket, _response) = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(Disconnect::Shutdown),
            connected = connect => connected
                .map_err(|_| StreamError::ConnectTimeout(self.connect_timeout))?
                .map_err(StreamError::Connect)?,
        };

        self.set_state(ConnectionState::Connected);
        self.backoff.reset();
        self.liveness.report_healthy();
        info!(url = %self.url, "connected to stream");

        let (mut sink, mut frames) = socket.split();

        let subscription = Subscription::new(self.api_key.expose(), &[self.bounding_box]);
        sink.send(Message::Text(serde_json::to_string(&subscription)?))
            .await
            .map_err(StreamError::Subscribe)?;
        info!(bounding_box = ?self.bounding_box, "subscription sent (API key redacted)");

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(error = %e, "failed to send close frame");
                    }
                    return Ok(Disconnect::Shutdown);
                }
                frame = tokio::time::timeout(self.idle_timeout, frames.next()) => {
                    frame.map_err(|_| StreamError::Idle(self.idle_timeout))?
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.on_frame(&text).await,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => self.on_frame(&text).await,
                    Err(e) => {
                        warn!(error = %e, "dropping binary frame that is not UTF-8");
                        metrics::counter!(FRAMES_UNDECODABLE).increment(1);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Disconnect::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                    });
                }
                // Pings are answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(StreamError::Receive(e)),
                None => {
                    return Ok(Disconnect::Closed {
                        code: None,
                        reason: "connection ended without a close frame".to_owned(),
                    });
                }
            }
        }
    }

    async fn on_frame(&self, text: &str) {
        metrics::counter!(FRAMES_RECEIVED).increment(1);
        self.liveness.report_healthy();

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping frame that is not a valid envelope");
                metrics::counter!(FRAMES_UNDECODABLE).increment(1);
                return;
            }
        };

        let permit = match self.handler_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "handler permits closed, dropping frame");
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&envelope).await;
            drop(permit);
        });
    }
}
