use std::time;

use ais_common::ais::PayloadError;
use ais_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors raised while handling a single decoded envelope.
/// None of these stop the receive loop, the dispatcher logs them and moves on.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("unexpected payload shape: {0}")]
    Payload(#[from] PayloadError),
    #[error("storage write failed: {0}")]
    Store(#[from] StoreError),
}

/// Enumeration of errors for a single connection to the stream.
/// Every one of these ends the current connection and schedules a reconnect.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to connect to stream: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("timed out connecting to stream after {0:?}")]
    ConnectTimeout(time::Duration),
    #[error("failed to send subscription: {0}")]
    Subscribe(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode subscription: {0}")]
    EncodeSubscription(#[from] serde_json::Error),
    #[error("stream receive failed: {0}")]
    Receive(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("no frames received for {0:?}")]
    Idle(time::Duration),
}

/// Enumeration of errors that stop the process.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error("failed to register signal handler: {0}")]
    SignalError(#[source] std::io::Error),
}
