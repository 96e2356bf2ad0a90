pub mod backoff;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod metrics_consts;
pub mod pipeline;
pub mod stream;
pub mod timestamp;
