pub mod ais;
pub mod health;
pub mod metrics;
pub mod store;
