mod client;
mod models;

pub use client::{full_jitter_delay, IbGatewayConfig, IbGatewayProvider};
