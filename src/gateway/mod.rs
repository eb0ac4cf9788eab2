// gateway module - single entry point for external health-data APIs

pub mod audit;
pub mod cache;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod middleware; // Axum middleware
pub mod rate_limiter;
pub mod retry;
pub mod server;
pub mod token_manager;
pub mod upstream; // Downstream HTTP client

pub use audit::{AuditContext, AuditRecorder, AuditSink};
pub use cache::{DataType, ResponseCache, TtlPolicy};
pub use channel::{Channel, GatewayRequest, Operation};
pub use client::{GatewayClient, GatewayResponse};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use rate_limiter::{RateLimiter, WindowStore};
pub use retry::{classify, ErrorKind, RetryPolicy};
pub use server::GatewayServer;
pub use token_manager::TokenManager;
