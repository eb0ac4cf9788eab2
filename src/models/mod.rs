pub mod audit;
pub mod config;
pub mod token;

pub use audit::{AuditCategory, AuditOutcome, AuditQuery, AuditRecord};
pub use config::AppConfig;
pub use token::AccessToken;
