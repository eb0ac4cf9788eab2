pub mod config;
pub mod db;
pub mod logger;
pub mod oauth;

// Re-export frequently used helpers at the modules namespace top level
pub use config::*;
pub use logger::*;
