// Downstream API module
pub mod client;
