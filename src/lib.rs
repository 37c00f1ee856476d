// Session token persistence and expiry classification
pub mod credentials;

// Store configuration
pub mod config;

// Maintenance CLI
pub mod cli;
