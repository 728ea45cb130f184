//! Resumable Uploadr Library
//!
//! Server and client for resumable file uploads over the tus 1.0 protocol.
//!
//! # Features
//!
//! - **Resumable**: Interrupted uploads continue from the last stored byte
//! - **Deferred Length**: Total size may be declared after the first chunk
//! - **Concatenation**: Partial uploads merged into one final upload
//! - **Completion**: Finished files moved into per-entity folders and recorded
//! - **JWT Auth**: Optional bearer-token ownership of uploads
//!
//! # Example
//!
//! ```no_run
//! use resumable_uploadr::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod completion;
pub mod config;
pub mod metrics;
pub mod persistence;
pub mod router;
pub mod server;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
