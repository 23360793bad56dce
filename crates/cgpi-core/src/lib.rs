//! cgpi-core: shared types for the cryptograpi client
//!
//! Error taxonomy, client configuration and API credentials. Everything that
//! the engines need is passed in explicitly; nothing here is process-global.

pub mod config;
pub mod credentials;
pub mod error;

pub use config::{ClientConfig, DEFAULT_HOST};
pub use credentials::Credentials;
pub use error::{CgpiError, CgpiResult};
