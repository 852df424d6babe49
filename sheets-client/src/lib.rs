//! Sheets notebook client - sync core
//!
//! Mediates between local edits and a remote execution backend:
//! - [`model`]: the document model and its single mutation entry point
//! - [`transport`]: the reconnecting WebSocket connection
//! - [`activity`]: traffic direction and the connectivity indicator
//! - [`notebook`]: editor actions built on top of both

pub mod activity;
pub mod config;
pub mod debounce;
pub mod error;
pub mod model;
pub mod notebook;
pub mod timer;
pub mod transport;

pub use activity::{Direction, Indicator};
pub use config::Config;
pub use error::{ClientError, ConfigError};
pub use model::{File, Model, SharedModel};
pub use notebook::Notebook;
pub use transport::{ConnectionStatus, Transport};
