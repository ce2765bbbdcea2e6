//! Live-update service
//!
//! The browser-facing half of the photo pipeline: accepts uploads, holds
//! live SSE connections per upload session and pushes each completion
//! event it receives from the processed topic to the matching session.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod sns;
pub mod state;

pub use config::Config;
pub use error::{AppError, ConnectionError, Result};
pub use hub::{FanoutHub, Subscription};
pub use state::AppState;
