//! Processor Service Library
//!
//! Consumes object-created notifications from the upload queue, transforms
//! each uploaded image into the output bucket and announces completions on
//! the processed topic. Delivery is at-least-once; a shared processing
//! ledger keeps duplicate notifications from producing duplicate work.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod services;
pub mod topic;
pub mod transform;

pub use config::Config;
pub use error::{PipelineError, Result};
