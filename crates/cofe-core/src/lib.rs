//! Cofe Core Library
//!
//! Shared functionality for the Cofe chat relay:
//! - Request correlation between prompt submissions and workflow callbacks
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod correlator;
pub mod error;
pub mod tracing_init;

pub use config::{Config, DeliveryMode};
pub use correlator::{
    Correlator, CorrelatorConfig, CorrelatorError, Outcome, PendingRequest, RequestId,
    RequestState, SweepReport,
};
pub use error::{Error, Result};
