//! Shared infrastructure for hopper components: logging setup and the
//! common error taxonomy.

pub mod error;
pub mod logging;

pub use error::{HopperError, Result};
