//! # gt-types
//!
//! Shared vocabulary for GlowTune: suggestions and their content ids,
//! evaluation results, run configuration and the error taxonomy.

pub mod config;
pub mod errors;
pub mod result;
pub mod suggestion;

pub use config::*;
pub use errors::*;
pub use result::*;
pub use suggestion::*;
