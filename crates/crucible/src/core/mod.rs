//! Core framework types shared by every wrapper
//!
//! - [`error`]: the error enum and contract-violation reporting
//! - [`config`]: framework-wide settings
//! - [`mt`]: per-object opt-in locking

pub mod config;
pub mod error;
pub mod mt;

pub use config::FrameworkConfig;
pub use error::{CrucibleError, CrucibleResult};
pub use mt::{MtLock, MtSafety};
