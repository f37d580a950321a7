pub mod config;
pub mod error;
pub mod query;
pub mod types;
pub mod validate;

pub use config::{Config, PluginManifest};
pub use error::NancyError;
pub use query::*;
pub use types::*;
pub use validate::{canonical_id, seal, validate, ValidationIssue};
