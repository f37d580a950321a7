pub mod client;
pub mod error;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod supervisor;

pub use client::{PluginClient, PluginEvent};
pub use error::HostError;
pub use protocol::{HealthCheckResponse, IngestResponse, PluginStatus};
pub use registry::PluginRegistry;
pub use supervisor::{HostConfig, PluginHost, PluginReport, PluginState};
