//! Everything that talks to the node: discovery, the device registry and
//! the isolation backend.

pub mod discovery;
pub mod isolation;
pub mod registry;

pub use discovery::{DeviceDescriptor, DiscoveryBackend, DiscoveryError, DiscoveryReport};
pub use isolation::{
    CommandIsolationBackend, IsolationBackend, IsolationConfig, IsolationError, IsolationSessions,
};
pub use registry::{Device, DeviceRegistry, RefreshSummary, RegistryConfig};
