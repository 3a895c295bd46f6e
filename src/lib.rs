//! Portproxy Library
//!
//! Dynamic TCP port forwarding for guest/VM networking: a control channel
//! receives container port-mapping updates and the proxy keeps one
//! forwarding listener per published port, relaying each accepted
//! connection to the declared upstream.

pub mod config;
pub mod control;
pub mod forwarder;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use control::ControlListener;
pub use protocol::{Binding, MappingRequest, PortSpec, Protocol};
pub use proxy::{PortProxy, ProxySettings};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the proxy
pub type Result<T> = anyhow::Result<T>;
