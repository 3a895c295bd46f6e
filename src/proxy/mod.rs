//! Proxy Module
//!
//! The forwarder table and the top-level start/close lifecycle.

pub mod manager;
pub mod server;

pub use manager::{ApplyOutcome, Manager};
pub use server::{PortProxy, ProxySettings};
