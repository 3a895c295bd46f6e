//! Control Protocol Module
//!
//! Port mapping messages exchanged over the control channel: one JSON
//! document per connection, no framing, no reply.

pub mod types;

pub use types::{Binding, MappingRequest, PortSpec, Protocol};
