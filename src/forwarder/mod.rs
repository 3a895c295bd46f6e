//! Port Forwarding Module
//!
//! One forwarder per port spec: a listening socket plus the accept loop that
//! spawns relay sessions for it.

pub mod port;
pub mod state;

pub use port::{ForwarderInfo, ForwarderSettings, ForwarderStats, PortForwarder};
pub use state::ForwarderState;
