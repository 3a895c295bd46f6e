//! Control Channel Module
//!
//! Fire-and-forget delivery of port mapping updates over a local socket.

pub mod listener;
pub mod reader;

pub use listener::{ControlConnection, ControlListener};
pub use reader::ControlReader;
