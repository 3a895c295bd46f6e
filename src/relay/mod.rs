//! Data Relay Module
//!
//! Handles bidirectional byte relay between an accepted connection and its upstream.

pub mod session;

pub use session::{RelaySession, SessionStats};
