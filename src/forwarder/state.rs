//! Forwarder State Machine

use std::fmt;

use anyhow::bail;
use serde::Serialize;

use crate::Result;

/// Lifecycle of one forwarder.
///
/// `Starting -> Listening -> Stopping -> Stopped`. A forwarder whose bind
/// fails never leaves `Starting` and is discarded without being registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwarderState {
    Starting,
    Listening,
    Stopping,
    Stopped,
}

impl ForwarderState {
    /// Move to `next`, refusing any transition that skips a state
    pub fn transition(&mut self, next: ForwarderState) -> Result<()> {
        use ForwarderState::*;

        match (*self, next) {
            (Starting, Listening) | (Listening, Stopping) | (Stopping, Stopped) => {
                *self = next;
                Ok(())
            }
            (from, to) => bail!("invalid forwarder state transition {} -> {}", from, to),
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self, ForwarderState::Listening)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ForwarderState::Stopped)
    }
}

impl fmt::Display for ForwarderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForwarderState::Starting => "starting",
            ForwarderState::Listening => "listening",
            ForwarderState::Stopping => "stopping",
            ForwarderState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut state = ForwarderState::Starting;
        state.transition(ForwarderState::Listening).unwrap();
        assert!(state.is_listening());
        state.transition(ForwarderState::Stopping).unwrap();
        state.transition(ForwarderState::Stopped).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_no_skipped_states() {
        let mut state = ForwarderState::Starting;
        assert!(state.transition(ForwarderState::Stopping).is_err());
        assert!(state.transition(ForwarderState::Stopped).is_err());
        assert_eq!(state, ForwarderState::Starting);

        let mut state = ForwarderState::Listening;
        assert!(state.transition(ForwarderState::Stopped).is_err());

        let mut state = ForwarderState::Stopped;
        assert!(state.transition(ForwarderState::Listening).is_err());
        assert!(state.transition(ForwarderState::Stopping).is_err());
    }
}
