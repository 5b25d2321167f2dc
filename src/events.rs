//! Notable monitor milestones.
//!
//! Events are forwarded to the capture sink alongside the raw lines, so that
//! a capture shows why the monitor did what it did.

use std::{fmt, path::PathBuf};

use crate::state::PlaybackState;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The monitor was started on a pipe.
    MonitorStart { pipe: PathBuf },

    /// The monitor was asked to stop.
    MonitorStop,

    /// A state change was attempted. The transition may still have been
    /// rejected as illegal.
    StateChange {
        from: PlaybackState,
        to: PlaybackState,
        reason: String,
    },
}

impl Event {
    /// Short machine-readable name, as written to captures.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MonitorStart { .. } => "monitor_start",
            Self::MonitorStop => "monitor_stop",
            Self::StateChange { .. } => "state_change",
        }
    }

    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::MonitorStart { pipe } => format!("monitoring {}", pipe.display()),
            Self::MonitorStop => "monitor stopped".to_owned(),
            Self::StateChange { from, to, reason } => format!("{from} -> {to}: {reason}"),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.event_type(), self.description())
    }
}
