//! Playback state and its transition rules.
//!
//! The state machine encodes what can physically happen on the metadata pipe:
//! the pipe opens before it produces data, and a paused or stopped session
//! only settles into [`PlaybackState::Waiting`] after a quiet period.
//!
//! | From           | Legal to                                   |
//! |----------------|--------------------------------------------|
//! | `NoSession`    | `Undetermined`                             |
//! | `Undetermined` | `Playing`, `NoSession`                     |
//! | `Playing`      | `Paused`, `Stopped`, `NoSession`           |
//! | `Paused`       | `Playing`, `Stopped`, `Waiting`, `NoSession` |
//! | `Stopped`      | `Playing`, `Waiting`, `NoSession`          |
//! | `Waiting`      | `Playing`, `NoSession`                     |
//!
//! Every state may "transition" to itself, which is a no-op.
//!
//! # Example
//!
//! ```rust
//! use nowplaying::state::{PlaybackState, StateMachine};
//!
//! let mut machine = StateMachine::default();
//! assert!(machine.transition_to(PlaybackState::Undetermined, "pipe opened"));
//! assert!(!machine.transition_to(PlaybackState::Waiting, "too early"));
//! assert_eq!(machine.current(), PlaybackState::Undetermined);
//! ```

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// All states the metadata pipe can be in.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No session or connection.
    #[default]
    NoSession,
    /// The pipe is open but has not produced data yet.
    Undetermined,
    /// Audio is playing.
    Playing,
    /// Playback is paused.
    Paused,
    /// The play session ended.
    Stopped,
    /// Paused or stopped for a while, waiting for activity.
    Waiting,
}

impl PlaybackState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::NoSession,
        Self::Undetermined,
        Self::Playing,
        Self::Paused,
        Self::Stopped,
        Self::Waiting,
    ];

    /// States that can legally be reached from `self`, excluding `self`.
    #[must_use]
    pub const fn successors(self) -> &'static [Self] {
        use PlaybackState::*;
        match self {
            NoSession => &[Undetermined],
            Undetermined => &[Playing, NoSession],
            Playing => &[Paused, Stopped, NoSession],
            Paused => &[Playing, Stopped, Waiting, NoSession],
            Stopped => &[Playing, Waiting, NoSession],
            Waiting => &[Playing, NoSession],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::Undetermined => "undetermined",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Waiting => "waiting",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PlaybackState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::invalid_argument(format!("unknown playback state: {s}")))
    }
}

/// Validated playback state container.
///
/// The machine is plain data: it does not notify anyone and does not lock.
/// Callers check the returned `bool` to learn whether a transition happened.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StateMachine {
    current: PlaybackState,
    previous: Option<PlaybackState>,
}

impl StateMachine {
    #[must_use]
    pub fn new(initial: PlaybackState) -> Self {
        Self {
            current: initial,
            previous: None,
        }
    }

    #[must_use]
    pub fn current(&self) -> PlaybackState {
        self.current
    }

    /// The state before the last transition. For diagnostics only.
    #[must_use]
    pub fn previous(&self) -> Option<PlaybackState> {
        self.previous
    }

    #[must_use]
    pub fn valid_transitions(&self) -> &'static [PlaybackState] {
        self.current.successors()
    }

    #[must_use]
    pub fn can_transition_to(&self, target: PlaybackState) -> bool {
        target == self.current || self.current.successors().contains(&target)
    }

    /// Transitions to `target` if the transition table allows it.
    ///
    /// Returns `true` when `target` is the current state (without changing
    /// anything) or when the transition was made. Returns `false` and leaves
    /// the state untouched when the transition is illegal.
    pub fn transition_to(&mut self, target: PlaybackState, reason: &str) -> bool {
        if target == self.current {
            debug!("state unchanged: {target}");
            return true;
        }

        if !self.can_transition_to(target) {
            warn!(
                "invalid state transition: {} -> {target}{}",
                self.current,
                format_reason(reason)
            );
            return false;
        }

        self.previous = Some(self.current);
        self.current = target;
        info!(
            "state transition: {} -> {target}{}",
            self.previous.unwrap_or_default(),
            format_reason(reason)
        );

        true
    }

    /// Transitions to `target` regardless of the transition table.
    ///
    /// Returns `false` if `target` already is the current state.
    pub fn force_transition(&mut self, target: PlaybackState, reason: &str) -> bool {
        if target == self.current {
            debug!("state unchanged: {target}");
            return false;
        }

        warn!(
            "forced state transition: {} -> {target}{}",
            self.current,
            format_reason(reason)
        );
        self.previous = Some(self.current);
        self.current = target;

        true
    }

    /// Unconditionally reinitializes the machine, normally to
    /// [`PlaybackState::NoSession`].
    pub fn reset(&mut self, state: PlaybackState) {
        self.previous = Some(self.current);
        self.current = state;
        info!("state machine reset to: {state}");
    }
}

fn format_reason(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(" ({reason})")
    }
}
