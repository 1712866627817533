//! Component lifecycle.
//!
//! ```text
//! NEW -> INITIALIZED -> RUNNING <-> PAUSED -> STOPPED -> DESTROYED
//! ```
//!
//! `stop` is accepted from both RUNNING and PAUSED. Any other transition is
//! refused with a [`LifecycleError`].

use crate::error::LifecycleError;
use parking_lot::Mutex;
use std::fmt;

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    New,
    Initialized,
    Running,
    Paused,
    Stopped,
    Destroyed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::New => "NEW",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Paused => "PAUSED",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Destroyed => "DESTROYED",
        }
    }

    /// Whether the component accepts work in this state.
    pub fn is_available(&self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Paused)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operations that move a component between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Init,
    Start,
    Pause,
    Resume,
    Stop,
    Destroy,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Init => "init",
            Transition::Start => "start",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Stop => "stop",
            Transition::Destroy => "destroy",
        }
    }

    /// Target state when applied to `from`, or `None` if not allowed.
    pub fn apply(&self, from: LifecycleState) -> Option<LifecycleState> {
        use LifecycleState::*;
        match (self, from) {
            (Transition::Init, New) => Some(Initialized),
            (Transition::Start, Initialized) => Some(Running),
            (Transition::Pause, Running) => Some(Paused),
            (Transition::Resume, Paused) => Some(Running),
            (Transition::Stop, Running | Paused) => Some(Stopped),
            (Transition::Destroy, Stopped) => Some(Destroyed),
            _ => None,
        }
    }
}

/// Thread-safe lifecycle state holder.
#[derive(Debug)]
pub struct Lifecycle {
    component: String,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: Mutex::new(LifecycleState::New),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Applies `transition`, returning the previous state.
    pub fn transition(&self, transition: Transition) -> Result<LifecycleState, LifecycleError> {
        let mut state = self.state.lock();
        let from = *state;
        let to = transition.apply(from).ok_or_else(|| self.refuse(transition.name(), from))?;
        *state = to;
        tracing::info!("{}: {} -> {}", self.component, from, to);
        Ok(from)
    }

    /// Fails unless the current state is one of `allowed`.
    pub fn require(
        &self,
        operation: &'static str,
        allowed: &[LifecycleState],
    ) -> Result<LifecycleState, LifecycleError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(self.refuse(operation, state))
        }
    }

    fn refuse(&self, operation: &'static str, state: LifecycleState) -> LifecycleError {
        LifecycleError {
            component: self.component.clone(),
            operation,
            state,
        }
    }
}
