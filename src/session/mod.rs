//! Host and guest automata.
//!
//! Each session is a single-owner actor: one task owns all of its state and
//! handles events one at a time from an unbounded channel. Transport
//! callbacks, decode completions, playback timers and user actions all arrive
//! on that channel, so nothing is ever mutated concurrently.

pub mod guest;
pub mod host;

pub use guest::{GuestCommand, GuestEvent, GuestHandle, GuestSession};
pub use host::{HostCommand, HostEvent, HostHandle, HostSession};

use crate::clock::{Clock, ScheduleError, SchedulerConfig, SystemClock};
use crate::persist::{SessionSnapshot, SessionStore};
use crate::presenter::{Presenter, TracingPresenter};
use crate::state::StateError;
use crate::stimulus::{StimulusDecoder, WavDecoder};
use crate::types::RoundPhase;
use std::sync::Arc;

pub type SessionResult<T> = Result<T, SessionError>;

/// Local precondition violations, reported back to the user synchronously
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("select a stimulus before starting a round")]
    NoStimulus,

    #[error("cannot {action} while in {phase:?}")]
    WrongPhase {
        action: &'static str,
        phase: RoundPhase,
    },

    #[error("the round has not started yet")]
    NotStarted,

    #[error("wait for the music to stop")]
    StimulusPlaying,

    #[error("already clicked this round")]
    AlreadyClicked,

    #[error("not connected to the host")]
    Disconnected,

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("session is no longer running")]
    SessionGone,
}

/// Collaborators and settings shared by both roles
#[derive(Clone)]
pub struct SessionContext {
    pub clock: Arc<dyn Clock>,
    pub decoder: Arc<dyn StimulusDecoder>,
    pub presenter: Arc<dyn Presenter>,
    pub store: Option<Arc<dyn SessionStore>>,
    pub scheduler: SchedulerConfig,
}

impl SessionContext {
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn save(&self, snapshot: SessionSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&snapshot) {
                tracing::warn!("Failed to save session snapshot: {}", e);
            }
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            decoder: Arc::new(WavDecoder),
            presenter: Arc::new(TracingPresenter),
            store: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}
