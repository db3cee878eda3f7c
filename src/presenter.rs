//! Presentation seam.
//!
//! Sessions push roster snapshots, phase changes and results here. User
//! actions flow the other way as plain method calls on the session handles.

use crate::types::*;
use std::sync::Mutex;

/// Things worth telling the person in front of the screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Local playback stopped; clicks are accepted from now on
    ClickNow,
    /// Local click recorded
    Clicked,
    /// Join was parked until the current round ends
    JoinDeferred(String),
    StimulusFailed(String),
    /// The connection to the host is gone (guest only)
    Disconnected,
}

pub trait Presenter: Send + Sync {
    fn roster_changed(&self, roster: &[Participant]);

    fn host_phase(&self, _phase: RoundPhase) {}

    fn guest_phase(&self, _phase: GuestPhase) {}

    /// `ready` of `total` roster members have loaded the stimulus
    fn loading_progress(&self, _ready: usize, _total: usize) {}

    fn outcome(&self, outcome: &Outcome, you_lost: bool);

    fn notice(&self, notice: Notice);
}

/// Presenter for headless runs: everything goes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPresenter;

impl Presenter for TracingPresenter {
    fn roster_changed(&self, roster: &[Participant]) {
        let names: Vec<_> = roster.iter().map(|p| p.display_name.as_str()).collect();
        tracing::info!("Players ({}): {}", roster.len(), names.join(", "));
    }

    fn host_phase(&self, phase: RoundPhase) {
        tracing::info!("Round phase: {:?}", phase);
    }

    fn guest_phase(&self, phase: GuestPhase) {
        tracing::info!("Phase: {:?}", phase);
    }

    fn loading_progress(&self, ready: usize, total: usize) {
        tracing::info!("Loading... {}/{}", ready, total);
    }

    fn outcome(&self, outcome: &Outcome, you_lost: bool) {
        tracing::info!("Loser: {}", outcome.loser.display_name);
        for (i, entry) in outcome.ranking.iter().enumerate() {
            match entry.timestamp {
                Some(ts) => tracing::info!("  {}. {} ({})", i + 1, entry.display_name, ts),
                None => tracing::info!("  {}. {} (no click)", i + 1, entry.display_name),
            }
        }
        if you_lost {
            tracing::info!("You lost!");
        } else {
            tracing::info!("You survived!");
        }
    }

    fn notice(&self, notice: Notice) {
        match notice {
            Notice::ClickNow => tracing::info!("CLICK NOW! (press enter)"),
            Notice::Clicked => tracing::info!("Clicked! Waiting for others..."),
            Notice::JoinDeferred(name) => {
                tracing::info!("{} will join when the current round ends", name)
            }
            Notice::StimulusFailed(reason) => tracing::error!("Could not load audio: {}", reason),
            Notice::Disconnected => tracing::warn!("Disconnected from host"),
        }
    }
}

/// What a `RecordingPresenter` saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presented {
    Roster(Vec<String>),
    HostPhase(RoundPhase),
    GuestPhase(GuestPhase),
    Progress(usize, usize),
    Outcome { loser: String, you_lost: bool },
    Notice(Notice),
}

/// Presenter that keeps everything it is shown, for tests and replays
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    seen: Mutex<Vec<Presented>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<Presented> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_outcome(&self) -> Option<Presented> {
        self.seen()
            .into_iter()
            .rev()
            .find(|p| matches!(p, Presented::Outcome { .. }))
    }

    fn push(&self, item: Presented) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(item);
        }
    }
}

impl Presenter for RecordingPresenter {
    fn roster_changed(&self, roster: &[Participant]) {
        self.push(Presented::Roster(
            roster.iter().map(|p| p.display_name.clone()).collect(),
        ));
    }

    fn host_phase(&self, phase: RoundPhase) {
        self.push(Presented::HostPhase(phase));
    }

    fn guest_phase(&self, phase: GuestPhase) {
        self.push(Presented::GuestPhase(phase));
    }

    fn loading_progress(&self, ready: usize, total: usize) {
        self.push(Presented::Progress(ready, total));
    }

    fn outcome(&self, outcome: &Outcome, you_lost: bool) {
        self.push(Presented::Outcome {
            loser: outcome.loser.display_name.clone(),
            you_lost,
        });
    }

    fn notice(&self, notice: Notice) {
        self.push(Presented::Notice(notice));
    }
}
