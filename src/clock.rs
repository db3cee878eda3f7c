//! Clock alignment for synchronized playback.
//!
//! The host samples its clock once per round and broadcasts an absolute start
//! instant a fixed lead into the future, plus a random stop offset. Every
//! participant (host included) derives its local delays from that pair alone,
//! so accuracy is bounded by clock skew plus one-way latency variance. If the
//! `begin` message arrives after the start instant, the delay clamps to zero
//! and playback starts on arrival.

use crate::stimulus::Playback;
use crate::types::Timestamp;
use rand::{Rng, RngCore};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Source of wall-clock time in Unix milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Saturates at `i64::MAX` instead of wrapping
    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by))
            });
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScheduleError {
    #[error("stimulus of {duration:?} is too short for a round (tail margin {tail_margin_secs}s)")]
    StimulusTooShort {
        duration: Duration,
        tail_margin_secs: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Buffer between the host sampling its clock and the shared start
    pub lead: Duration,
    pub min_stop_secs: f64,
    pub max_stop_secs: f64,
    /// Distance the stop point keeps from the end of the stimulus
    pub tail_margin_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lead: Duration::from_millis(1500),
            min_stop_secs: 3.0,
            max_stop_secs: 30.0,
            tail_margin_secs: 2.0,
        }
    }
}

/// What the host puts into a `begin` message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeginPlan {
    pub start_instant: Timestamp,
    pub stop_offset_seconds: f64,
}

/// Choose the shared start instant and stop offset for a round.
///
/// The stop offset is drawn uniformly from
/// `[min_stop, min(duration - tail_margin, max_stop))`. When the stimulus is
/// too short for that range to be non-empty, the upper bound is used as is so
/// the stop point still never runs past the content.
pub fn plan_round(
    now: Timestamp,
    duration: Duration,
    config: &SchedulerConfig,
    rng: &mut dyn RngCore,
) -> ScheduleResult<BeginPlan> {
    let upper = (duration.as_secs_f64() - config.tail_margin_secs).min(config.max_stop_secs);
    if upper <= 0.0 {
        return Err(ScheduleError::StimulusTooShort {
            duration,
            tail_margin_secs: config.tail_margin_secs,
        });
    }

    let stop_offset_seconds = if upper <= config.min_stop_secs {
        upper
    } else {
        rng.random_range(config.min_stop_secs..upper)
    };

    Ok(BeginPlan {
        start_instant: now + config.lead.as_millis() as i64,
        stop_offset_seconds,
    })
}

/// Local delays derived from a `begin` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSchedule {
    pub start_delay: Duration,
    pub stop_delay: Duration,
}

impl PlaybackSchedule {
    /// Whether the start instant had already passed when this was computed
    pub fn is_late(&self) -> bool {
        self.start_delay.is_zero()
    }
}

pub fn local_schedule(
    start_instant: Timestamp,
    stop_offset_seconds: f64,
    now: Timestamp,
) -> PlaybackSchedule {
    let start_delay = Duration::from_millis(start_instant.saturating_sub(now).max(0) as u64);
    // A hostile or broken peer could send NaN or a negative offset
    let stop_offset = if stop_offset_seconds.is_finite() && stop_offset_seconds > 0.0 {
        Duration::from_secs_f64(stop_offset_seconds)
    } else {
        Duration::ZERO
    };

    PlaybackSchedule {
        start_delay,
        stop_delay: start_delay + stop_offset,
    }
}

/// Spawned start/stop timers for local playback.
///
/// Timers are not individually cancellable; they are aborted when the owner
/// (the session) is dropped.
#[derive(Debug, Default)]
pub struct PlaybackTimers {
    handles: Vec<JoinHandle<()>>,
}

impl PlaybackTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `playback` after `start_delay`, stop and rewind it after
    /// `stop_delay`, then call `on_stopped`.
    pub fn schedule<F>(
        &mut self,
        schedule: PlaybackSchedule,
        playback: Arc<dyn Playback>,
        on_stopped: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.handles.retain(|h| !h.is_finished());

        let base = tokio::time::Instant::now();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(base + schedule.start_delay).await;
            playback.reset();
            playback.start();
            tracing::debug!("Playback started");

            tokio::time::sleep_until(base + schedule.stop_delay).await;
            playback.pause();
            playback.reset();
            tracing::debug!("Playback stopped");

            on_stopped();
        });
        self.handles.push(handle);
    }

    pub fn pending(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for PlaybackTimers {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
