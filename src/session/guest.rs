//! Guest automaton
//!
//! A guest holds one connection to the host and a shadow phase rebuilt from
//! the message kinds it receives. It never decides anything on its own: it
//! loads what it is sent, plays when told, and reports its click.

use super::{SessionContext, SessionError, SessionResult};
use crate::clock::{local_schedule, PlaybackTimers};
use crate::persist::SessionSnapshot;
use crate::presenter::Notice;
use crate::protocol::{self, Direction, StimulusPayload, WireMessage};
use crate::state::RosterMirror;
use crate::stimulus::{Playback, StimulusResult};
use crate::transport::Connection;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCommand {
    Click,
}

pub enum GuestEvent {
    /// The connection to the host is open
    Connected,
    Message(String),
    Closed,
    Errored(String),
    StimulusDecoded {
        generation: u64,
        result: StimulusResult<Arc<dyn Playback>>,
    },
    PlaybackStopped {
        round_no: u32,
    },
    Command {
        command: GuestCommand,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct GuestHandle {
    events: mpsc::UnboundedSender<GuestEvent>,
}

impl GuestHandle {
    pub fn events(&self) -> mpsc::UnboundedSender<GuestEvent> {
        self.events.clone()
    }

    pub async fn click(&self) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(GuestEvent::Command {
                command: GuestCommand::Click,
                reply,
            })
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(GuestEvent::Shutdown);
    }
}

pub struct GuestSession {
    me: ParticipantId,
    display_name: String,
    room_id: RoomId,
    phase: GuestPhase,
    mirror: RosterMirror,
    /// Dropped on disconnect, which closes the outbox behind it
    host: Option<Arc<dyn Connection>>,
    joined: bool,
    playback: Option<Arc<dyn Playback>>,
    load_generation: u64,
    /// Local count of `begin` messages, tags playback timers
    round_no: u32,
    click_armed: bool,
    clicked: bool,
    last_outcome: Option<Outcome>,
    ctx: SessionContext,
    events: mpsc::UnboundedSender<GuestEvent>,
    timers: PlaybackTimers,
}

impl GuestSession {
    /// `host` is this guest's connection to the host; its id is the guest's
    /// identity on the roster.
    pub fn new(
        ctx: SessionContext,
        display_name: impl Into<String>,
        room_id: impl Into<RoomId>,
        host: Arc<dyn Connection>,
    ) -> (Self, mpsc::UnboundedReceiver<GuestEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            me: ParticipantId::peer(host.id().clone()),
            display_name: display_name.into(),
            room_id: room_id.into(),
            phase: GuestPhase::Connecting,
            mirror: RosterMirror::default(),
            host: Some(host),
            joined: false,
            playback: None,
            load_generation: 0,
            round_no: 0,
            click_armed: false,
            clicked: false,
            last_outcome: None,
            ctx,
            events,
            timers: PlaybackTimers::new(),
        };
        (session, rx)
    }

    pub fn handle(&self) -> GuestHandle {
        GuestHandle {
            events: self.events.clone(),
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.me
    }

    pub fn phase(&self) -> GuestPhase {
        self.phase
    }

    pub fn roster(&self) -> &RosterMirror {
        &self.mirror
    }

    pub fn click_armed(&self) -> bool {
        self.click_armed
    }

    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.last_outcome.as_ref()
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<GuestEvent>) {
        while let Some(event) = events.recv().await {
            if matches!(event, GuestEvent::Shutdown) {
                break;
            }
            self.handle_event(event);
        }
        tracing::info!("Guest session {} ended", self.me);
    }

    pub fn handle_event(&mut self, event: GuestEvent) {
        match event {
            GuestEvent::Connected => self.on_connected(),
            GuestEvent::Message(text) => self.on_message(&text),
            GuestEvent::Closed => {
                tracing::info!("Host closed the connection");
                self.on_disconnected();
            }
            GuestEvent::Errored(error) => {
                tracing::error!("Connection to host failed: {}", error);
                self.on_disconnected();
            }
            GuestEvent::StimulusDecoded { generation, result } => {
                self.on_decoded(generation, result)
            }
            GuestEvent::PlaybackStopped { round_no } => self.on_playback_stopped(round_no),
            GuestEvent::Command { command, reply } => {
                let result = match command {
                    GuestCommand::Click => self.click(),
                };
                let _ = reply.send(result);
            }
            GuestEvent::Shutdown => {}
        }
    }

    /// Report this guest's reaction to the host
    pub fn click(&mut self) -> SessionResult<()> {
        match self.phase {
            GuestPhase::Disconnected => return Err(SessionError::Disconnected),
            GuestPhase::Active => {}
            GuestPhase::Resolved if self.clicked => return Err(SessionError::AlreadyClicked),
            _ => return Err(SessionError::NotStarted),
        }
        if self.clicked {
            return Err(SessionError::AlreadyClicked);
        }
        if !self.click_armed {
            return Err(SessionError::StimulusPlaying);
        }

        let local_timestamp = self.ctx.clock.now_millis();
        self.send(WireMessage::Clicked {
            id: self.me.clone(),
            local_timestamp,
        })?;
        self.clicked = true;
        tracing::info!("Clicked at {}", local_timestamp);
        self.ctx.presenter.notice(Notice::Clicked);
        Ok(())
    }

    fn on_connected(&mut self) {
        if self.joined {
            return;
        }
        tracing::info!("Connected to room {}, joining as {}", self.room_id, self.display_name);
        let join = WireMessage::Join {
            display_name: self.display_name.clone(),
        };
        if self.send(join).is_err() {
            return;
        }
        self.joined = true;
        self.set_phase(GuestPhase::Lobby);
        self.save_snapshot();
    }

    fn on_message(&mut self, text: &str) {
        if self.phase == GuestPhase::Disconnected {
            return;
        }
        let msg = match protocol::decode(text).and_then(|m| m.expect_direction(Direction::ToGuest))
        {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping message from host: {}", e);
                return;
            }
        };
        tracing::debug!("Received {} from host", msg.kind());

        match msg {
            WireMessage::Roster { participants } => {
                self.mirror.replace(participants);
                self.ctx.presenter.roster_changed(self.mirror.participants());
                self.save_snapshot();
            }
            WireMessage::Preload { stimulus } => self.on_preload(stimulus),
            WireMessage::Begin {
                stop_offset_seconds,
                start_instant,
            } => self.on_begin(start_instant, stop_offset_seconds),
            WireMessage::Outcome { loser, ranking } => {
                self.on_outcome(Outcome { loser, ranking })
            }
            WireMessage::Rematch => self.on_rematch(),
            other => tracing::warn!("Unexpected {} from host", other.kind()),
        }
    }

    fn on_preload(&mut self, stimulus: StimulusPayload) {
        if self.phase != GuestPhase::Lobby {
            tracing::warn!("Ignoring preload in {:?}", self.phase);
            return;
        }
        self.load_generation += 1;
        self.playback = None;
        self.set_phase(GuestPhase::Loading);

        let decoder = self.ctx.decoder.clone();
        let events = self.events.clone();
        let generation = self.load_generation;
        tokio::spawn(async move {
            let result = decoder.decode(&stimulus).await;
            let _ = events.send(GuestEvent::StimulusDecoded { generation, result });
        });
    }

    fn on_decoded(&mut self, generation: u64, result: StimulusResult<Arc<dyn Playback>>) {
        if generation != self.load_generation || self.phase != GuestPhase::Loading {
            tracing::debug!("Discarding stale stimulus decode (generation {})", generation);
            return;
        }
        match result {
            Ok(playback) => {
                tracing::info!("Stimulus ready ({:?})", playback.duration());
                self.playback = Some(playback);
                let _ = self.send(WireMessage::Ready {
                    id: self.me.clone(),
                });
            }
            Err(e) => {
                // Without a playback this guest can never report ready, so it
                // leaves and the host carries on with the others
                tracing::error!("Could not decode the stimulus, leaving the room: {}", e);
                self.ctx
                    .presenter
                    .notice(Notice::StimulusFailed(e.to_string()));
                self.on_disconnected();
            }
        }
    }

    fn on_begin(&mut self, start_instant: Timestamp, stop_offset_seconds: f64) {
        if self.phase != GuestPhase::Loading {
            tracing::warn!("Ignoring begin in {:?}", self.phase);
            return;
        }
        let Some(playback) = self.playback.clone() else {
            tracing::warn!("Ignoring begin: stimulus not loaded");
            return;
        };

        let schedule = local_schedule(
            start_instant,
            stop_offset_seconds,
            self.ctx.clock.now_millis(),
        );
        if schedule.is_late() {
            tracing::warn!("Begin arrived after the start instant; playing immediately");
        }

        self.round_no += 1;
        self.clicked = false;
        self.click_armed = false;
        self.set_phase(GuestPhase::Active);

        let events = self.events.clone();
        let round_no = self.round_no;
        self.timers.schedule(schedule, playback, move || {
            let _ = events.send(GuestEvent::PlaybackStopped { round_no });
        });
    }

    fn on_playback_stopped(&mut self, round_no: u32) {
        if round_no != self.round_no || self.phase != GuestPhase::Active {
            return;
        }
        self.click_armed = true;
        self.ctx.presenter.notice(Notice::ClickNow);
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        self.click_armed = false;
        self.set_phase(GuestPhase::Resolved);
        self.ctx
            .presenter
            .outcome(&outcome, outcome.is_loser(&self.me));
        self.last_outcome = Some(outcome);
    }

    fn on_rematch(&mut self) {
        self.load_generation += 1;
        self.playback = None;
        self.click_armed = false;
        self.clicked = false;
        self.set_phase(GuestPhase::Lobby);
    }

    fn on_disconnected(&mut self) {
        if self.phase == GuestPhase::Disconnected {
            return;
        }
        self.host = None;
        self.playback = None;
        self.click_armed = false;
        self.timers = PlaybackTimers::new();
        self.set_phase(GuestPhase::Disconnected);
        self.ctx.presenter.notice(Notice::Disconnected);
    }

    fn send(&mut self, msg: WireMessage) -> SessionResult<()> {
        let Some(host) = self.host.as_ref() else {
            return Err(SessionError::Disconnected);
        };
        if let Err(e) = host.send(&msg) {
            tracing::error!("Failed to send {} to host: {}", msg.kind(), e);
            self.on_disconnected();
            return Err(SessionError::Disconnected);
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: GuestPhase) {
        if self.phase != phase {
            tracing::info!("Guest phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
            self.ctx.presenter.guest_phase(phase);
        }
    }

    fn save_snapshot(&self) {
        self.ctx.save(SessionSnapshot::new(
            Role::Guest,
            self.room_id.clone(),
            self.display_name.clone(),
            self.mirror.participants().to_vec(),
        ));
    }
}
