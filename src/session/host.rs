//! Host automaton
//!
//! The host owns the roster, readiness set, click ledger and the one
//! authoritative round phase. It is also a player: it decodes its own copy of
//! the stimulus, schedules playback against the same `begin` it broadcasts,
//! and clicks into the ledger under the host identity.
//!
//! Completeness checks are level-triggered. After any event that could change
//! the answer (a ready, a click, a roster change, the host's own decode) the
//! session asks "is everyone on the current roster done?" rather than reacting
//! to a particular arrival, so interleaved guests still converge.

use super::{SessionContext, SessionError, SessionResult};
use crate::broadcast::Fanout;
use crate::clock::{local_schedule, plan_round, PlaybackTimers};
use crate::persist::SessionSnapshot;
use crate::presenter::Notice;
use crate::protocol::{self, Direction, StimulusPayload, WireMessage};
use crate::state::{HostState, Roster};
use crate::stimulus::{Playback, StimulusResult};
use crate::transport::Connection;
use crate::types::*;
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Longest display name kept from a `join`
const MAX_NAME_CHARS: usize = 40;

/// Operator actions
#[derive(Debug, Clone)]
pub enum HostCommand {
    SelectStimulus(StimulusPayload),
    BeginRound,
    /// Give up on a round that is still loading
    AbortRound,
    Click,
    PlayAgain,
}

pub enum HostEvent {
    /// A guest opened a connection
    Connected(Arc<dyn Connection>),
    Message {
        from: ConnectionId,
        text: String,
    },
    Closed {
        from: ConnectionId,
    },
    Errored {
        from: ConnectionId,
        error: String,
    },
    /// The host's own copy of the stimulus finished decoding
    StimulusDecoded {
        generation: u64,
        result: StimulusResult<Arc<dyn Playback>>,
    },
    /// Local playback for `round_no` stopped; the click window opens
    PlaybackStopped {
        round_no: u32,
    },
    Command {
        command: HostCommand,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Shutdown,
}

/// Cloneable handle for talking to a running host session
#[derive(Clone)]
pub struct HostHandle {
    events: mpsc::UnboundedSender<HostEvent>,
}

impl HostHandle {
    /// Sender for transport adapters to post connection events
    pub fn events(&self) -> mpsc::UnboundedSender<HostEvent> {
        self.events.clone()
    }

    async fn command(&self, command: HostCommand) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(HostEvent::Command { command, reply })
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    pub async fn select_stimulus(&self, payload: StimulusPayload) -> SessionResult<()> {
        self.command(HostCommand::SelectStimulus(payload)).await
    }

    pub async fn begin_round(&self) -> SessionResult<()> {
        self.command(HostCommand::BeginRound).await
    }

    pub async fn abort_round(&self) -> SessionResult<()> {
        self.command(HostCommand::AbortRound).await
    }

    pub async fn click(&self) -> SessionResult<()> {
        self.command(HostCommand::Click).await
    }

    pub async fn play_again(&self) -> SessionResult<()> {
        self.command(HostCommand::PlayAgain).await
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(HostEvent::Shutdown);
    }
}

pub struct HostSession {
    room_id: RoomId,
    host_name: String,
    state: HostState,
    fanout: Fanout,
    stimulus: Option<StimulusPayload>,
    /// Host's decoded stimulus for the current round
    playback: Option<Arc<dyn Playback>>,
    /// Bumped per loading phase so late decodes from an aborted one are dropped
    load_generation: u64,
    click_armed: bool,
    last_outcome: Option<Outcome>,
    /// Connections whose sends failed, processed as disconnects
    evictions: Vec<ConnectionId>,
    ctx: SessionContext,
    rng: Box<dyn RngCore + Send>,
    events: mpsc::UnboundedSender<HostEvent>,
    timers: PlaybackTimers,
}

impl HostSession {
    /// Open a lobby. `room_id` resumes a previous room; otherwise a fresh one
    /// is generated.
    pub fn new(
        ctx: SessionContext,
        host_name: impl Into<String>,
        room_id: Option<RoomId>,
        rng: Box<dyn RngCore + Send>,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let host_name = host_name.into();
        let room_id = room_id.unwrap_or_else(|| ulid::Ulid::new().to_string());
        let (events, rx) = mpsc::unbounded_channel();

        let mut state = HostState::new(host_name.clone());
        if let Err(e) = state.open_lobby() {
            tracing::error!("Failed to open lobby: {}", e);
        }

        let session = Self {
            room_id,
            host_name,
            state,
            fanout: Fanout::new(),
            stimulus: None,
            playback: None,
            load_generation: 0,
            click_armed: false,
            last_outcome: None,
            evictions: Vec::new(),
            ctx,
            rng,
            events,
            timers: PlaybackTimers::new(),
        };

        tracing::info!(
            "Hosting room {} as {}",
            session.room_id,
            session.host_name
        );
        session.ctx.presenter.host_phase(session.state.phase);
        session
            .ctx
            .presenter
            .roster_changed(session.state.roster.participants());
        session.save_snapshot();

        (session, rx)
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle {
            events: self.events.clone(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Link guests open to find this room
    pub fn join_link(&self, base_url: &str) -> String {
        format!("{}?room={}", base_url.trim_end_matches('?'), self.room_id)
    }

    pub fn phase(&self) -> RoundPhase {
        self.state.phase
    }

    pub fn round_no(&self) -> u32 {
        self.state.round_no
    }

    pub fn roster(&self) -> &Roster {
        &self.state.roster
    }

    pub fn connection_count(&self) -> usize {
        self.fanout.len()
    }

    pub fn click_armed(&self) -> bool {
        self.click_armed
    }

    pub fn last_outcome(&self) -> Option<&Outcome> {
        self.last_outcome.as_ref()
    }

    /// Actor loop: handle events until `Shutdown`
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            if matches!(event, HostEvent::Shutdown) {
                break;
            }
            self.handle_event(event);
        }
        tracing::info!("Host session for room {} ended", self.room_id);
    }

    pub fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Connected(conn) => self.on_connected(conn),
            HostEvent::Message { from, text } => self.on_message(&from, &text),
            HostEvent::Closed { from } => {
                tracing::info!("Connection {} closed", from);
                self.on_disconnect(&from);
            }
            HostEvent::Errored { from, error } => {
                tracing::error!("Connection {} failed: {}", from, error);
                self.on_disconnect(&from);
            }
            HostEvent::StimulusDecoded { generation, result } => {
                self.on_self_decoded(generation, result)
            }
            HostEvent::PlaybackStopped { round_no } => self.on_playback_stopped(round_no),
            HostEvent::Command { command, reply } => {
                let result = self.execute(command);
                let _ = reply.send(result);
            }
            HostEvent::Shutdown => {}
        }
        self.flush_evictions();
    }

    fn execute(&mut self, command: HostCommand) -> SessionResult<()> {
        match command {
            HostCommand::SelectStimulus(payload) => self.select_stimulus(payload),
            HostCommand::BeginRound => self.begin_round(),
            HostCommand::AbortRound => self.abort_round(),
            HostCommand::Click => self.click(),
            HostCommand::PlayAgain => self.play_again(),
        }
    }

    // ========== Operator actions ==========

    pub fn select_stimulus(&mut self, payload: StimulusPayload) -> SessionResult<()> {
        match self.state.phase {
            RoundPhase::Lobby | RoundPhase::Resolved => {
                tracing::info!(
                    "Stimulus selected ({}, {} base64 chars)",
                    payload.mime,
                    payload.data.len()
                );
                self.stimulus = Some(payload);
                Ok(())
            }
            phase => Err(SessionError::WrongPhase {
                action: "select a stimulus",
                phase,
            }),
        }
    }

    /// Distribute the stimulus and wait for everyone to load it
    pub fn begin_round(&mut self) -> SessionResult<()> {
        if self.state.phase != RoundPhase::Lobby {
            return Err(SessionError::WrongPhase {
                action: "begin a round",
                phase: self.state.phase,
            });
        }
        let stimulus = self.stimulus.clone().ok_or(SessionError::NoStimulus)?;

        self.state.start_loading()?;
        self.load_generation += 1;
        self.playback = None;
        self.click_armed = false;
        self.ctx.presenter.host_phase(RoundPhase::Loading);

        let peers: Vec<ConnectionId> = self
            .state
            .roster
            .ids()
            .filter_map(|id| match id {
                ParticipantId::Peer(conn) => Some(conn.clone()),
                ParticipantId::Host => None,
            })
            .collect();
        tracing::info!("Sending stimulus to {} guest(s)", peers.len());
        let report = self.fanout.send_to(
            &peers,
            &WireMessage::Preload {
                stimulus: stimulus.clone(),
            },
        );
        self.evictions.extend(report.failed);
        self.report_loading_progress();

        let decoder = self.ctx.decoder.clone();
        let events = self.events.clone();
        let generation = self.load_generation;
        tokio::spawn(async move {
            let result = decoder.decode(&stimulus).await;
            let _ = events.send(HostEvent::StimulusDecoded { generation, result });
        });

        self.flush_evictions();
        Ok(())
    }

    /// Send everyone back to the lobby while the stimulus is still loading
    pub fn abort_round(&mut self) -> SessionResult<()> {
        if self.state.phase != RoundPhase::Loading {
            return Err(SessionError::WrongPhase {
                action: "abort a round",
                phase: self.state.phase,
            });
        }
        tracing::info!(
            "Round aborted with {}/{} ready",
            self.state.readiness.ready_count(&self.state.roster),
            self.state.roster.len()
        );
        self.abort_loading();
        self.flush_evictions();
        Ok(())
    }

    /// Record the host's own reaction
    pub fn click(&mut self) -> SessionResult<()> {
        match self.state.phase {
            RoundPhase::Active => {}
            RoundPhase::Resolved => {
                return Err(SessionError::WrongPhase {
                    action: "click",
                    phase: RoundPhase::Resolved,
                })
            }
            _ => return Err(SessionError::NotStarted),
        }
        if !self.click_armed {
            return Err(SessionError::StimulusPlaying);
        }

        let now = self.ctx.clock.now_millis();
        if !self.state.clicks.record(ParticipantId::Host, now) {
            return Err(SessionError::AlreadyClicked);
        }
        tracing::info!("Host clicked at {}", now);
        self.ctx.presenter.notice(Notice::Clicked);

        self.evaluate();
        self.flush_evictions();
        Ok(())
    }

    pub fn play_again(&mut self) -> SessionResult<()> {
        if self.state.phase != RoundPhase::Resolved {
            return Err(SessionError::WrongPhase {
                action: "play again",
                phase: self.state.phase,
            });
        }

        self.broadcast(WireMessage::Rematch);
        self.back_to_lobby()?;
        self.flush_evictions();
        Ok(())
    }

    // ========== Transport events ==========

    fn on_connected(&mut self, conn: Arc<dyn Connection>) {
        let id = conn.id().clone();
        if self.fanout.insert(conn) {
            tracing::info!(
                "Guest connection {} opened ({} live)",
                id,
                self.fanout.len()
            );
        } else {
            tracing::warn!("Ignoring second connection with id {}", id);
        }
    }

    fn on_message(&mut self, from: &ConnectionId, text: &str) {
        if !self.fanout.contains(from) {
            tracing::warn!("Dropping message from unknown connection {}", from);
            return;
        }

        let msg = match protocol::decode(text).and_then(|m| m.expect_direction(Direction::ToHost))
        {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping message from {}: {}", from, e);
                return;
            }
        };
        tracing::debug!("Received {} from {}", msg.kind(), from);

        // Identity comes from the connection, not from what the payload claims
        let sender = ParticipantId::peer(from.clone());
        match msg {
            WireMessage::Join { display_name } => self.on_join(sender, &display_name),
            WireMessage::Ready { id } => {
                warn_on_claim(&sender, &id);
                self.on_ready(sender);
            }
            WireMessage::Clicked {
                id,
                local_timestamp,
            } => {
                warn_on_claim(&sender, &id);
                self.on_clicked(sender, local_timestamp);
            }
            other => tracing::warn!("Unexpected {} from {}", other.kind(), from),
        }
    }

    fn on_join(&mut self, sender: ParticipantId, display_name: &str) {
        let name: String = display_name.trim().chars().take(MAX_NAME_CHARS).collect();
        if name.is_empty() {
            tracing::warn!("Ignoring join with empty name from {}", sender);
            return;
        }
        if self.state.roster.contains(&sender) || self.state.is_parked(&sender) {
            tracing::debug!("Duplicate join from {} ignored", sender);
            return;
        }

        let participant = Participant::new(sender.clone(), name.clone());
        if self.state.phase == RoundPhase::Lobby {
            if let Err(e) = self.state.roster.add(participant) {
                tracing::warn!("Join from {} rejected: {}", sender, e);
                return;
            }
            tracing::info!("{} joined as {}", sender, name);
            self.roster_changed();
        } else {
            tracing::info!(
                "{} asked to join during {:?}; parked until the lobby",
                name,
                self.state.phase
            );
            self.state.park_join(participant);
            self.ctx.presenter.notice(Notice::JoinDeferred(name));
        }
    }

    fn on_ready(&mut self, sender: ParticipantId) {
        if self.state.phase != RoundPhase::Loading {
            tracing::debug!("Ignoring ready from {} in {:?}", sender, self.state.phase);
            return;
        }
        if !self.state.roster.contains(&sender) {
            tracing::debug!("Ignoring ready from non-member {}", sender);
            return;
        }
        self.state.readiness.mark_ready(sender);
        self.report_loading_progress();
        self.evaluate();
    }

    fn on_clicked(&mut self, sender: ParticipantId, timestamp: Timestamp) {
        if self.state.phase != RoundPhase::Active {
            tracing::debug!("Ignoring click from {} in {:?}", sender, self.state.phase);
            return;
        }
        if !self.state.roster.contains(&sender) {
            tracing::debug!("Ignoring click from non-member {}", sender);
            return;
        }
        if !self.state.clicks.record(sender.clone(), timestamp) {
            tracing::debug!("Repeated click from {} ignored", sender);
            return;
        }
        tracing::info!("{} clicked at {}", sender, timestamp);
        self.evaluate();
    }

    fn on_disconnect(&mut self, id: &ConnectionId) {
        let tracked = self.fanout.remove(id).is_some();
        let was_member = self
            .state
            .remove_participant(&ParticipantId::peer(id.clone()));
        if !tracked && !was_member {
            return;
        }

        tracing::info!(
            "Guest {} left ({} connection(s) remain)",
            id,
            self.fanout.len()
        );
        if was_member {
            self.roster_changed();
        }
    }

    // ========== Internal transitions ==========

    fn on_self_decoded(&mut self, generation: u64, result: StimulusResult<Arc<dyn Playback>>) {
        if generation != self.load_generation || self.state.phase != RoundPhase::Loading {
            tracing::debug!("Discarding stale stimulus decode (generation {})", generation);
            return;
        }

        match result {
            Ok(playback) => {
                tracing::info!("Host stimulus ready ({:?})", playback.duration());
                self.playback = Some(playback);
                self.state.readiness.mark_ready(ParticipantId::Host);
                self.report_loading_progress();
                self.evaluate();
            }
            Err(e) => {
                tracing::error!("Host could not decode the stimulus: {}", e);
                self.ctx
                    .presenter
                    .notice(Notice::StimulusFailed(e.to_string()));
                self.abort_loading();
            }
        }
    }

    fn on_playback_stopped(&mut self, round_no: u32) {
        if round_no != self.state.round_no || self.state.phase != RoundPhase::Active {
            tracing::debug!("Ignoring playback stop for round {}", round_no);
            return;
        }
        self.click_armed = true;
        self.ctx.presenter.notice(Notice::ClickNow);
    }

    /// Roster broadcast comes first, then anything that depends on membership
    fn roster_changed(&mut self) {
        self.broadcast(WireMessage::Roster {
            participants: self.state.roster.snapshot(),
        });
        self.ctx
            .presenter
            .roster_changed(self.state.roster.participants());
        self.save_snapshot();
        self.report_loading_progress();
        self.evaluate();
    }

    fn evaluate(&mut self) {
        if self.state.readiness_complete() {
            self.launch_round();
        }
        if self.state.clicks_complete() {
            self.resolve_round();
        }
    }

    /// Countdown: pick the schedule, announce it, go straight to Active
    fn launch_round(&mut self) {
        let Some(playback) = self.playback.clone() else {
            tracing::warn!("Everyone is ready but the host has no playback");
            return;
        };

        let now = self.ctx.clock.now_millis();
        let plan = match plan_round(
            now,
            playback.duration(),
            &self.ctx.scheduler,
            self.rng.as_mut(),
        ) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("Cannot schedule round: {}", e);
                self.ctx
                    .presenter
                    .notice(Notice::StimulusFailed(e.to_string()));
                self.abort_loading();
                return;
            }
        };

        if let Err(e) = self.state.start_countdown() {
            tracing::error!("{}", e);
            return;
        }
        self.ctx.presenter.host_phase(RoundPhase::Countdown);
        tracing::info!(
            "Playback starts at {} and stops after {:.2}s",
            plan.start_instant,
            plan.stop_offset_seconds
        );
        self.broadcast(WireMessage::Begin {
            stop_offset_seconds: plan.stop_offset_seconds,
            start_instant: plan.start_instant,
        });

        if let Err(e) = self.state.activate() {
            tracing::error!("{}", e);
            return;
        }
        self.click_armed = false;
        self.ctx.presenter.host_phase(RoundPhase::Active);

        let schedule = local_schedule(
            plan.start_instant,
            plan.stop_offset_seconds,
            self.ctx.clock.now_millis(),
        );
        let events = self.events.clone();
        let round_no = self.state.round_no;
        self.timers.schedule(schedule, playback, move || {
            let _ = events.send(HostEvent::PlaybackStopped { round_no });
        });
    }

    fn resolve_round(&mut self) {
        let outcome = match self.state.resolve() {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Failed to resolve round: {}", e);
                return;
            }
        };
        tracing::info!(
            "Round {} resolved; loser is {}",
            self.state.round_no,
            outcome.loser.display_name
        );

        self.click_armed = false;
        self.broadcast(WireMessage::from(outcome.clone()));
        self.ctx.presenter.host_phase(RoundPhase::Resolved);
        self.ctx
            .presenter
            .outcome(&outcome, outcome.is_loser(&ParticipantId::Host));
        self.last_outcome = Some(outcome);
    }

    /// Loading cannot finish: send everyone back to the lobby
    fn abort_loading(&mut self) {
        self.broadcast(WireMessage::Rematch);
        if let Err(e) = self.back_to_lobby() {
            tracing::error!("Failed to abort loading: {}", e);
        }
    }

    fn back_to_lobby(&mut self) -> SessionResult<()> {
        let admitted = self.state.return_to_lobby()?;
        self.playback = None;
        self.click_armed = false;
        self.ctx.presenter.host_phase(RoundPhase::Lobby);

        if !admitted.is_empty() {
            tracing::info!("Admitting {} parked join(s)", admitted.len());
            self.roster_changed();
        }
        Ok(())
    }

    fn report_loading_progress(&self) {
        if self.state.phase == RoundPhase::Loading {
            self.ctx.presenter.loading_progress(
                self.state.readiness.ready_count(&self.state.roster),
                self.state.roster.len(),
            );
        }
    }

    fn broadcast(&mut self, msg: WireMessage) {
        let report = self.fanout.broadcast(&msg);
        self.evictions.extend(report.failed);
    }

    fn flush_evictions(&mut self) {
        while let Some(id) = self.evictions.pop() {
            self.on_disconnect(&id);
        }
    }

    fn save_snapshot(&self) {
        self.ctx.save(SessionSnapshot::new(
            Role::Host,
            self.room_id.clone(),
            self.host_name.clone(),
            self.state.roster.snapshot(),
        ));
    }
}

fn warn_on_claim(sender: &ParticipantId, claimed: &ParticipantId) {
    if sender != claimed {
        tracing::warn!("{} claimed to be {}; using connection identity", sender, claimed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persist::{MemoryStore, SessionStore};
    use crate::presenter::{Presented, RecordingPresenter};
    use crate::stimulus::{silent_wav, WavDecoder};
    use crate::transport::ChannelConnection;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::time::Duration;

    const T0: Timestamp = 1_700_000_000_000;

    struct Harness {
        session: HostSession,
        rx: mpsc::UnboundedReceiver<HostEvent>,
        clock: ManualClock,
        presenter: Arc<RecordingPresenter>,
        store: Arc<MemoryStore>,
        outboxes: HashMap<String, mpsc::UnboundedReceiver<String>>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(T0);
            let presenter = Arc::new(RecordingPresenter::new());
            let store = Arc::new(MemoryStore::default());
            let ctx = SessionContext {
                clock: Arc::new(clock.clone()),
                decoder: Arc::new(WavDecoder),
                presenter: presenter.clone(),
                store: None,
                scheduler: Default::default(),
            }
            .with_store(store.clone());
            let (session, rx) = HostSession::new(
                ctx,
                "Hana",
                Some("ROOM1".to_string()),
                Box::new(StdRng::seed_from_u64(3)),
            );
            Self {
                session,
                rx,
                clock,
                presenter,
                store,
                outboxes: HashMap::new(),
            }
        }

        fn connect(&mut self, id: &str) {
            let (conn, rx) = ChannelConnection::pair(id);
            self.outboxes.insert(id.to_string(), rx);
            self.session
                .handle_event(HostEvent::Connected(Arc::new(conn)));
        }

        fn send(&mut self, id: &str, msg: WireMessage) {
            self.session.handle_event(HostEvent::Message {
                from: id.to_string(),
                text: protocol::encode(&msg).unwrap(),
            });
        }

        fn join(&mut self, id: &str, name: &str) {
            self.connect(id);
            self.send(
                id,
                WireMessage::Join {
                    display_name: name.to_string(),
                },
            );
        }

        fn ready(&mut self, id: &str) {
            self.send(
                id,
                WireMessage::Ready {
                    id: ParticipantId::peer(id),
                },
            );
        }

        fn clicked(&mut self, id: &str, ts: Timestamp) {
            self.send(
                id,
                WireMessage::Clicked {
                    id: ParticipantId::peer(id),
                    local_timestamp: ts,
                },
            );
        }

        /// Everything sent to one guest since the last call
        fn drain(&mut self, id: &str) -> Vec<WireMessage> {
            let rx = self.outboxes.get_mut(id).unwrap();
            let mut out = Vec::new();
            while let Ok(text) = rx.try_recv() {
                out.push(protocol::decode(&text).unwrap());
            }
            out
        }

        /// Wait for the next self-posted event and handle it
        async fn pump(&mut self) {
            let event = self.rx.recv().await.unwrap();
            self.session.handle_event(event);
        }

        fn select_wav(&mut self, secs: u64) {
            let wav = silent_wav(1000, Duration::from_secs(secs));
            self.session
                .select_stimulus(StimulusPayload::from_bytes("audio/wav", &wav))
                .unwrap();
        }

        /// Lobby -> Active with every listed guest ready
        async fn start_round(&mut self, guests: &[&str]) {
            self.select_wav(20);
            self.session.begin_round().unwrap();
            for id in guests {
                self.ready(id);
            }
            self.pump().await; // host decode
            assert_eq!(self.session.phase(), RoundPhase::Active);
        }
    }

    fn kinds(msgs: &[WireMessage]) -> Vec<&'static str> {
        msgs.iter().map(|m| m.kind()).collect()
    }

    #[tokio::test]
    async fn test_new_session_opens_lobby() {
        let h = Harness::new();
        assert_eq!(h.session.phase(), RoundPhase::Lobby);
        assert_eq!(h.session.room_id(), "ROOM1");
        assert_eq!(h.session.roster().len(), 1);
        assert_eq!(
            h.session.join_link("http://10.0.0.2:6574/"),
            "http://10.0.0.2:6574/?room=ROOM1"
        );

        let saved = h.store.load().unwrap().unwrap();
        assert_eq!(saved.role, Role::Host);
        assert_eq!(saved.room_id, "ROOM1");
    }

    #[tokio::test]
    async fn test_join_broadcasts_roster() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.join("b", "  Bob  ");

        let names: Vec<_> = h
            .session
            .roster()
            .participants()
            .iter()
            .map(|p| p.display_name.clone())
            .collect();
        assert_eq!(names, vec!["Hana", "Alice", "Bob"]);

        // Alice saw both roster updates, Bob only the one after his join
        assert_eq!(kinds(&h.drain("a")), vec!["roster", "roster"]);
        match h.drain("b").as_slice() {
            [WireMessage::Roster { participants }] => assert_eq!(participants.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.store.load().unwrap().unwrap().roster.len(), 3);
    }

    #[tokio::test]
    async fn test_bad_joins_ignored() {
        let mut h = Harness::new();
        h.join("a", "   ");
        assert_eq!(h.session.roster().len(), 1);

        h.send(
            "a",
            WireMessage::Join {
                display_name: "Alice".to_string(),
            },
        );
        h.send(
            "a",
            WireMessage::Join {
                display_name: "Alice again".to_string(),
            },
        );
        assert_eq!(h.session.roster().len(), 2);
        assert_eq!(kinds(&h.drain("a")), vec!["roster"]);

        // Never connected
        h.send(
            "ghost",
            WireMessage::Join {
                display_name: "Ghost".to_string(),
            },
        );
        assert_eq!(h.session.roster().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_and_misdirected_messages_dropped() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.drain("a");

        for text in [
            "garbage",
            r#"{"type":"dance"}"#,
            r#"{"type":"ready"}"#,
            r#"{"type":"rematch"}"#,
        ] {
            h.session.handle_event(HostEvent::Message {
                from: "a".to_string(),
                text: text.to_string(),
            });
        }
        assert_eq!(h.session.phase(), RoundPhase::Lobby);
        assert_eq!(h.session.roster().len(), 2);
        assert!(h.drain("a").is_empty());
    }

    #[tokio::test]
    async fn test_begin_round_preconditions() {
        let mut h = Harness::new();
        assert_eq!(h.session.begin_round(), Err(SessionError::NoStimulus));
        assert_eq!(h.session.phase(), RoundPhase::Lobby);

        h.select_wav(20);
        h.session.begin_round().unwrap();
        assert!(matches!(
            h.session.begin_round(),
            Err(SessionError::WrongPhase {
                phase: RoundPhase::Loading,
                ..
            })
        ));
        assert!(matches!(
            h.session.select_stimulus(StimulusPayload::from_bytes("audio/wav", b"")),
            Err(SessionError::WrongPhase { .. })
        ));
    }

    #[tokio::test]
    async fn test_preload_goes_to_members_only() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.connect("lurker");
        h.drain("a");

        h.select_wav(20);
        h.session.begin_round().unwrap();
        assert_eq!(kinds(&h.drain("a")), vec!["preload"]);
        assert!(h.drain("lurker").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_waits_for_every_member() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.join("b", "Bob");
        h.select_wav(20);
        h.session.begin_round().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Loading);

        h.ready("a");
        h.pump().await; // host decode
        assert_eq!(h.session.phase(), RoundPhase::Loading);
        assert!(h
            .presenter
            .seen()
            .contains(&Presented::Progress(2, 3)));

        // Stale and foreign readiness do not count
        h.connect("c");
        h.ready("c");
        assert_eq!(h.session.phase(), RoundPhase::Loading);

        h.drain("a");
        h.ready("b");
        assert_eq!(h.session.phase(), RoundPhase::Active);

        match h.drain("a").as_slice() {
            [WireMessage::Begin {
                stop_offset_seconds,
                start_instant,
            }] => {
                assert_eq!(*start_instant, T0 + 1500);
                assert!(*stop_offset_seconds >= 3.0 && *stop_offset_seconds < 18.0);
            }
            other => panic!("expected begin, got {:?}", other),
        }
        assert_eq!(
            h.presenter
                .seen()
                .iter()
                .filter(|p| matches!(
                    p,
                    Presented::HostPhase(RoundPhase::Countdown | RoundPhase::Active)
                ))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_ready_keyed_by_connection_not_claim() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.join("b", "Bob");
        h.select_wav(20);
        h.session.begin_round().unwrap();
        h.pump().await;

        // "a" claims to be "b"; only "a" is marked
        h.send(
            "a",
            WireMessage::Ready {
                id: ParticipantId::peer("b"),
            },
        );
        assert_eq!(h.session.phase(), RoundPhase::Loading);
        h.ready("b");
        assert_eq!(h.session.phase(), RoundPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_click_window() {
        let mut h = Harness::new();
        assert_eq!(h.session.click(), Err(SessionError::NotStarted));

        h.start_round(&[]).await;
        assert_eq!(h.session.click(), Err(SessionError::StimulusPlaying));

        h.pump().await; // playback stopped
        assert!(h.session.click_armed());
        assert!(h
            .presenter
            .seen()
            .contains(&Presented::Notice(Notice::ClickNow)));

        h.session.click().unwrap();
        // Solo round resolves on the host's own click
        assert_eq!(h.session.phase(), RoundPhase::Resolved);
        assert!(matches!(
            h.session.click(),
            Err(SessionError::WrongPhase { .. })
        ));
        assert_eq!(
            h.presenter.last_outcome(),
            Some(Presented::Outcome {
                loser: "Hana".to_string(),
                you_lost: true
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_click_keeps_first() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.start_round(&["a"]).await;

        h.clicked("a", 500);
        h.clicked("a", 100);
        assert_eq!(h.session.state.clicks.len(), 1);
        assert_eq!(
            h.session.state.clicks.get(&ParticipantId::peer("a")),
            Some(500)
        );
        assert_eq!(h.session.phase(), RoundPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_player_outcome() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.join("b", "Bob");
        h.start_round(&["a", "b"]).await;
        h.pump().await; // host playback stopped
        h.drain("a");

        h.clicked("a", 100);
        h.clock.set(90);
        h.session.click().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Active);
        h.clicked("b", 120);
        assert_eq!(h.session.phase(), RoundPhase::Resolved);

        let outcome = h.session.last_outcome().unwrap().clone();
        let order: Vec<_> = outcome
            .ranking
            .iter()
            .map(|r| (r.display_name.as_str(), r.timestamp))
            .collect();
        assert_eq!(
            order,
            vec![("Hana", Some(90)), ("Alice", Some(100)), ("Bob", Some(120))]
        );
        assert_eq!(outcome.loser.display_name, "Bob");

        match h.drain("a").as_slice() {
            [WireMessage::Outcome { loser, ranking }] => {
                assert_eq!(loser.display_name, "Bob");
                assert_eq!(ranking.len(), 3);
            }
            other => panic!("expected outcome, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_resolves_pending_round() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.start_round(&["a"]).await;
        h.pump().await;

        h.clock.set(50);
        h.session.click().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Active);

        h.session.handle_event(HostEvent::Closed {
            from: "a".to_string(),
        });
        assert_eq!(h.session.phase(), RoundPhase::Resolved);

        let outcome = h.session.last_outcome().unwrap();
        assert_eq!(outcome.ranking.len(), 1);
        assert_eq!(outcome.loser.id, ParticipantId::Host);
        assert_eq!(outcome.loser.timestamp, Some(50));
    }

    #[tokio::test]
    async fn test_disconnect_unblocks_loading() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.join("b", "Bob");
        h.select_wav(20);
        h.session.begin_round().unwrap();
        h.pump().await;
        h.ready("a");
        assert_eq!(h.session.phase(), RoundPhase::Loading);

        h.drain("a");
        h.session.handle_event(HostEvent::Errored {
            from: "b".to_string(),
            error: "ice failed".to_string(),
        });
        assert_eq!(h.session.phase(), RoundPhase::Active);
        // Roster update goes out before the begin it unblocked
        assert_eq!(kinds(&h.drain("a")), vec!["roster", "begin"]);
    }

    #[tokio::test]
    async fn test_failed_send_evicts_participant() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.join("b", "Bob");
        h.join("c", "Cleo");
        h.drain("a");
        h.drain("c");

        // Bob's transport went away without a close event
        h.outboxes.remove("b");
        h.select_wav(20);
        h.session.begin_round().unwrap();

        assert!(!h.session.roster().contains(&ParticipantId::peer("b")));
        assert_eq!(h.session.connection_count(), 2);
        assert_eq!(kinds(&h.drain("a")), vec!["preload", "roster"]);
        assert_eq!(kinds(&h.drain("c")), vec!["preload", "roster"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_round_join_parked_until_rematch() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.start_round(&["a"]).await;

        h.join("late", "Latecomer");
        assert!(!h.session.roster().contains(&ParticipantId::peer("late")));
        assert!(h
            .presenter
            .seen()
            .contains(&Presented::Notice(Notice::JoinDeferred(
                "Latecomer".to_string()
            ))));

        h.pump().await;
        h.clicked("a", 10);
        h.session.click().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Resolved);

        h.drain("late");
        h.session.play_again().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Lobby);
        assert!(h.session.roster().contains(&ParticipantId::peer("late")));
        assert_eq!(kinds(&h.drain("late")), vec!["rematch", "roster"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_again_resets_round() {
        let mut h = Harness::new();
        assert!(matches!(
            h.session.play_again(),
            Err(SessionError::WrongPhase { .. })
        ));

        h.join("a", "Alice");
        h.start_round(&["a"]).await;
        h.pump().await;
        h.clicked("a", 10);
        h.session.click().unwrap();

        h.drain("a");
        h.session.play_again().unwrap();
        assert_eq!(kinds(&h.drain("a")), vec!["rematch"]);
        assert_eq!(h.session.phase(), RoundPhase::Lobby);
        assert!(h.session.state.clicks.is_empty());
        assert_eq!(h.session.click(), Err(SessionError::NotStarted));

        // Stimulus stays selected for the next round
        h.session.begin_round().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Loading);
    }

    #[tokio::test]
    async fn test_host_decode_failure_returns_to_lobby() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.session
            .select_stimulus(StimulusPayload::from_bytes("audio/mpeg", b"ID3"))
            .unwrap();
        h.session.begin_round().unwrap();
        h.ready("a");
        h.drain("a");

        h.pump().await;
        assert_eq!(h.session.phase(), RoundPhase::Lobby);
        assert_eq!(kinds(&h.drain("a")), vec!["rematch"]);
        assert!(h
            .presenter
            .seen()
            .iter()
            .any(|p| matches!(p, Presented::Notice(Notice::StimulusFailed(_)))));
    }

    #[tokio::test]
    async fn test_too_short_stimulus_returns_to_lobby() {
        let mut h = Harness::new();
        h.select_wav(1);
        h.session.begin_round().unwrap();
        h.pump().await;
        assert_eq!(h.session.phase(), RoundPhase::Lobby);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completeness_gating_random_order() {
        let mut rng = StdRng::seed_from_u64(0xc0ffee);

        for trial in 0..25 {
            let mut h = Harness::new();
            let guests: Vec<String> = (0..(trial % 6 + 1)).map(|i| format!("g{}", i)).collect();
            for id in &guests {
                h.join(id, id);
            }
            h.select_wav(20);
            h.session.begin_round().unwrap();

            // Guests and the host's own decode report readiness in random order
            let mut order: Vec<Option<&String>> = guests.iter().map(Some).collect();
            order.push(None);
            order.shuffle(&mut rng);

            for (i, who) in order.iter().enumerate() {
                assert_eq!(h.session.phase(), RoundPhase::Loading);
                match who {
                    Some(id) => h.ready(id),
                    None => h.pump().await,
                }
                let done = i + 1 == order.len();
                assert_eq!(h.session.phase() == RoundPhase::Active, done);
            }

            h.pump().await; // host playback stopped

            let mut clickers: Vec<Option<&String>> = guests.iter().map(Some).collect();
            clickers.push(None);
            clickers.shuffle(&mut rng);

            for (i, who) in clickers.iter().enumerate() {
                assert_eq!(h.session.phase(), RoundPhase::Active);
                match who {
                    Some(id) => h.clicked(id, i as Timestamp),
                    None => h.session.click().unwrap(),
                }
                let done = i + 1 == clickers.len();
                assert_eq!(h.session.phase() == RoundPhase::Resolved, done);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_members_hold_the_round() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for trial in 0..25 {
            let mut h = Harness::new();
            let guests: Vec<String> = (0..(trial % 5 + 1)).map(|i| format!("g{}", i)).collect();
            for id in &guests {
                h.join(id, id);
            }
            h.select_wav(20);
            h.session.begin_round().unwrap();

            // A random non-empty subset never reports ready
            let mut order: Vec<Option<&String>> = guests.iter().map(Some).collect();
            order.push(None);
            order.shuffle(&mut rng);
            let silent = rng.random_range(1..=order.len());
            for who in &order[silent..] {
                match who {
                    Some(id) => h.ready(id),
                    None => h.pump().await,
                }
            }
            assert_eq!(h.session.phase(), RoundPhase::Loading, "trial {}", trial);
            assert!(h.session.abort_round().is_ok());
            assert_eq!(h.session.phase(), RoundPhase::Lobby);
            if order[..silent].contains(&None) {
                h.pump().await; // decode from the aborted round, discarded
            }

            // Same again with everyone loaded but some never clicking
            h.session.begin_round().unwrap();
            for id in &guests {
                h.ready(id);
            }
            h.pump().await; // host decode
            h.pump().await; // host playback stopped
            assert_eq!(h.session.phase(), RoundPhase::Active);

            order.shuffle(&mut rng);
            let silent = rng.random_range(1..=order.len());
            for (i, who) in order[silent..].iter().enumerate() {
                match who {
                    Some(id) => h.clicked(id, i as Timestamp),
                    None => h.session.click().unwrap(),
                }
            }
            assert_eq!(h.session.phase(), RoundPhase::Active, "trial {}", trial);
            assert!(h.session.last_outcome().is_none());
        }
    }

    #[tokio::test]
    async fn test_abort_round_while_loading() {
        let mut h = Harness::new();
        h.join("a", "Alice");
        h.join("b", "Bob");
        assert!(matches!(
            h.session.abort_round(),
            Err(SessionError::WrongPhase {
                phase: RoundPhase::Lobby,
                ..
            })
        ));

        h.select_wav(20);
        h.session.begin_round().unwrap();
        h.pump().await;
        h.ready("a");
        assert_eq!(h.session.phase(), RoundPhase::Loading);

        h.drain("a");
        h.drain("b");
        h.session.abort_round().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Lobby);
        assert_eq!(kinds(&h.drain("a")), vec!["rematch"]);
        assert_eq!(kinds(&h.drain("b")), vec!["rematch"]);
        assert_eq!(h.session.roster().len(), 3);

        // The room is usable again
        h.session.begin_round().unwrap();
        assert_eq!(h.session.phase(), RoundPhase::Loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_drives_running_session() {
        let h = Harness::new();
        let handle = h.session.handle();
        let task = tokio::spawn(h.session.run(h.rx));

        assert_eq!(handle.begin_round().await, Err(SessionError::NoStimulus));
        let wav = silent_wav(1000, Duration::from_secs(20));
        handle
            .select_stimulus(StimulusPayload::from_bytes("audio/wav", &wav))
            .await
            .unwrap();
        handle.begin_round().await.unwrap();

        // Solo host: decode, then wait out the playback
        tokio::time::sleep(Duration::from_secs(40)).await;
        handle.click().await.unwrap();
        handle.play_again().await.unwrap();

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.click().await, Err(SessionError::SessionGone));
    }
}
