//! Session lifecycle state machine.
//!
//! Waits for the remote game to report started, discovers the remote script properties,
//! writes a fresh session token and then stays in steady state until a heartbeat or a
//! token check says the remote went away or restarted underneath the connection.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ProbeScripts;
use crate::observable::Observable;
use crate::probe::{
    self, ExpectedKind, HeartbeatKind, LabelClass, Probe, ProbeValue, PROPERTIES_LABEL,
    TOKEN_READ_LABEL, TOKEN_WRITE_LABEL,
};
use crate::queue::RequestQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    AwaitingHeartbeat,
    Initializing,
    SteadyState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStep {
    DiscoverProperties,
    ReadToken,
    WriteToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The stored token was missing or different: the remote process restarted.
    RemoteRestarted { previous: i64, current: Option<i64> },
    RemoteUnchanged { token: i64 },
}

/// What the connection layer knows about the other end when it opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub endpoint: String,
    #[serde(default)]
    pub version: Option<String>,
}

pub type Settings = Map<String, Value>;

pub struct Session {
    state: SessionState,
    state_cell: Observable<SessionState>,
    step: Option<InitStep>,
    peer: Option<PeerInfo>,
    settings: Settings,
    scripts: ProbeScripts,
    /// Token confirmed on an earlier connection, checked on the next initialization.
    previous_token: Option<i64>,
    confirmed_token: Option<i64>,
    pending_token: Option<i64>,
    state_flags: Observable<String>,
    location: Observable<String>,
    properties: Observable<Vec<String>>,
    events: Observable<SessionEvent>,
}

impl Session {
    pub fn new(scripts: ProbeScripts) -> Self {
        Self {
            state: SessionState::Disconnected,
            state_cell: Observable::new(),
            step: None,
            peer: None,
            settings: Settings::new(),
            scripts,
            previous_token: None,
            confirmed_token: None,
            pending_token: None,
            state_flags: Observable::new(),
            location: Observable::new(),
            properties: Observable::new(),
            events: Observable::new(),
        }
    }

    pub fn on_opened(
        &mut self,
        peer: PeerInfo,
        settings: Settings,
        queue: &mut RequestQueue,
        now: Instant,
    ) {
        tracing::info!(endpoint = %peer.endpoint, version = ?peer.version, "console connection opened");
        self.peer = Some(peer);
        self.settings = settings;
        self.transition(SessionState::AwaitingHeartbeat);
        self.submit_started(queue, now);
    }

    pub fn on_closed(&mut self, reason: &str) {
        tracing::info!(reason, "console connection closed");
        if let Some(token) = self.confirmed_token.take() {
            self.previous_token = Some(token);
        }
        self.pending_token = None;
        self.step = None;
        self.peer = None;
        self.settings.clear();
        self.transition(SessionState::Disconnected);
    }

    /// Retry timer: the remote may ignore requests while loading, so the current
    /// waiting step is resubmitted until it answers.
    pub fn retry_due(&mut self, queue: &mut RequestQueue, now: Instant) {
        match self.state {
            SessionState::AwaitingHeartbeat => self.submit_started(queue, now),
            SessionState::Initializing => {
                if let Some(step) = self.step {
                    self.submit_step(step, queue, now);
                }
            }
            SessionState::Disconnected | SessionState::SteadyState => {}
        }
    }

    pub fn on_reply(&mut self, probe: &Probe, body: &str, queue: &mut RequestQueue, now: Instant) {
        // A fresh remote process has no token; whatever it prints means "unreadable".
        if probe.label.as_str() == TOKEN_READ_LABEL {
            let token = match probe::decode(TOKEN_READ_LABEL, probe.kind, body) {
                Ok(value) => value.as_i64(),
                Err(e) => {
                    tracing::debug!("Session token unreadable: {}", e);
                    None
                }
            };
            self.on_token_read(token, queue, now);
            return;
        }

        let value = match probe::decode(probe.label.as_str(), probe.kind, body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Ignoring session reply: {}", e);
                return;
            }
        };

        match probe.class() {
            LabelClass::Heartbeat(HeartbeatKind::StateFlags) => {
                if let Some(text) = value.as_text() {
                    self.state_flags.set(text.to_string());
                }
            }
            LabelClass::Heartbeat(HeartbeatKind::Location) => {
                if let Some(text) = value.as_text() {
                    self.location.set(text.to_string());
                }
            }
            LabelClass::Heartbeat(HeartbeatKind::GameStarted) => {
                self.on_started(value.as_bool().unwrap_or(false), queue, now)
            }
            LabelClass::Lifecycle => match probe.label.as_str() {
                PROPERTIES_LABEL => self.on_properties(&value, queue, now),
                TOKEN_WRITE_LABEL => self.on_token_written(value.as_i64()),
                other => tracing::debug!(label = other, "unhandled lifecycle reply"),
            },
            LabelClass::Alias(_) | LabelClass::Command | LabelClass::Ordinary => {
                tracing::debug!(label = %probe.label, "non-lifecycle reply routed to session");
            }
        }
    }

    /// Whether a heartbeat cleared from the in-flight slot is still worth resending.
    pub fn heartbeat_unmet(&self, kind: HeartbeatKind) -> bool {
        match kind {
            HeartbeatKind::GameStarted => self.state != SessionState::SteadyState,
            HeartbeatKind::StateFlags => !self.state_flags.is_set(),
            HeartbeatKind::Location => !self.location.is_set(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn state_cell(&self) -> &Observable<SessionState> {
        &self.state_cell
    }

    pub fn step(&self) -> Option<InitStep> {
        self.step
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::SteadyState
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn confirmed_token(&self) -> Option<i64> {
        self.confirmed_token
    }

    pub fn pending_token(&self) -> Option<i64> {
        self.pending_token
    }

    pub fn state_flags(&self) -> &Observable<String> {
        &self.state_flags
    }

    pub fn location(&self) -> &Observable<String> {
        &self.location
    }

    pub fn properties(&self) -> &Observable<Vec<String>> {
        &self.properties
    }

    pub fn events(&self) -> &Observable<SessionEvent> {
        &self.events
    }

    fn on_started(&mut self, started: bool, queue: &mut RequestQueue, now: Instant) {
        match (self.state, started) {
            (SessionState::AwaitingHeartbeat, true) => self.begin_init(queue, now),
            (SessionState::SteadyState, true) => {
                queue.submit(self.step_probe(InitStep::ReadToken), now);
            }
            (SessionState::SteadyState, false) => {
                tracing::info!("remote game no longer started, waiting for heartbeat");
                self.transition(SessionState::AwaitingHeartbeat);
            }
            _ => {}
        }
    }

    fn on_properties(&mut self, value: &ProbeValue, queue: &mut RequestQueue, now: Instant) {
        let properties: Vec<String> = value
            .as_text()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        tracing::debug!(count = properties.len(), "remote properties discovered");
        self.properties.set(properties);

        if self.step == Some(InitStep::DiscoverProperties) {
            let next = if self.previous_token.is_some() {
                InitStep::ReadToken
            } else {
                InitStep::WriteToken
            };
            self.advance_step(next, queue, now);
        }
    }

    fn on_token_read(&mut self, token: Option<i64>, queue: &mut RequestQueue, now: Instant) {
        match self.state {
            SessionState::Initializing if self.step == Some(InitStep::ReadToken) => {
                if let Some(previous) = self.previous_token.take() {
                    self.report_token(previous, token);
                }
                self.advance_step(InitStep::WriteToken, queue, now);
            }
            SessionState::SteadyState => {
                let Some(confirmed) = self.confirmed_token else {
                    return;
                };
                if token == Some(confirmed) {
                    return;
                }
                self.report_token(confirmed, token);
                self.confirmed_token = None;
                self.begin_init(queue, now);
            }
            _ => {}
        }
    }

    fn on_token_written(&mut self, token: Option<i64>) {
        if self.state != SessionState::Initializing || self.step != Some(InitStep::WriteToken) {
            return;
        }
        let Some(pending) = self.pending_token else {
            return;
        };
        if token != Some(pending) {
            tracing::warn!(
                "Session token write returned {:?}, expected {}; retrying",
                token,
                pending
            );
            return;
        }

        self.confirmed_token = self.pending_token.take();
        self.step = None;
        self.transition(SessionState::SteadyState);
    }

    fn report_token(&mut self, previous: i64, current: Option<i64>) {
        if current == Some(previous) {
            tracing::info!(token = previous, "remote process unchanged since last session");
            self.events.set(SessionEvent::RemoteUnchanged { token: previous });
        } else {
            tracing::warn!(
                "Remote process restarted (token {} now reads {:?})",
                previous,
                current
            );
            self.events
                .set(SessionEvent::RemoteRestarted { previous, current });
        }
    }

    fn begin_init(&mut self, queue: &mut RequestQueue, now: Instant) {
        self.transition(SessionState::Initializing);
        self.advance_step(InitStep::DiscoverProperties, queue, now);
    }

    fn advance_step(&mut self, step: InitStep, queue: &mut RequestQueue, now: Instant) {
        if step == InitStep::WriteToken {
            self.pending_token = Some(new_token());
        }
        tracing::debug!(?step, "session initialization step");
        self.step = Some(step);
        self.submit_step(step, queue, now);
    }

    fn submit_step(&self, step: InitStep, queue: &mut RequestQueue, now: Instant) {
        queue.submit(self.step_probe(step), now);
    }

    fn submit_started(&self, queue: &mut RequestQueue, now: Instant) {
        let probe = Probe::heartbeat(HeartbeatKind::GameStarted, self.scripts.game_started.clone());
        queue.submit(probe, now);
    }

    fn step_probe(&self, step: InitStep) -> Probe {
        match step {
            InitStep::DiscoverProperties => {
                Probe::new(self.scripts.properties.clone(), PROPERTIES_LABEL)
                    .discard(true)
                    .kind(ExpectedKind::Text)
                    .expensive()
            }
            InitStep::ReadToken => Probe::new(self.scripts.token_read.clone(), TOKEN_READ_LABEL)
                .discard(true)
                .kind(ExpectedKind::Integer),
            InitStep::WriteToken => {
                let token = self.pending_token.unwrap_or_default();
                Probe::new(self.scripts.token_write_for(token), TOKEN_WRITE_LABEL)
                    .discard(true)
                    .kind(ExpectedKind::Integer)
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        tracing::info!(from = ?self.state, to = ?next, "session state change");
        self.state = next;
        self.state_cell.set(next);
    }
}

/// Random signed 32-bit token; small enough to print exactly from any remote number type.
fn new_token() -> i64 {
    let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
    match i64::from(high as u32 as i32) {
        0 => 1,
        token => token,
    }
}
