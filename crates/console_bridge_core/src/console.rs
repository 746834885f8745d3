//! The console facade.
//!
//! Owns the request queue, dispatcher, poller and session machine together with the
//! transport and the named timers that drive them. Every entry point takes the current
//! time; the owning event loop calls [`Console::advance_to`] to fire due timers.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ConsoleConfig;
use crate::dispatcher::{Dispatcher, ReplyRouter};
use crate::error::ConsoleError;
use crate::observable::Observable;
use crate::poller::{AliasStatus, Poller};
use crate::probe::{Label, Probe, ResultSink};
use crate::queue::{Correlated, RequestQueue, SubmitOutcome};
use crate::session::{InitStep, PeerInfo, Session, SessionEvent, SessionState, Settings};
use crate::timer::{NamedTimers, TimerService, TimerToken, VirtualTimers};
use crate::transport::{DisplaySink, IncomingMessage, Transport};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Serializable snapshot of the whole console.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleStatus {
    pub connected: bool,
    pub state: SessionState,
    pub init_step: Option<InitStep>,
    pub peer: Option<PeerInfo>,
    pub suspended: bool,
    pub queued: Vec<String>,
    pub in_flight: Option<String>,
    pub timed_out: Vec<String>,
    pub incoming: usize,
    pub batch_size: usize,
    pub aliases: Vec<AliasStatus>,
    pub properties: Vec<String>,
    pub confirmed_token: Option<i64>,
    pub state_flags: Option<String>,
    pub location: Option<String>,
}

pub struct Console<S: TimerService = VirtualTimers> {
    config: ConsoleConfig,
    queue: RequestQueue,
    dispatcher: Dispatcher,
    poller: Poller,
    session: Session,
    transport: Option<Box<dyn Transport>>,
    timers: NamedTimers<S>,
    command_seq: u64,
}

impl Console<VirtualTimers> {
    pub fn new(config: ConsoleConfig, display: Box<dyn DisplaySink>, now: Instant) -> Self {
        Self::with_timers(config, display, VirtualTimers::new(now))
    }
}

impl<S: TimerService> Console<S> {
    pub fn with_timers(config: ConsoleConfig, display: Box<dyn DisplaySink>, timers: S) -> Self {
        Self {
            queue: RequestQueue::new(&config),
            dispatcher: Dispatcher::new(display, config.initial_batch_size),
            poller: Poller::new(&config),
            session: Session::new(config.scripts.clone()),
            transport: None,
            timers: NamedTimers::new(timers),
            command_seq: 0,
            config,
        }
    }

    pub fn on_opened(
        &mut self,
        transport: Box<dyn Transport>,
        peer: PeerInfo,
        settings: Settings,
        now: Instant,
    ) {
        self.timers.advance_clock(now);
        if self.transport.is_some() {
            self.on_closed("reopened", now);
        }
        self.transport = Some(transport);
        self.session
            .on_opened(peer, settings, &mut self.queue, now);
        self.sync_schedule();
    }

    /// Drops every queued, in-flight and timed-out probe and cancels all timers.
    pub fn on_closed(&mut self, reason: &str, now: Instant) {
        self.timers.advance_clock(now);
        if self.transport.take().is_none() {
            return;
        }
        self.session.on_closed(reason);
        self.queue.clear();
        self.dispatcher.clear();
        self.poller.set_enabled(false);
        self.poller.reset();
        self.timers.disarm_all();
    }

    pub fn on_message(&mut self, message: IncomingMessage, now: Instant) {
        self.timers.advance_clock(now);
        if self.transport.is_none() {
            tracing::debug!(text = %message.text, "dropping message received while disconnected");
            return;
        }
        self.dispatcher.on_message(message);
        self.timers
            .arm_if_idle(TimerToken::Drain, self.config.drain_period());
    }

    pub fn submit_probe(
        &mut self,
        expression: &str,
        label: &str,
        sink: Option<ResultSink>,
        discard: bool,
        now: Instant,
    ) -> SubmitOutcome {
        let mut probe = Probe::new(expression, label).discard(discard);
        if let Some(sink) = sink {
            probe = probe.with_sink(sink);
        }
        self.submit(probe, now)
    }

    pub fn submit(&mut self, probe: Probe, now: Instant) -> SubmitOutcome {
        self.timers.advance_clock(now);
        if self.transport.is_none() {
            return SubmitOutcome::NotConnected;
        }
        let outcome = self.queue.submit(probe, now);
        self.sync_schedule();
        outcome
    }

    /// Operator input. The reply is displayed once it arrives.
    pub fn submit_command(&mut self, text: &str, now: Instant) -> SubmitOutcome {
        self.command_seq += 1;
        self.submit(Probe::command(text, self.command_seq), now)
    }

    pub fn set_polled(
        &mut self,
        identifier: &str,
        expression: &str,
        enabled: bool,
    ) -> Result<(), ConsoleError> {
        self.poller.set_polled(identifier, expression, enabled)
    }

    pub fn remove_alias(&mut self, identifier: &str) -> bool {
        self.poller.remove(identifier)
    }

    pub fn alias_value(&self, identifier: &str) -> Option<ResultSink> {
        self.poller.alias_value(identifier)
    }

    pub fn on_session_state_change(&self, callback: impl FnMut(&SessionState) + 'static) {
        self.session.state_cell().subscribe(callback);
    }

    pub fn session_events(&self) -> &Observable<SessionEvent> {
        self.session.events()
    }

    /// Clears a suspension that no closing echo ever ended.
    pub fn force_resume(&mut self, now: Instant) -> bool {
        self.timers.advance_clock(now);
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        let resumed = self.queue.resume(transport.as_mut());
        if resumed {
            tracing::info!("traffic suspension cleared manually");
        }
        resumed
    }

    /// Fires every timer due at or before `now`, in deadline order.
    pub fn advance_to(&mut self, now: Instant) {
        while let Some((at, token)) = self.timers.pop_due(now) {
            self.fire(token, at);
        }
        self.timers.advance_clock(now);
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.timers.is_armed(token)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn status(&self) -> ConsoleStatus {
        ConsoleStatus {
            connected: self.is_connected(),
            state: self.session.state(),
            init_step: self.session.step(),
            peer: self.session.peer().cloned(),
            suspended: self.queue.is_suspended(),
            queued: labels(self.queue.queued_labels()),
            in_flight: self
                .queue
                .in_flight()
                .map(|in_flight| in_flight.probe.label.to_string()),
            timed_out: labels(self.queue.timed_out_labels()),
            incoming: self.dispatcher.len(),
            batch_size: self.dispatcher.batch_size(),
            aliases: self.poller.statuses(),
            properties: self.session.properties().get().unwrap_or_default(),
            confirmed_token: self.session.confirmed_token(),
            state_flags: self.session.state_flags().get(),
            location: self.session.location().get(),
        }
    }

    fn fire(&mut self, token: TimerToken, at: Instant) {
        match token {
            TimerToken::QueueTick => {
                if let Some(transport) = self.transport.as_mut() {
                    let backlog = !self.dispatcher.is_empty();
                    self.queue.tick(at, backlog, transport.as_mut());
                }
            }
            TimerToken::Drain => {
                let mut routes = Routes {
                    queue: &mut self.queue,
                    poller: &mut self.poller,
                    session: &mut self.session,
                    transport: self.transport.as_mut(),
                    now: at,
                };
                let report = self.dispatcher.drain(&mut routes);
                if report.backpressure {
                    tracing::debug!(remaining = report.remaining, "drain stopped by display backpressure");
                }
                if report.remaining > 0 {
                    self.timers
                        .arm_if_idle(TimerToken::Drain, self.config.drain_period());
                }
            }
            TimerToken::PollTick => {
                let report = self.poller.tick(&mut self.queue, at);
                if !report.expired.is_empty() {
                    tracing::debug!(expired = ?report.expired, "poll replies abandoned");
                }
            }
            TimerToken::HeartbeatRetry => self.session.retry_due(&mut self.queue, at),
        }
        self.sync_schedule();
    }

    /// Arms and disarms the periodic jobs to match the session state.
    fn sync_schedule(&mut self) {
        if self.transport.is_none() {
            self.timers.disarm_all();
            return;
        }

        let ready = self.session.is_ready();
        self.queue.set_session_ready(ready);
        self.poller.set_enabled(ready);

        self.timers
            .arm_if_idle(TimerToken::QueueTick, self.config.queue_tick.max(MIN_PERIOD));
        match self.session.state() {
            SessionState::SteadyState => {
                self.timers.disarm(TimerToken::HeartbeatRetry);
                self.timers
                    .arm_if_idle(TimerToken::PollTick, self.config.poll_tick.max(MIN_PERIOD));
            }
            SessionState::AwaitingHeartbeat | SessionState::Initializing => {
                self.timers.disarm(TimerToken::PollTick);
                self.timers.arm_if_idle(
                    TimerToken::HeartbeatRetry,
                    self.config.heartbeat_retry.max(MIN_PERIOD),
                );
            }
            SessionState::Disconnected => {
                self.timers.disarm(TimerToken::PollTick);
                self.timers.disarm(TimerToken::HeartbeatRetry);
            }
        }
    }
}

/// Borrowed view handed to the dispatcher for one drain pass.
struct Routes<'a> {
    queue: &'a mut RequestQueue,
    poller: &'a mut Poller,
    session: &'a mut Session,
    transport: Option<&'a mut Box<dyn Transport>>,
    now: Instant,
}

impl ReplyRouter for Routes<'_> {
    fn correlate(&mut self, label: &str) -> Option<Correlated> {
        self.queue.correlate(label, self.now)
    }

    fn route_alias(&mut self, identifier: &str, body: &str) {
        self.poller.resolve(identifier, body);
    }

    fn route_lifecycle(&mut self, probe: &Probe, body: &str) {
        self.session.on_reply(probe, body, self.queue, self.now);
    }

    fn suspend(&mut self) {
        let session: &Session = self.session;
        if self.queue.suspend(|kind| session.heartbeat_unmet(kind)) {
            tracing::info!("multi-line command started, probe traffic suspended");
        }
    }

    fn resume(&mut self) {
        let Some(transport) = self.transport.as_deref_mut() else {
            return;
        };
        if self.queue.resume(transport.as_mut()) {
            tracing::info!("probe traffic resumed");
        }
    }
}

fn labels(list: Vec<Label>) -> Vec<String> {
    list.into_iter().map(|label| label.to_string()).collect()
}
