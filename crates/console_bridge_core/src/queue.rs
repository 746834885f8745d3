//! Request queue with a single in-flight slot.
//!
//! Probes wait in FIFO order and are dispatched one at a time. A probe whose reply
//! does not arrive within its timeout class moves to the timed-out table, where a late
//! reply can still be recognized until the abort threshold purges it.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ConsoleConfig;
use crate::probe::{HeartbeatKind, Label, LabelClass, Probe, TimeoutClass};
use crate::transport::Transport;
use crate::wire::{Envelope, LuaEnvelope};

#[derive(Debug)]
pub struct InFlight {
    pub probe: Probe,
    pub sent_at: Instant,
}

#[derive(Debug)]
pub struct TimedOut {
    pub probe: Probe,
    pub since: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Queued,
    /// Same label already queued or in flight.
    Duplicate,
    /// Another heartbeat is in flight.
    HeartbeatBusy,
    /// The label timed out recently; the old probe is given more time instead.
    AwaitingLateReply,
    /// A heartbeat timed out before the session was ready; its wait was extended.
    HeartbeatRefreshed,
    NotConnected,
}

impl SubmitOutcome {
    pub fn is_queued(self) -> bool {
        self == SubmitOutcome::Queued
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Suspended,
    /// Inbound messages are waiting to be displayed; dispatch yields to them.
    Backlogged,
    Idle,
    Sent(Label),
    Waiting(Label),
    TimedOut(Label),
    SendFailed(Label),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resubmission {
    Requeued,
    Dropped,
}

/// A reply matched to the probe that asked for it.
#[derive(Debug)]
pub struct Correlated {
    pub probe: Probe,
    /// The reply came after the probe had timed out.
    pub late: bool,
}

pub struct RequestQueue {
    pending: VecDeque<Probe>,
    in_flight: Option<InFlight>,
    timed_out: HashMap<Label, TimedOut>,
    suspended: bool,
    session_ready: bool,
    envelope: Box<dyn Envelope>,
    short_timeout: Duration,
    long_timeout: Duration,
    abort_after: Duration,
}

impl RequestQueue {
    pub fn new(config: &ConsoleConfig) -> Self {
        Self::with_envelope(config, Box::new(LuaEnvelope))
    }

    pub fn with_envelope(config: &ConsoleConfig, envelope: Box<dyn Envelope>) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            timed_out: HashMap::new(),
            suspended: false,
            session_ready: false,
            envelope,
            short_timeout: config.short_timeout,
            long_timeout: config.long_timeout,
            abort_after: config.abort_after,
        }
    }

    pub fn submit(&mut self, probe: Probe, now: Instant) -> SubmitOutcome {
        let class = probe.class();

        if let Some(entry) = self.timed_out.get_mut(&probe.label) {
            if class.is_heartbeat() && !self.session_ready {
                entry.since = now;
                if self.is_tracked(&probe.label) || self.heartbeat_in_flight() {
                    tracing::debug!(label = %probe.label, "heartbeat still timed out, extending wait");
                    return SubmitOutcome::HeartbeatRefreshed;
                }
                // The remote may have dropped the request; keep the late-reply entry
                // and send a fresh one.
                tracing::debug!(label = %probe.label, "resending timed-out heartbeat");
                self.enqueue(probe);
                return SubmitOutcome::Queued;
            }
            if now.duration_since(entry.since) <= self.abort_after {
                return SubmitOutcome::AwaitingLateReply;
            }
            tracing::debug!(label = %probe.label, "dropping stale timed-out probe");
            self.timed_out.remove(&probe.label);
        }

        if self.is_tracked(&probe.label) {
            return SubmitOutcome::Duplicate;
        }

        if class.is_heartbeat() && self.heartbeat_in_flight() {
            return SubmitOutcome::HeartbeatBusy;
        }

        tracing::debug!(label = %probe.label, queued = self.pending.len(), "probe queued");
        self.enqueue(probe);
        SubmitOutcome::Queued
    }

    /// One pass of the dispatch loop. `backlog` is true while inbound messages are
    /// still waiting to be drained.
    pub fn tick(
        &mut self,
        now: Instant,
        backlog: bool,
        transport: &mut dyn Transport,
    ) -> TickOutcome {
        self.purge_aborted(now);

        if self.suspended {
            return TickOutcome::Suspended;
        }
        if backlog {
            return TickOutcome::Backlogged;
        }

        if let Some(in_flight) = &self.in_flight {
            let label = in_flight.probe.label.clone();
            let limit = self.timeout_for(in_flight.probe.timeout_class);
            if now.duration_since(in_flight.sent_at) <= limit {
                return TickOutcome::Waiting(label);
            }

            if let Some(expired) = self.in_flight.take() {
                tracing::debug!(label = %label, ?limit, "probe timed out");
                self.timed_out.insert(
                    label.clone(),
                    TimedOut {
                        probe: expired.probe,
                        since: now,
                    },
                );
            }
            return TickOutcome::TimedOut(label);
        }

        let Some(mut probe) = self.pending.pop_front() else {
            return TickOutcome::Idle;
        };

        let wire = probe.wire_text(self.envelope.as_ref());
        let label = probe.label.clone();
        match transport.send(&wire) {
            Ok(()) => {
                tracing::debug!(label = %label, "probe sent");
                probe.issued_at = Some(now);
                self.in_flight = Some(InFlight {
                    probe,
                    sent_at: now,
                });
                TickOutcome::Sent(label)
            }
            Err(e) => {
                tracing::warn!("Failed to send probe {}: {}", label, e);
                self.pending.push_front(probe);
                TickOutcome::SendFailed(label)
            }
        }
    }

    /// Matches a reply label against the in-flight slot, then the timed-out table.
    pub fn correlate(&mut self, label: &str, now: Instant) -> Option<Correlated> {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.probe.label.as_str() == label)
        {
            self.timed_out.remove(&Label::new(label));
            return self.in_flight.take().map(|in_flight| Correlated {
                probe: in_flight.probe,
                late: false,
            });
        }

        let entry = self.timed_out.remove(&Label::new(label))?;
        if now.duration_since(entry.since) > self.abort_after {
            tracing::debug!(label, "late reply after abort threshold");
            return None;
        }
        Some(Correlated {
            probe: entry.probe,
            late: true,
        })
    }

    /// Halts dispatch for a human multi-line command. The in-flight probe, if any, is
    /// resubmitted or dropped; returns false when already suspended.
    pub fn suspend(&mut self, heartbeat_unmet: impl Fn(HeartbeatKind) -> bool) -> bool {
        if self.suspended {
            return false;
        }
        self.suspended = true;
        if let Some(in_flight) = self.in_flight.take() {
            let label = in_flight.probe.label.clone();
            let decision = self.resubmit_or_drop(in_flight.probe, heartbeat_unmet);
            tracing::debug!(label = %label, ?decision, "in-flight probe cleared by suspension");
        }
        true
    }

    pub fn resubmit_or_drop(
        &mut self,
        probe: Probe,
        heartbeat_unmet: impl Fn(HeartbeatKind) -> bool,
    ) -> Resubmission {
        let keep = match probe.class() {
            LabelClass::Heartbeat(kind) => heartbeat_unmet(kind),
            _ => probe.timeout_class != TimeoutClass::Long,
        };

        if !keep || self.is_tracked(&probe.label) {
            return Resubmission::Dropped;
        }
        self.enqueue(probe);
        Resubmission::Requeued
    }

    /// Ends a suspension and flushes one blank line so any unterminated human input
    /// is completed. Returns false when not suspended.
    pub fn resume(&mut self, transport: &mut dyn Transport) -> bool {
        if !self.suspended {
            return false;
        }
        self.suspended = false;
        if let Err(e) = transport.send("") {
            tracing::warn!("Failed to flush transport on resume: {}", e);
        }
        true
    }

    pub fn purge_aborted(&mut self, now: Instant) {
        let abort_after = self.abort_after;
        self.timed_out.retain(|label, entry| {
            let keep = now.duration_since(entry.since) <= abort_after;
            if !keep {
                tracing::debug!(label = %label, "timed-out probe aborted");
            }
            keep
        });
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
        self.timed_out.clear();
        self.suspended = false;
        self.session_ready = false;
    }

    pub fn set_session_ready(&mut self, ready: bool) {
        self.session_ready = ready;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn queued_labels(&self) -> Vec<Label> {
        self.pending.iter().map(|probe| probe.label.clone()).collect()
    }

    pub fn timed_out_labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.timed_out.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Queued, in flight, or awaiting a late reply.
    pub fn is_outstanding(&self, label: &str) -> bool {
        let label = Label::new(label);
        self.is_tracked(&label) || self.timed_out.contains_key(&label)
    }

    fn is_tracked(&self, label: &Label) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| &in_flight.probe.label == label)
            || self.pending.iter().any(|probe| &probe.label == label)
    }

    fn heartbeat_in_flight(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.probe.class().is_heartbeat())
    }

    /// Heartbeats go to the front of the queue.
    fn enqueue(&mut self, probe: Probe) {
        if probe.class().is_heartbeat() {
            self.pending.push_front(probe);
        } else {
            self.pending.push_back(probe);
        }
    }

    fn timeout_for(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Short => self.short_timeout,
            TimeoutClass::Long => self.long_timeout,
        }
    }
}
