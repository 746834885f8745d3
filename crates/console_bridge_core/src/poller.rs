//! Alias registry and value polling scheduler.
//!
//! Polled aliases are visited in sorted cycles, at most `poll_cap` per tick, and every
//! `heartbeat_every` ticks one session heartbeat is interleaved in round-robin order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{ConsoleConfig, ProbeScripts};
use crate::error::ConsoleError;
use crate::probe::{self, ExpectedKind, HeartbeatKind, Label, Probe, ProbeValue, ResultSink};
use crate::queue::RequestQueue;

#[derive(Debug, Clone)]
pub struct Alias {
    pub expression: String,
    pub polled: bool,
    pub value: ResultSink,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasStatus {
    pub identifier: String,
    pub expression: String,
    pub polled: bool,
    pub pending: bool,
    pub value: Option<ProbeValue>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub polled: Vec<String>,
    pub heartbeat: Option<HeartbeatKind>,
    pub expired: Vec<String>,
    pub refilled: bool,
}

pub struct Poller {
    aliases: BTreeMap<String, Alias>,
    cycle: VecDeque<(String, String)>,
    pending: HashMap<String, Instant>,
    ticks: u64,
    next_heartbeat: usize,
    enabled: bool,
    cap: usize,
    expiry: Duration,
    heartbeat_every: u64,
    scripts: ProbeScripts,
}

impl Poller {
    pub fn new(config: &ConsoleConfig) -> Self {
        Self {
            aliases: BTreeMap::new(),
            cycle: VecDeque::new(),
            pending: HashMap::new(),
            ticks: 0,
            next_heartbeat: 0,
            enabled: false,
            cap: config.poll_cap.max(1),
            expiry: config.poll_expiry,
            heartbeat_every: u64::from(config.heartbeat_every.max(1)),
            scripts: config.scripts.clone(),
        }
    }

    /// Identifiers end up inside the reply suffix, so angle brackets are refused.
    pub fn set_polled(
        &mut self,
        identifier: &str,
        expression: &str,
        enabled: bool,
    ) -> Result<(), ConsoleError> {
        if identifier.is_empty() || identifier.contains(['<', '>']) {
            return Err(ConsoleError::InvalidIdentifier(identifier.to_string()));
        }
        let alias = self
            .aliases
            .entry(identifier.to_string())
            .or_insert_with(|| Alias {
                expression: expression.to_string(),
                polled: enabled,
                value: ResultSink::new(),
            });
        alias.expression = expression.to_string();
        alias.polled = enabled;

        if !enabled {
            self.forget_in_cycle(identifier);
        }
        Ok(())
    }

    pub fn remove(&mut self, identifier: &str) -> bool {
        self.forget_in_cycle(identifier);
        self.aliases.remove(identifier).is_some()
    }

    pub fn tick(&mut self, queue: &mut RequestQueue, now: Instant) -> PollReport {
        let mut report = PollReport::default();
        if !self.enabled {
            return report;
        }

        let expiry = self.expiry;
        let mut expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, issued)| now.duration_since(**issued) > expiry)
            .map(|(identifier, _)| identifier.clone())
            .collect();
        expired.sort();
        for identifier in &expired {
            tracing::debug!(alias = %identifier, "abandoning unanswered poll");
            self.pending.remove(identifier);
        }
        report.expired = expired;

        if self.cycle.is_empty() {
            self.refill();
        }

        for _ in 0..self.cap {
            let Some((identifier, expression)) = self.cycle.pop_front() else {
                break;
            };

            if !self.pending.contains_key(&identifier) {
                let probe = Probe::new(expression, Label::alias(&identifier))
                    .discard(true)
                    .kind(ExpectedKind::Lenient);
                if queue.submit(probe, now).is_queued() {
                    self.pending.insert(identifier.clone(), now);
                    report.polled.push(identifier);
                }
            }

            if self.cycle.is_empty() {
                self.refill();
                report.refilled = true;
                break;
            }
        }

        if self.ticks % self.heartbeat_every == 0 {
            let kind = HeartbeatKind::ROTATION[self.next_heartbeat % HeartbeatKind::ROTATION.len()];
            self.next_heartbeat += 1;
            queue.submit(Probe::heartbeat(kind, self.heartbeat_expression(kind)), now);
            report.heartbeat = Some(kind);
        }
        self.ticks += 1;

        report
    }

    /// Stores a poll reply. Returns false when the alias is no longer tracked.
    pub fn resolve(&mut self, identifier: &str, body: &str) -> bool {
        self.pending.remove(identifier);
        let Some(alias) = self.aliases.get(identifier) else {
            tracing::debug!(alias = identifier, "reply for removed alias");
            return false;
        };
        match probe::decode(identifier, ExpectedKind::Lenient, body) {
            Ok(value) => alias.value.set(value),
            Err(e) => tracing::warn!("Ignoring alias value: {}", e),
        }
        true
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            self.reset();
        }
    }

    /// Drops in-progress cycle state; the tracked aliases are kept.
    pub fn reset(&mut self) {
        self.cycle.clear();
        self.pending.clear();
        self.ticks = 0;
        self.next_heartbeat = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn alias_value(&self, identifier: &str) -> Option<ResultSink> {
        self.aliases.get(identifier).map(|alias| alias.value.clone())
    }

    pub fn statuses(&self) -> Vec<AliasStatus> {
        self.aliases
            .iter()
            .map(|(identifier, alias)| AliasStatus {
                identifier: identifier.clone(),
                expression: alias.expression.clone(),
                polled: alias.polled,
                pending: self.pending.contains_key(identifier),
                value: alias.value.get(),
            })
            .collect()
    }

    pub fn cycle_len(&self) -> usize {
        self.cycle.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn refill(&mut self) {
        self.cycle = self
            .aliases
            .iter()
            .filter(|(_, alias)| alias.polled)
            .map(|(identifier, alias)| (identifier.clone(), alias.expression.clone()))
            .collect();
    }

    fn forget_in_cycle(&mut self, identifier: &str) {
        self.cycle.retain(|(id, _)| id != identifier);
        self.pending.remove(identifier);
    }

    fn heartbeat_expression(&self, kind: HeartbeatKind) -> String {
        match kind {
            HeartbeatKind::StateFlags => self.scripts.state_flags.clone(),
            HeartbeatKind::Location => self.scripts.location.clone(),
            HeartbeatKind::GameStarted => self.scripts.game_started.clone(),
        }
    }
}
