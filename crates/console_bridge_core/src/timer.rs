//! Cancellable timer service and named periodic jobs.
//!
//! The console never sleeps; it asks a [`TimerService`] for deadlines and the owning
//! event loop pops whatever is due. [`NamedTimers`] keeps at most one live handle per
//! job so re-arming never leaves a duplicate timer behind.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Jobs the console schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerToken {
    QueueTick,
    Drain,
    PollTick,
    HeartbeatRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

pub trait TimerService {
    fn schedule(&mut self, delay: Duration, token: TimerToken) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
    /// Removes and returns the earliest timer due at or before `until`, advancing the
    /// service's notion of "now" to that timer's deadline.
    fn pop_due(&mut self, until: Instant) -> Option<(TimerHandle, Instant, TimerToken)>;
    fn now(&self) -> Instant;
    /// Moves the clock forward; never backwards.
    fn advance_clock(&mut self, now: Instant);
}

/// Deadline-ordered timers over a clock that only moves when timers are popped or
/// the caller advances it. Works for both wall-clock pumping and scripted tests.
#[derive(Debug)]
pub struct VirtualTimers {
    now: Instant,
    next_id: u64,
    deadlines: BTreeMap<(Instant, u64), TimerToken>,
    live: HashMap<TimerHandle, Instant>,
}

impl VirtualTimers {
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            next_id: 0,
            deadlines: BTreeMap::new(),
            live: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.live.len()
    }
}

impl TimerService for VirtualTimers {
    fn schedule(&mut self, delay: Duration, token: TimerToken) -> TimerHandle {
        self.next_id += 1;
        let handle = TimerHandle(self.next_id);
        let deadline = self.now + delay;
        self.deadlines.insert((deadline, handle.0), token);
        self.live.insert(handle, deadline);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(deadline) = self.live.remove(&handle) {
            self.deadlines.remove(&(deadline, handle.0));
        }
    }

    fn pop_due(&mut self, until: Instant) -> Option<(TimerHandle, Instant, TimerToken)> {
        let (&(deadline, id), _) = self.deadlines.first_key_value()?;
        if deadline > until {
            self.advance_clock(until);
            return None;
        }
        let token = self.deadlines.remove(&(deadline, id))?;
        let handle = TimerHandle(id);
        self.live.remove(&handle);
        self.advance_clock(deadline);
        Some((handle, deadline, token))
    }

    fn now(&self) -> Instant {
        self.now
    }

    fn advance_clock(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }
}

/// One live timer per [`TimerToken`].
#[derive(Debug)]
pub struct NamedTimers<S> {
    service: S,
    armed: HashMap<TimerToken, TimerHandle>,
}

impl<S: TimerService> NamedTimers<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            armed: HashMap::new(),
        }
    }

    /// Schedules `token`, cancelling any earlier instance of it.
    pub fn arm(&mut self, token: TimerToken, delay: Duration) {
        if let Some(previous) = self.armed.remove(&token) {
            self.service.cancel(previous);
        }
        let handle = self.service.schedule(delay, token);
        self.armed.insert(token, handle);
    }

    pub fn arm_if_idle(&mut self, token: TimerToken, delay: Duration) {
        if !self.is_armed(token) {
            self.arm(token, delay);
        }
    }

    pub fn disarm(&mut self, token: TimerToken) {
        if let Some(handle) = self.armed.remove(&token) {
            self.service.cancel(handle);
        }
    }

    pub fn disarm_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            self.service.cancel(handle);
        }
    }

    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.armed.contains_key(&token)
    }

    pub fn pop_due(&mut self, until: Instant) -> Option<(Instant, TimerToken)> {
        let (handle, deadline, token) = self.service.pop_due(until)?;
        if self.armed.get(&token) == Some(&handle) {
            self.armed.remove(&token);
        }
        Some((deadline, token))
    }

    pub fn now(&self) -> Instant {
        self.service.now()
    }

    pub fn advance_clock(&mut self, now: Instant) {
        self.service.advance_clock(now);
    }

    pub fn service(&self) -> &S {
        &self.service
    }
}
