//! Incoming message dispatcher.
//!
//! Inbound triples are buffered and drained in batches. Log output goes straight to
//! the display; tagged replies are correlated and routed; command echoes drive traffic
//! suspension. The batch size grows while the buffer backs up and halves whenever the
//! display refuses a line.

use std::collections::VecDeque;

use crate::error::SinkError;
use crate::probe::{self, LabelClass, Probe};
use crate::queue::Correlated;
use crate::transport::{DisplayLine, DisplaySink, IncomingMessage, MessageClass};
use crate::wire::{self, TaggedReply};

/// What the drain loop needs from the rest of the console.
pub trait ReplyRouter {
    fn correlate(&mut self, label: &str) -> Option<Correlated>;
    fn route_alias(&mut self, identifier: &str, body: &str);
    fn route_lifecycle(&mut self, probe: &Probe, body: &str);
    /// A human multi-line command started on the shared channel.
    fn suspend(&mut self);
    /// A human command finished.
    fn resume(&mut self);
}

enum Buffered {
    Incoming(IncomingMessage),
    /// Already routed; only the display write is outstanding.
    Display(DisplayLine),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub remaining: usize,
    pub backpressure: bool,
}

pub struct Dispatcher {
    buffer: VecDeque<Buffered>,
    batch_size: usize,
    initial_batch_size: usize,
    display: Box<dyn DisplaySink>,
}

impl Dispatcher {
    pub fn new(display: Box<dyn DisplaySink>, initial_batch_size: usize) -> Self {
        let initial_batch_size = initial_batch_size.max(1);
        Self {
            buffer: VecDeque::new(),
            batch_size: initial_batch_size,
            initial_batch_size,
            display,
        }
    }

    pub fn on_message(&mut self, message: IncomingMessage) {
        self.buffer.push_back(Buffered::Incoming(message));
        if self.buffer.len() > self.batch_size * 3 {
            let grown = (self.batch_size * 3 / 2).max(self.batch_size + 1);
            tracing::debug!(from = self.batch_size, to = grown, "growing dispatch batch");
            self.batch_size = grown;
        }
    }

    pub fn drain(&mut self, router: &mut dyn ReplyRouter) -> DrainReport {
        let mut report = DrainReport::default();

        while report.processed < self.batch_size {
            let Some(item) = self.buffer.pop_front() else {
                break;
            };

            let outcome = match item {
                Buffered::Incoming(message) => self.handle(message, router),
                Buffered::Display(line) => self.show(line),
            };

            match outcome {
                Ok(()) => report.processed += 1,
                Err((line, error)) => {
                    self.buffer.push_front(Buffered::Display(line));
                    self.batch_size = (self.batch_size / 2).max(1);
                    tracing::warn!(
                        "Display sink refused a line ({}), batch size now {}",
                        error,
                        self.batch_size
                    );
                    report.backpressure = true;
                    break;
                }
            }
        }

        report.remaining = self.buffer.len();
        report
    }

    fn handle(
        &mut self,
        message: IncomingMessage,
        router: &mut dyn ReplyRouter,
    ) -> Result<(), (DisplayLine, SinkError)> {
        if !message.class.is_command_traffic() {
            return self.show(message.into());
        }

        if let Some(tagged) = wire::parse_reply(&message.text) {
            let tagged = OwnedReply::from(tagged);
            return self.route_reply(tagged, message, router);
        }

        if message.class == MessageClass::CommandEcho {
            if wire::is_multiline_echo(&message.text) {
                router.suspend();
            } else if wire::has_label_marker(&message.text) {
                // Echo of one of our own probes.
                return Ok(());
            } else {
                router.resume();
            }
        }

        self.show(message.into())
    }

    fn route_reply(
        &mut self,
        tagged: OwnedReply,
        message: IncomingMessage,
        router: &mut dyn ReplyRouter,
    ) -> Result<(), (DisplayLine, SinkError)> {
        let Some(Correlated { probe, late }) = router.correlate(&tagged.label) else {
            tracing::warn!("Reply for unknown or aborted label '{}'", tagged.label);
            if tagged.discard {
                return Ok(());
            }
            return self.show(reply_line(&tagged.body, message));
        };

        if late {
            tracing::debug!(label = %probe.label, "late reply recognized");
        }

        match probe.class() {
            LabelClass::Alias(identifier) => router.route_alias(&identifier, &tagged.body),
            LabelClass::Heartbeat(_) | LabelClass::Lifecycle => {
                router.route_lifecycle(&probe, &tagged.body)
            }
            LabelClass::Command | LabelClass::Ordinary => deliver(&probe, &tagged.body),
        }

        if tagged.discard {
            return Ok(());
        }
        self.show(reply_line(&tagged.body, message))
    }

    fn show(&mut self, line: DisplayLine) -> Result<(), (DisplayLine, SinkError)> {
        match self.display.write(&line) {
            Ok(()) => Ok(()),
            Err(e) => Err((line, e)),
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.batch_size = self.initial_batch_size;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

struct OwnedReply {
    body: String,
    label: String,
    discard: bool,
}

impl From<TaggedReply<'_>> for OwnedReply {
    fn from(tagged: TaggedReply<'_>) -> Self {
        Self {
            body: tagged.body.to_string(),
            label: tagged.label.to_string(),
            discard: tagged.discard,
        }
    }
}

/// Decodes into the probe's sink; a mismatch leaves the sink untouched.
fn deliver(probe: &Probe, body: &str) {
    let Some(sink) = &probe.sink else {
        return;
    };
    match probe::decode(probe.label.as_str(), probe.kind, body) {
        Ok(value) => sink.set(value),
        Err(e) => tracing::warn!("Ignoring reply value: {}", e),
    }
}

/// Display line for a reply with its suffix stripped; spans past the body are dropped.
fn reply_line(body: &str, message: IncomingMessage) -> DisplayLine {
    let spans = message
        .spans
        .into_iter()
        .filter(|span| span.end <= body.len())
        .collect();
    DisplayLine {
        text: body.to_string(),
        class: message.class,
        spans,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ExpectedKind, HeartbeatKind, Label, ProbeValue, ResultSink};
    use crate::testing::RecordingDisplay;
    use crate::transport::{Emphasis, EmphasisSpan};

    #[derive(Default)]
    struct FakeRouter {
        slots: Vec<Probe>,
        aliases: Vec<(String, String)>,
        lifecycle: Vec<(String, String)>,
        suspends: usize,
        resumes: usize,
    }

    impl FakeRouter {
        fn expecting(probes: Vec<Probe>) -> Self {
            Self {
                slots: probes,
                ..Self::default()
            }
        }
    }

    impl ReplyRouter for FakeRouter {
        fn correlate(&mut self, label: &str) -> Option<Correlated> {
            let index = self.slots.iter().position(|p| p.label.as_str() == label)?;
            Some(Correlated {
                probe: self.slots.remove(index),
                late: false,
            })
        }

        fn route_alias(&mut self, identifier: &str, body: &str) {
            self.aliases.push((identifier.to_string(), body.to_string()));
        }

        fn route_lifecycle(&mut self, probe: &Probe, body: &str) {
            self.lifecycle
                .push((probe.label.to_string(), body.to_string()));
        }

        fn suspend(&mut self) {
            self.suspends += 1;
        }

        fn resume(&mut self) {
            self.resumes += 1;
        }
    }

    fn dispatcher(batch: usize) -> (Dispatcher, RecordingDisplay) {
        let display = RecordingDisplay::default();
        (Dispatcher::new(Box::new(display.clone()), batch), display)
    }

    #[test]
    fn test_log_lines_are_forwarded_verbatim() {
        let (mut dispatcher, display) = dispatcher(10);
        let mut router = FakeRouter::default();
        let span = EmphasisSpan {
            start: 0,
            end: 4,
            emphasis: Emphasis::Bold,
        };
        dispatcher.on_message(IncomingMessage::log("WARN low memory").with_spans(vec![span]));
        dispatcher.drain(&mut router);

        assert_eq!(display.texts(), vec!["WARN low memory"]);
        assert_eq!(display.lines.borrow()[0].spans, vec![span]);
    }

    #[test]
    fn test_reply_decoded_into_sink_and_suppressed() {
        let (mut dispatcher, display) = dispatcher(10);
        let sink = ResultSink::new();
        let probe = Probe::new("player.hp", "hp")
            .kind(ExpectedKind::Number)
            .discard(true)
            .with_sink(sink.clone());
        let mut router = FakeRouter::expecting(vec![probe]);

        dispatcher.on_message(IncomingMessage::result("12.5<label:hp><discard:yes>"));
        dispatcher.drain(&mut router);

        assert_eq!(sink.get(), Some(ProbeValue::Number(12.5)));
        assert!(display.texts().is_empty());
    }

    #[test]
    fn test_reply_displayed_without_suffix_when_not_discarded() {
        let (mut dispatcher, display) = dispatcher(10);
        let mut router = FakeRouter::expecting(vec![Probe::new("name", "who")]);
        dispatcher.on_message(IncomingMessage::result("Guybrush<label:who><discard:no>"));
        dispatcher.drain(&mut router);
        assert_eq!(display.texts(), vec!["Guybrush"]);
    }

    #[test]
    fn test_decode_mismatch_leaves_sink_untouched() {
        let (mut dispatcher, _display) = dispatcher(10);
        let sink = ResultSink::new();
        let probe = Probe::new("flag", "flag")
            .kind(ExpectedKind::Boolean)
            .with_sink(sink.clone());
        let mut router = FakeRouter::expecting(vec![probe]);

        dispatcher.on_message(IncomingMessage::result("perhaps<label:flag><discard:yes>"));
        dispatcher.drain(&mut router);
        assert!(!sink.is_set());
    }

    #[test]
    fn test_unresolved_label_respects_discard_flag() {
        let (mut dispatcher, display) = dispatcher(10);
        let mut router = FakeRouter::default();
        dispatcher.on_message(IncomingMessage::result("1<label:ghost><discard:yes>"));
        dispatcher.on_message(IncomingMessage::result("2<label:ghost><discard:no>"));
        dispatcher.drain(&mut router);
        assert_eq!(display.texts(), vec!["2"]);
    }

    #[test]
    fn test_alias_and_lifecycle_routing() {
        let (mut dispatcher, _display) = dispatcher(10);
        let mut router = FakeRouter::expecting(vec![
            Probe::new("hp", Label::alias("hp")).discard(true),
            Probe::heartbeat(HeartbeatKind::GameStarted, "started()"),
        ]);
        dispatcher.on_message(IncomingMessage::result("7<label:alias:hp><discard:yes>"));
        dispatcher.on_message(IncomingMessage::result(
            "true<label:heartbeat:started><discard:yes>",
        ));
        dispatcher.drain(&mut router);

        assert_eq!(router.aliases, vec![("hp".to_string(), "7".to_string())]);
        assert_eq!(
            router.lifecycle,
            vec![("heartbeat:started".to_string(), "true".to_string())]
        );
    }

    #[test]
    fn test_echo_handling() {
        let (mut dispatcher, display) = dispatcher(10);
        let mut router = FakeRouter::default();

        dispatcher.on_message(IncomingMessage::echo("_ for i = 1, 3 do"));
        dispatcher.on_message(IncomingMessage::echo(wire::wrap("1", "A", true)));
        dispatcher.on_message(IncomingMessage::echo("end"));
        dispatcher.drain(&mut router);

        assert_eq!(router.suspends, 1);
        assert_eq!(router.resumes, 1);
        assert_eq!(display.texts(), vec!["_ for i = 1, 3 do", "end"]);
    }

    #[test]
    fn test_batch_grows_under_load() {
        let (mut dispatcher, _display) = dispatcher(2);
        for i in 0..7 {
            dispatcher.on_message(IncomingMessage::log(format!("line {i}")));
        }
        assert_eq!(dispatcher.batch_size(), 3);
        for i in 7..10 {
            dispatcher.on_message(IncomingMessage::log(format!("line {i}")));
        }
        assert_eq!(dispatcher.batch_size(), 4);
    }

    #[test]
    fn test_drain_respects_batch_size() {
        let (mut dispatcher, display) = dispatcher(4);
        let mut router = FakeRouter::default();
        for i in 0..6 {
            dispatcher.on_message(IncomingMessage::log(format!("line {i}")));
        }
        let report = dispatcher.drain(&mut router);
        assert_eq!(report.processed, 4);
        assert_eq!(report.remaining, 2);
        assert_eq!(display.texts().len(), 4);
    }

    #[test]
    fn test_backpressure_requeues_and_halves_batch() {
        let (mut dispatcher, display) = dispatcher(8);
        let mut router = FakeRouter::default();
        for i in 0..3 {
            dispatcher.on_message(IncomingMessage::log(format!("line {i}")));
        }

        display.script.borrow_mut().push_back(Ok(()));
        display.fail_next(SinkError::Full);
        let report = dispatcher.drain(&mut router);
        assert!(report.backpressure);
        assert_eq!(report.processed, 1);
        assert_eq!(dispatcher.batch_size(), 4);
        assert_eq!(dispatcher.len(), 2);

        dispatcher.drain(&mut router);
        assert_eq!(display.texts(), vec!["line 0", "line 1", "line 2"]);
    }

    #[test]
    fn test_backpressure_does_not_route_twice() {
        let (mut dispatcher, display) = dispatcher(4);
        let sink = ResultSink::new();
        let probe = Probe::new("x", "A")
            .kind(ExpectedKind::Integer)
            .with_sink(sink.clone());
        let mut router = FakeRouter::expecting(vec![probe]);

        dispatcher.on_message(IncomingMessage::result("1<label:A><discard:no>"));
        display.fail_next(SinkError::Full);
        dispatcher.drain(&mut router);
        assert_eq!(sink.version(), 1);

        dispatcher.drain(&mut router);
        assert_eq!(sink.version(), 1);
        assert_eq!(display.texts(), vec!["1"]);
    }

    #[test]
    fn test_batch_size_floor_is_one() {
        let (mut dispatcher, display) = dispatcher(1);
        let mut router = FakeRouter::default();
        dispatcher.on_message(IncomingMessage::log("x"));
        display.fail_next(SinkError::Closed);
        dispatcher.drain(&mut router);
        assert_eq!(dispatcher.batch_size(), 1);
    }
}
