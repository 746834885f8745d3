use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::Serialize;

use crate::error::ConsoleError;
use crate::observable::Observable;
use crate::wire;

pub const ALIAS_PREFIX: &str = "alias:";
pub const COMMAND_PREFIX: &str = "command:";
pub const PROPERTIES_LABEL: &str = "session:properties";
pub const TOKEN_WRITE_LABEL: &str = "session:token-write";
pub const TOKEN_READ_LABEL: &str = "session:token-read";

/// Cell receiving the decoded value of a probe.
pub type ResultSink = Observable<ProbeValue>;

/// The three session-level heartbeats, in round-robin order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    StateFlags,
    Location,
    GameStarted,
}

impl HeartbeatKind {
    pub const ROTATION: [HeartbeatKind; 3] = [
        HeartbeatKind::StateFlags,
        HeartbeatKind::Location,
        HeartbeatKind::GameStarted,
    ];

    pub fn label(self) -> &'static str {
        match self {
            HeartbeatKind::StateFlags => "heartbeat:flags",
            HeartbeatKind::Location => "heartbeat:location",
            HeartbeatKind::GameStarted => "heartbeat:started",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ROTATION.into_iter().find(|kind| kind.label() == label)
    }

    pub fn expected_kind(self) -> ExpectedKind {
        match self {
            HeartbeatKind::GameStarted => ExpectedKind::Boolean,
            HeartbeatKind::StateFlags | HeartbeatKind::Location => ExpectedKind::Text,
        }
    }
}

/// Purpose of a label, deciding where its reply is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelClass {
    Heartbeat(HeartbeatKind),
    /// Session initialization probes other than heartbeats.
    Lifecycle,
    /// Cyclic poll of a tracked alias.
    Alias(String),
    /// Operator command typed into the console.
    Command,
    Ordinary,
}

impl LabelClass {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, LabelClass::Heartbeat(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    /// Angle brackets would break the reply suffix, so they are replaced.
    pub fn new(label: impl Into<String>) -> Self {
        let label: String = label.into();
        Self(label.replace(['<', '>'], "_"))
    }

    pub fn alias(identifier: &str) -> Self {
        Self::new(format!("{ALIAS_PREFIX}{identifier}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn class(&self) -> LabelClass {
        if let Some(kind) = HeartbeatKind::from_label(&self.0) {
            return LabelClass::Heartbeat(kind);
        }
        if let Some(identifier) = self.0.strip_prefix(ALIAS_PREFIX) {
            return LabelClass::Alias(identifier.to_string());
        }
        if self.0.starts_with(COMMAND_PREFIX) {
            return LabelClass::Command;
        }
        match self.0.as_str() {
            PROPERTIES_LABEL | TOKEN_WRITE_LABEL | TOKEN_READ_LABEL => LabelClass::Lifecycle,
            _ => LabelClass::Ordinary,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Result kind a label's reply is declared to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedKind {
    Number,
    Integer,
    Boolean,
    Text,
    /// Poll-flavored decode: the first kind that fits wins.
    Lenient,
}

impl fmt::Display for ExpectedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExpectedKind::Number => "number",
            ExpectedKind::Integer => "integer",
            ExpectedKind::Boolean => "boolean",
            ExpectedKind::Text => "text",
            ExpectedKind::Lenient => "any",
        };
        f.write_str(name)
    }
}

impl FromStr for ExpectedKind {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "number" => Ok(ExpectedKind::Number),
            "integer" => Ok(ExpectedKind::Integer),
            "boolean" => Ok(ExpectedKind::Boolean),
            "text" => Ok(ExpectedKind::Text),
            "any" | "lenient" => Ok(ExpectedKind::Lenient),
            other => Err(ConsoleError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProbeValue {
    Number(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
    /// The remote evaluation raised; the reply carried the failure sentinel.
    NoResult,
}

impl ProbeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ProbeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ProbeValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ProbeValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeValue::Number(n) => write!(f, "{n}"),
            ProbeValue::Integer(n) => write!(f, "{n}"),
            ProbeValue::Boolean(b) => write!(f, "{b}"),
            ProbeValue::Text(s) => f.write_str(s),
            ProbeValue::NoResult => f.write_str(wire::NO_RESULT),
        }
    }
}

/// Decodes a reply body into the declared kind.
pub fn decode(label: &str, kind: ExpectedKind, body: &str) -> Result<ProbeValue, ConsoleError> {
    let text = body.trim();
    if text == wire::NO_RESULT {
        return Ok(ProbeValue::NoResult);
    }

    let mismatch = || ConsoleError::decode_mismatch(label, kind, text);
    match kind {
        ExpectedKind::Number => text
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(ProbeValue::Number)
            .ok_or_else(mismatch),
        ExpectedKind::Integer => text
            .parse::<i64>()
            .map(ProbeValue::Integer)
            .map_err(|_| mismatch()),
        ExpectedKind::Boolean => match text {
            "true" => Ok(ProbeValue::Boolean(true)),
            "false" => Ok(ProbeValue::Boolean(false)),
            _ => Err(mismatch()),
        },
        ExpectedKind::Text => Ok(ProbeValue::Text(text.to_string())),
        ExpectedKind::Lenient => Ok(decode_lenient(text)),
    }
}

fn decode_lenient(text: &str) -> ProbeValue {
    if let Ok(n) = text.parse::<i64>() {
        return ProbeValue::Integer(n);
    }
    if let Some(n) = text.parse::<f64>().ok().filter(|n| n.is_finite()) {
        return ProbeValue::Number(n);
    }
    match text {
        "true" => ProbeValue::Boolean(true),
        "false" => ProbeValue::Boolean(false),
        _ => ProbeValue::Text(text.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    Short,
    /// Probes known to be expensive on the remote side.
    Long,
}

#[derive(Clone)]
pub struct Probe {
    pub expression: String,
    pub label: Label,
    pub sink: Option<ResultSink>,
    pub discard: bool,
    pub kind: ExpectedKind,
    pub timeout_class: TimeoutClass,
    /// `expression` is already wire text and must be sent as-is.
    pub pre_wrapped: bool,
    pub issued_at: Option<Instant>,
}

impl Probe {
    pub fn new(expression: impl Into<String>, label: impl Into<Label>) -> Self {
        Self {
            expression: expression.into(),
            label: label.into(),
            sink: None,
            discard: false,
            kind: ExpectedKind::Text,
            timeout_class: TimeoutClass::Short,
            pre_wrapped: false,
            issued_at: None,
        }
    }

    pub fn with_sink(mut self, sink: ResultSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn discard(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }

    pub fn kind(mut self, kind: ExpectedKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn expensive(mut self) -> Self {
        self.timeout_class = TimeoutClass::Long;
        self
    }

    pub fn heartbeat(kind: HeartbeatKind, expression: impl Into<String>) -> Self {
        Self::new(expression, kind.label())
            .discard(true)
            .kind(kind.expected_kind())
    }

    /// Operator input: wrapped up front so the queue sends it verbatim.
    pub fn command(text: &str, seq: u64) -> Self {
        let label = Label::new(format!("{COMMAND_PREFIX}{seq}"));
        let wire = wire::wrap(text, label.as_str(), false);
        Self {
            pre_wrapped: true,
            ..Self::new(wire, label)
        }
    }

    pub fn class(&self) -> LabelClass {
        self.label.class()
    }

    pub fn wire_text(&self, envelope: &dyn wire::Envelope) -> String {
        if self.pre_wrapped {
            self.expression.clone()
        } else {
            envelope.wrap(&self.expression, self.label.as_str(), self.discard)
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("label", &self.label)
            .field("expression", &self.expression)
            .field("discard", &self.discard)
            .field("kind", &self.kind)
            .field("timeout_class", &self.timeout_class)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_classes() {
        assert_eq!(
            Label::new("heartbeat:started").class(),
            LabelClass::Heartbeat(HeartbeatKind::GameStarted)
        );
        assert_eq!(
            Label::alias("hp").class(),
            LabelClass::Alias("hp".to_string())
        );
        assert_eq!(Label::new(PROPERTIES_LABEL).class(), LabelClass::Lifecycle);
        assert_eq!(Label::new("command:3").class(), LabelClass::Command);
        assert_eq!(Label::new("inspect").class(), LabelClass::Ordinary);
    }

    #[test]
    fn test_label_strips_angle_brackets() {
        assert_eq!(Label::new("a<b>c").as_str(), "a_b_c");
    }

    #[test]
    fn test_decode_strict_kinds() {
        assert_eq!(
            decode("x", ExpectedKind::Number, " 3.5 ").unwrap(),
            ProbeValue::Number(3.5)
        );
        assert_eq!(
            decode("x", ExpectedKind::Integer, "-17").unwrap(),
            ProbeValue::Integer(-17)
        );
        assert_eq!(
            decode("x", ExpectedKind::Boolean, "false").unwrap(),
            ProbeValue::Boolean(false)
        );
        assert_eq!(
            decode("x", ExpectedKind::Text, "hello world").unwrap(),
            ProbeValue::Text("hello world".to_string())
        );
    }

    #[test]
    fn test_decode_mismatch_is_explicit() {
        let err = decode("hp", ExpectedKind::Number, "nan").unwrap_err();
        assert!(matches!(err, ConsoleError::DecodeMismatch { .. }));

        let err = decode("started", ExpectedKind::Boolean, "1").unwrap_err();
        assert!(matches!(err, ConsoleError::DecodeMismatch { .. }));

        let err = decode("token", ExpectedKind::Integer, "12.5").unwrap_err();
        assert!(matches!(err, ConsoleError::DecodeMismatch { .. }));
    }

    #[test]
    fn test_decode_no_result_sentinel() {
        for kind in [
            ExpectedKind::Number,
            ExpectedKind::Boolean,
            ExpectedKind::Lenient,
        ] {
            assert_eq!(decode("x", kind, "no result").unwrap(), ProbeValue::NoResult);
        }
    }

    #[test]
    fn test_decode_lenient() {
        assert_eq!(
            decode("x", ExpectedKind::Lenient, "42").unwrap(),
            ProbeValue::Integer(42)
        );
        assert_eq!(
            decode("x", ExpectedKind::Lenient, "0.25").unwrap(),
            ProbeValue::Number(0.25)
        );
        assert_eq!(
            decode("x", ExpectedKind::Lenient, "true").unwrap(),
            ProbeValue::Boolean(true)
        );
        assert_eq!(
            decode("x", ExpectedKind::Lenient, "table: 0x1f").unwrap(),
            ProbeValue::Text("table: 0x1f".to_string())
        );
    }

    #[test]
    fn test_command_probe_is_pre_wrapped() {
        let probe = Probe::command("print(1)", 7);
        assert!(probe.pre_wrapped);
        assert_eq!(probe.label.as_str(), "command:7");
        assert_eq!(probe.wire_text(&wire::LuaEnvelope), probe.expression);
        assert!(probe.expression.ends_with("end"));
        assert!(probe.expression.contains("<label:command:7><discard:no>"));
    }

    #[test]
    fn test_heartbeat_probe_defaults() {
        let probe = Probe::heartbeat(HeartbeatKind::GameStarted, "started()");
        assert!(probe.discard);
        assert_eq!(probe.kind, ExpectedKind::Boolean);
        assert!(probe.class().is_heartbeat());
    }

    #[test]
    fn test_expected_kind_from_str() {
        assert_eq!("Number".parse::<ExpectedKind>().unwrap(), ExpectedKind::Number);
        assert_eq!("any".parse::<ExpectedKind>().unwrap(), ExpectedKind::Lenient);
        assert!(matches!(
            "float".parse::<ExpectedKind>(),
            Err(ConsoleError::UnknownKind(kind)) if kind == "float"
        ));
    }
}
