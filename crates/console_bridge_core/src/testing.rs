//! Recording collaborators shared by the module tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{ConsoleError, SinkError};
use crate::transport::{DisplayLine, DisplaySink, Transport};
use crate::wire;

#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Rc<RefCell<Vec<String>>>,
    pub fail: Rc<RefCell<bool>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    /// Labels of the wrapped probes sent so far, in order.
    pub fn sent_labels(&self) -> Vec<String> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|text| sent_label(text))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.borrow_mut().clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, text: &str) -> Result<(), ConsoleError> {
        if *self.fail.borrow() {
            return Err(ConsoleError::transport("socket closed"));
        }
        self.sent.borrow_mut().push(text.to_string());
        Ok(())
    }
}

/// Pulls the label back out of an envelope produced by [`wire::wrap`].
pub fn sent_label(text: &str) -> Option<String> {
    let marker = "else print(\"";
    let start = text.find(marker)? + marker.len();
    let end = text[start..].find("\")")? + start;
    let reply = &text[start..end];
    wire::parse_reply(reply).map(|tagged| tagged.label.to_string())
}

#[derive(Clone, Default)]
pub struct RecordingDisplay {
    pub lines: Rc<RefCell<Vec<DisplayLine>>>,
    /// Each entry is the result of one future write attempt; empty means accept.
    pub script: Rc<RefCell<VecDeque<Result<(), SinkError>>>>,
}

impl RecordingDisplay {
    pub fn texts(&self) -> Vec<String> {
        self.lines.borrow().iter().map(|line| line.text.clone()).collect()
    }

    pub fn fail_next(&self, error: SinkError) {
        self.script.borrow_mut().push_back(Err(error));
    }
}

impl DisplaySink for RecordingDisplay {
    fn write(&mut self, line: &DisplayLine) -> Result<(), SinkError> {
        if let Some(result) = self.script.borrow_mut().pop_front() {
            result?;
        }
        self.lines.borrow_mut().push(line.clone());
        Ok(())
    }
}
