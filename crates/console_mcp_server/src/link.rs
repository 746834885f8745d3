//! Newline-delimited TCP channel to the remote console.
//!
//! A reader task turns inbound lines into [`LinkEvent`]s for the console actor and a
//! writer task drains the outbound line queue. Both are tagged with the connection
//! generation so events from a replaced connection can be ignored.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use console_bridge_core::{
    wire, ConsoleError, DisplayLine, DisplaySink, IncomingMessage, SinkError, Transport,
};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix the remote puts in front of echoed single-line commands.
const ECHO_PREFIX: &str = "> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Line { generation: u64, text: String },
    Closed { generation: u64, reason: String },
}

pub fn classify(line: &str) -> IncomingMessage {
    let line = line.trim_end_matches('\r');
    if wire::parse_reply(line).is_some() {
        return IncomingMessage::result(line);
    }
    if let Some(echo) = line.strip_prefix(ECHO_PREFIX) {
        return IncomingMessage::echo(echo);
    }
    if wire::is_multiline_echo(line) {
        return IncomingMessage::echo(line);
    }
    IncomingMessage::log(line)
}

/// Outbound half handed to the console; lines are queued for the writer task.
pub struct LineWriter {
    tx: mpsc::UnboundedSender<String>,
}

impl Transport for LineWriter {
    fn send(&mut self, text: &str) -> Result<(), ConsoleError> {
        self.tx
            .send(text.to_string())
            .map_err(|_| ConsoleError::transport("connection writer has shut down"))
    }
}

pub struct Link {
    pub generation: u64,
    pub endpoint: String,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    pub fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub async fn connect(
    endpoint: &str,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> console_bridge_core::Result<(Link, LineWriter)> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint))
        .await
        .map_err(|_| ConsoleError::transport(format!("timed out connecting to {endpoint}")))??;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not disable Nagle on console socket: {}", e);
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_lines(read_half, generation, events.clone()));
    let writer = tokio::spawn(write_lines(write_half, rx, generation, events));

    tracing::info!(endpoint, generation, "console link established");
    Ok((
        Link {
            generation,
            endpoint: endpoint.to_string(),
            reader,
            writer,
        },
        LineWriter { tx },
    ))
}

async fn read_lines(
    reader: OwnedReadHalf,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if events.send(LinkEvent::Line { generation, text }).is_err() {
                    return;
                }
            }
            Ok(None) => break "remote closed the connection".to_string(),
            Err(e) => break format!("read failed: {e}"),
        };
    };
    let _ = events.send(LinkEvent::Closed { generation, reason });
}

async fn write_lines(
    mut writer: OwnedWriteHalf,
    mut lines: mpsc::UnboundedReceiver<String>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(line) = lines.recv().await {
        let mut payload = line.into_bytes();
        payload.push(b'\n');
        if let Err(e) = writer.write_all(&payload).await {
            let _ = events.send(LinkEvent::Closed {
                generation,
                reason: format!("write failed: {e}"),
            });
            return;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub line: DisplayLine,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputPage {
    pub lines: Vec<OutputEntry>,
    pub next_seq: u64,
}

struct Ring {
    entries: VecDeque<OutputEntry>,
    next_seq: u64,
    capacity: usize,
}

/// Display sink keeping the most recent lines for `console_recent_output`.
#[derive(Clone)]
pub struct RecentOutput {
    ring: Rc<RefCell<Ring>>,
}

impl RecentOutput {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Rc::new(RefCell::new(Ring {
                entries: VecDeque::new(),
                next_seq: 0,
                capacity: capacity.max(1),
            })),
        }
    }

    pub fn since(&self, seq: u64) -> OutputPage {
        let ring = self.ring.borrow();
        OutputPage {
            lines: ring
                .entries
                .iter()
                .filter(|entry| entry.seq >= seq)
                .cloned()
                .collect(),
            next_seq: ring.next_seq,
        }
    }
}

impl DisplaySink for RecentOutput {
    fn write(&mut self, line: &DisplayLine) -> Result<(), SinkError> {
        tracing::debug!(class = ?line.class, "{}", line.text);
        let mut ring = self.ring.borrow_mut();
        let seq = ring.next_seq;
        ring.next_seq += 1;
        let capacity = ring.capacity;
        push_recent_output(
            &mut ring.entries,
            capacity,
            OutputEntry {
                seq,
                line: line.clone(),
            },
        );
        Ok(())
    }
}

fn push_recent_output(entries: &mut VecDeque<OutputEntry>, capacity: usize, entry: OutputEntry) {
    entries.push_back(entry);
    while entries.len() > capacity {
        entries.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use console_bridge_core::MessageClass;
    use tokio::net::TcpListener;

    #[test]
    fn classify_separates_replies_echoes_and_logs() {
        assert_eq!(
            classify("12<label:hp><discard:yes>").class,
            MessageClass::Result
        );

        let echo = classify("> print(1)");
        assert_eq!(echo.class, MessageClass::CommandEcho);
        assert_eq!(echo.text, "print(1)");

        let continuation = classify("_ for i = 1, 3 do");
        assert_eq!(continuation.class, MessageClass::CommandEcho);
        assert_eq!(continuation.text, "_ for i = 1, 3 do");

        let log = classify("loading level 3\r");
        assert_eq!(log.class, MessageClass::Log);
        assert_eq!(log.text, "loading level 3");
    }

    #[test]
    fn recent_output_ring_is_bounded_and_evicts_oldest() {
        let mut output = RecentOutput::new(4);
        for i in 0..10 {
            output
                .write(&DisplayLine::from(IncomingMessage::log(format!("line-{i}"))))
                .unwrap();
        }

        let page = output.since(0);
        assert_eq!(page.next_seq, 10);
        assert_eq!(
            page.lines.iter().map(|entry| entry.seq).collect::<Vec<_>>(),
            vec![6, 7, 8, 9]
        );
        assert_eq!(output.since(8).lines.len(), 2);
        assert!(output.since(10).lines.is_empty());
    }

    #[tokio::test]
    async fn link_carries_lines_both_ways_and_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let (link, mut writer) = connect(&endpoint, 3, events_tx).await.unwrap();
        let (remote, _) = listener.accept().await.unwrap();
        let (remote_read, mut remote_write) = remote.into_split();
        let mut remote_lines = BufReader::new(remote_read).lines();

        writer.send("print(1)").unwrap();
        let received = timeout(Duration::from_secs(2), remote_lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.as_deref(), Some("print(1)"));

        remote_write.write_all(b"hello\n").await.unwrap();
        let event = timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(LinkEvent::Line {
                generation: 3,
                text: "hello".to_string()
            })
        );

        drop(remote_write);
        drop(remote_lines);
        let event = timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap();
        assert!(matches!(event, Some(LinkEvent::Closed { generation: 3, .. })));

        link.shutdown();
    }
}
