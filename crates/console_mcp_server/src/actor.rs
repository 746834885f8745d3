//! Single-threaded console actor.
//!
//! The console core is not `Send`, so it lives on a dedicated thread running a
//! `LocalSet`. Tool handlers reach it through [`ConsoleHandle`], which sends a
//! [`Request`] over an mpsc channel and awaits the oneshot reply.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use console_bridge_core::{
    Console, ConsoleError, ConsoleStatus, ExpectedKind, PeerInfo, Probe, ProbeValue,
    ResultSink, SubmitOutcome,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};

use crate::config::ServerConfig;
use crate::link::{self, Link, LinkEvent, OutputPage, RecentOutput};

/// How often due console timers are fired.
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

pub type Reply<T> = oneshot::Sender<anyhow::Result<T>>;

#[derive(Debug)]
pub struct ProbeSpec {
    pub expression: String,
    pub label: String,
    pub discard: bool,
    pub kind: ExpectedKind,
    pub expensive: bool,
    /// Attach a sink and hand back a receiver for the decoded value.
    pub wait: bool,
}

#[derive(Debug)]
pub struct Submitted {
    pub outcome: SubmitOutcome,
    pub value: Option<oneshot::Receiver<ProbeValue>>,
}

pub enum Request {
    Connect {
        endpoint: Option<String>,
        reply: Reply<PeerInfo>,
    },
    Disconnect {
        reply: Reply<bool>,
    },
    Probe {
        spec: ProbeSpec,
        reply: Reply<Submitted>,
    },
    Command {
        text: String,
        reply: Reply<SubmitOutcome>,
    },
    SetPolled {
        identifier: String,
        expression: String,
        enabled: bool,
        reply: Reply<()>,
    },
    RemoveAlias {
        identifier: String,
        reply: Reply<bool>,
    },
    ForceResume {
        reply: Reply<bool>,
    },
    Status {
        reply: Reply<ConsoleStatus>,
    },
    RecentOutput {
        since_seq: u64,
        reply: Reply<OutputPage>,
    },
}

#[derive(Clone)]
pub struct ConsoleHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl ConsoleHandle {
    pub fn spawn(config: ServerConfig) -> anyhow::Result<Self> {
        let (tx, requests) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("console-actor".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("Failed to start console runtime: {}", e);
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                let (events_tx, events) = mpsc::unbounded_channel();
                let actor = ConsoleActor::new(config, events_tx);
                local.block_on(&runtime, actor.run(requests, events));
            })
            .context("Failed to spawn console actor thread")?;
        Ok(Self { tx })
    }

    pub async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> anyhow::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| anyhow!("console actor has stopped"))?;
        rx.await
            .map_err(|_| anyhow!("console actor dropped the request"))?
    }
}

struct ConsoleActor {
    console: Console,
    output: RecentOutput,
    config: ServerConfig,
    link: Option<Link>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl ConsoleActor {
    fn new(config: ServerConfig, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let output = RecentOutput::new(config.recent_output);
        let console = Console::new(
            config.console.clone(),
            Box::new(output.clone()),
            Instant::now(),
        );
        Self {
            console,
            output,
            config,
            link: None,
            generation: 0,
            events,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let mut pump = tokio::time::interval(PUMP_INTERVAL);
        pump.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    self.handle(request).await;
                }
                Some(event) = events.recv() => self.on_link_event(event),
                _ = pump.tick() => self.console.advance_to(Instant::now()),
            }
        }

        self.close("server shutting down");
        tracing::info!("console actor stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Connect { endpoint, reply } => {
                let _ = reply.send(self.connect(endpoint).await);
            }
            Request::Disconnect { reply } => {
                let _ = reply.send(Ok(self.close("operator")));
            }
            Request::Probe { spec, reply } => {
                let _ = reply.send(self.submit_probe(spec));
            }
            Request::Command { text, reply } => {
                let outcome = self.console.submit_command(&text, Instant::now());
                let _ = reply.send(connected(outcome));
            }
            Request::SetPolled {
                identifier,
                expression,
                enabled,
                reply,
            } => {
                let result = self.console.set_polled(&identifier, &expression, enabled);
                let _ = reply.send(result.map_err(Into::into));
            }
            Request::RemoveAlias { identifier, reply } => {
                let _ = reply.send(Ok(self.console.remove_alias(&identifier)));
            }
            Request::ForceResume { reply } => {
                let _ = reply.send(Ok(self.console.force_resume(Instant::now())));
            }
            Request::Status { reply } => {
                let _ = reply.send(Ok(self.console.status()));
            }
            Request::RecentOutput { since_seq, reply } => {
                let _ = reply.send(Ok(self.output.since(since_seq)));
            }
        }
    }

    async fn connect(&mut self, endpoint: Option<String>) -> anyhow::Result<PeerInfo> {
        let endpoint = endpoint.unwrap_or_else(|| self.config.endpoint.clone());
        self.close("reconnecting");

        self.generation += 1;
        let (link, writer) = link::connect(&endpoint, self.generation, self.events.clone())
            .await
            .with_context(|| format!("Failed to connect to console at {endpoint}"))?;

        let peer = PeerInfo {
            endpoint,
            version: None,
        };
        self.link = Some(link);
        self.console.on_opened(
            Box::new(writer),
            peer.clone(),
            self.config.settings.clone(),
            Instant::now(),
        );
        Ok(peer)
    }

    /// Returns false when there was no connection to close.
    fn close(&mut self, reason: &str) -> bool {
        let Some(link) = self.link.take() else {
            return false;
        };
        tracing::info!(endpoint = %link.endpoint, reason, "closing console link");
        link.shutdown();
        self.console.on_closed(reason, Instant::now());
        true
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let current = self.link.as_ref().map(|link| link.generation);
        match event {
            LinkEvent::Line { generation, text } if Some(generation) == current => {
                self.console.on_message(link::classify(&text), Instant::now());
            }
            LinkEvent::Closed { generation, reason } if Some(generation) == current => {
                tracing::warn!("Console link lost: {}", reason);
                self.close(&reason);
            }
            _ => tracing::debug!("dropping event from a replaced connection"),
        }
    }

    fn submit_probe(&mut self, spec: ProbeSpec) -> anyhow::Result<Submitted> {
        let mut probe = Probe::new(spec.expression, spec.label.as_str())
            .discard(spec.discard)
            .kind(spec.kind);
        if spec.expensive {
            probe = probe.expensive();
        }

        let mut value = None;
        if spec.wait {
            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            let sink = ResultSink::new();
            sink.subscribe(move |decoded: &ProbeValue| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(decoded.clone());
                }
            });
            probe = probe.with_sink(sink);
            value = Some(rx);
        }

        let outcome = connected(self.console.submit(probe, Instant::now()))?;
        Ok(Submitted {
            outcome,
            value: value.filter(|_| outcome.is_queued()),
        })
    }
}

fn connected(outcome: SubmitOutcome) -> anyhow::Result<SubmitOutcome> {
    if outcome == SubmitOutcome::NotConnected {
        return Err(ConsoleError::NotConnected.into());
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use console_bridge_core::SessionState;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
        time::{sleep, timeout},
    };

    /// Label embedded in a wrapped probe line.
    fn probe_label(line: &str) -> Option<String> {
        let start = line.find("<label:")? + "<label:".len();
        let end = line[start..].find('>')? + start;
        Some(line[start..end].to_string())
    }

    fn token_argument(line: &str) -> Option<String> {
        let start = line.find("set_session_token(")? + "set_session_token(".len();
        let end = line[start..].find(')')? + start;
        Some(line[start..end].to_string())
    }

    /// Minimal remote console: answers every probe it understands.
    async fn fake_remote(listener: TcpListener) {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let _ = write_half.write_all(b"remote console ready\n").await;

        while let Ok(Some(line)) = lines.next_line().await {
            let Some(label) = probe_label(&line) else {
                continue;
            };
            let body = match label.as_str() {
                "heartbeat:started" => "true".to_string(),
                "session:properties" => "hp,score".to_string(),
                "session:token-write" => token_argument(&line).unwrap_or_default(),
                "hp" => "42.5".to_string(),
                _ => "no result".to_string(),
            };
            let reply = format!("{body}<label:{label}><discard:yes>\n");
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    async fn wait_for_state(handle: &ConsoleHandle, state: SessionState) -> ConsoleStatus {
        for _ in 0..200 {
            let status = handle
                .call(|reply| Request::Status { reply })
                .await
                .unwrap();
            if status.state == state {
                return status;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("console never reached {state:?}");
    }

    #[tokio::test]
    async fn actor_drives_session_to_steady_state_and_answers_probes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_remote(listener));

        let handle = ConsoleHandle::spawn(ServerConfig::default()).unwrap();
        let peer = handle
            .call(|reply| Request::Connect {
                endpoint: Some(endpoint.clone()),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(peer.endpoint, endpoint);

        let status = wait_for_state(&handle, SessionState::SteadyState).await;
        assert_eq!(status.properties, vec!["hp", "score"]);
        assert!(status.confirmed_token.is_some());

        let spec = ProbeSpec {
            expression: "player.hp".to_string(),
            label: "hp".to_string(),
            discard: true,
            kind: ExpectedKind::Number,
            expensive: false,
            wait: true,
        };
        let submitted = handle
            .call(|reply| Request::Probe { spec, reply })
            .await
            .unwrap();
        assert_eq!(submitted.outcome, SubmitOutcome::Queued);
        let value = timeout(Duration::from_secs(3), submitted.value.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, ProbeValue::Number(42.5));

        let page = handle
            .call(|reply| Request::RecentOutput {
                since_seq: 0,
                reply,
            })
            .await
            .unwrap();
        assert!(page
            .lines
            .iter()
            .any(|entry| entry.line.text == "remote console ready"));

        let closed = handle
            .call(|reply| Request::Disconnect { reply })
            .await
            .unwrap();
        assert!(closed);
        let status = handle
            .call(|reply| Request::Status { reply })
            .await
            .unwrap();
        assert_eq!(status.state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn requests_fail_cleanly_while_disconnected() {
        let handle = ConsoleHandle::spawn(ServerConfig::default()).unwrap();
        let err = handle
            .call(|reply| Request::Command {
                text: "print(1)".to_string(),
                reply,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Not connected");

        let closed = handle
            .call(|reply| Request::Disconnect { reply })
            .await
            .unwrap();
        assert!(!closed);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let handle = ConsoleHandle::spawn(ServerConfig::default()).unwrap();
        let err = handle
            .call(|reply| Request::Connect {
                endpoint: Some(endpoint),
                reply,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to connect to console at"));
    }
}
