//! Channel manager: owns the transport, drives the reconnection state
//! machine, and demultiplexes inbound envelopes into typed streams.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use pulse_protocol::Envelope;

use crate::state::{Action, ChannelEvent, ClientState, Reconnector};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Size of each consumer-visible event buffer.
const STREAM_BUFFER_SIZE: usize = 256;

/// Size of the outbound command queue.
const COMMAND_BUFFER_SIZE: usize = 16;

/// An assistant reply, demuxed from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub content: String,
    pub is_partial: bool,
}

/// A recoverable channel error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFault {
    pub message: String,
}

/// Consumer ends of the demuxed streams.
pub struct ChannelStreams {
    pub replies: mpsc::Receiver<Reply>,
    pub telemetry: mpsc::Receiver<Envelope>,
    pub errors: mpsc::Receiver<ChannelFault>,
}

enum Command {
    Send(String),
    Close,
}

enum OpenOutcome {
    /// Transport closed or errored without a local close request.
    Remote,
    /// Explicit local close.
    Local,
}

/// Entry point for opening a managed channel.
pub struct ChannelManager;

impl ChannelManager {
    /// Open a channel for a session and start the driver task.
    ///
    /// `base_url` is the endpoint without a query string, e.g.
    /// `ws://host:8080/ws`; the session id is appended as a query parameter.
    /// The driver reconnects on failure with bounded exponential backoff
    /// until it reaches the retry ceiling ([`ClientState::Failed`]) or is
    /// closed. Dropping the handle tears the driver down.
    pub fn connect(base_url: &str, session_id: &str) -> (ChannelHandle, ChannelStreams) {
        let url = format!("{base_url}?session_id={}", urlencoding::encode(session_id));

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (reply_tx, replies) = mpsc::channel(STREAM_BUFFER_SIZE);
        let (telemetry_tx, telemetry) = mpsc::channel(STREAM_BUFFER_SIZE);
        let (fault_tx, errors) = mpsc::channel(STREAM_BUFFER_SIZE);
        let (state_tx, state_rx) = watch::channel(ClientState::Idle);

        let driver = Driver {
            url,
            session_id: session_id.to_string(),
            reply_tx,
            telemetry_tx,
            fault_tx,
            state_tx,
        };
        tokio::spawn(driver.run(command_rx));

        let handle = ChannelHandle {
            command_tx,
            state_rx,
            session_id: session_id.to_string(),
        };
        let streams = ChannelStreams {
            replies,
            telemetry,
            errors,
        };
        (handle, streams)
    }
}

/// Caller-facing handle to a managed channel.
#[derive(Clone)]
pub struct ChannelHandle {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ClientState>,
    session_id: String,
}

impl ChannelHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// Watch for lifecycle changes (Reconnecting, Failed, ...).
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue a user message. A logged no-op when the channel is not open;
    /// callers wanting delivery must check [`state`](Self::state) first.
    pub fn send_message(&self, content: impl Into<String>) {
        if self.state() != ClientState::Open {
            warn!(
                "session {}: channel is not open ({}), message not sent",
                self.session_id,
                self.state()
            );
            return;
        }
        if self
            .command_tx
            .try_send(Command::Send(content.into()))
            .is_err()
        {
            warn!(
                "session {}: outbound queue unavailable, message not sent",
                self.session_id
            );
        }
    }

    /// Explicit close: no reconnection is attempted and any pending retry
    /// timer is cancelled.
    pub async fn close(&self) {
        let _ = self.command_tx.send(Command::Close).await;
    }
}

struct Driver {
    url: String,
    session_id: String,
    reply_tx: mpsc::Sender<Reply>,
    telemetry_tx: mpsc::Sender<Envelope>,
    fault_tx: mpsc::Sender<ChannelFault>,
    state_tx: watch::Sender<ClientState>,
}

impl Driver {
    async fn run(self, mut command_rx: mpsc::Receiver<Command>) {
        let mut machine = Reconnector::new();
        let mut action = machine.on_event(ChannelEvent::StartRequested);

        loop {
            match action {
                Action::OpenTransport => {
                    self.publish(&machine);
                    match connect_async(self.url.as_str()).await {
                        Ok((ws, _response)) => {
                            machine.on_event(ChannelEvent::TransportOpened);
                            self.publish(&machine);
                            info!("session {}: channel open", self.session_id);
                            match self.run_open(&mut command_rx, ws).await {
                                OpenOutcome::Remote => {
                                    action = machine.on_event(ChannelEvent::TransportClosed);
                                }
                                OpenOutcome::Local => {
                                    machine.on_event(ChannelEvent::CloseRequested);
                                    action = Action::None;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("session {}: connect failed: {e}", self.session_id);
                            action = machine.on_event(ChannelEvent::TransportClosed);
                        }
                    }
                }
                Action::ScheduleRetry(delay) => {
                    self.publish(&machine);
                    info!(
                        "session {}: reconnecting in {}ms (attempt {})",
                        self.session_id,
                        delay.as_millis(),
                        machine.attempt_count()
                    );
                    let timer = tokio::time::sleep(delay);
                    tokio::pin!(timer);
                    action = loop {
                        tokio::select! {
                            _ = &mut timer => {
                                break machine.on_event(ChannelEvent::RetryTimerFired);
                            }
                            cmd = command_rx.recv() => match cmd {
                                Some(Command::Send(_)) => {
                                    warn!(
                                        "session {}: channel is not open, dropping outbound message",
                                        self.session_id
                                    );
                                }
                                Some(Command::Close) | None => {
                                    machine.on_event(ChannelEvent::CloseRequested);
                                    break Action::None;
                                }
                            },
                        }
                    };
                }
                Action::None => break,
            }
        }

        self.publish(&machine);
        match machine.state() {
            ClientState::Failed => warn!(
                "session {}: giving up after {} reconnect attempts",
                self.session_id,
                machine.attempt_count()
            ),
            state => info!("session {}: channel {state}", self.session_id),
        }
    }

    /// Pump the open connection until it closes.
    async fn run_open(
        &self,
        command_rx: &mut mpsc::Receiver<Command>,
        ws: WsStream,
    ) -> OpenOutcome {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(_))) => {
                        info!("session {}: server closed the channel", self.session_id);
                        return OpenOutcome::Remote;
                    }
                    Some(Ok(_)) => {
                        // Binary/ping/pong; keepalives are answered by the
                        // transport itself.
                        debug!("session {}: non-text frame", self.session_id);
                    }
                    Some(Err(e)) => {
                        warn!("session {}: transport error: {e}", self.session_id);
                        return OpenOutcome::Remote;
                    }
                    None => return OpenOutcome::Remote,
                },
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Send(content)) => {
                        let envelope = Envelope::UserMessage {
                            session_id: self.session_id.clone(),
                            content,
                        };
                        match envelope.encode() {
                            Ok(frame) => {
                                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                                    warn!("session {}: send failed: {e}", self.session_id);
                                    return OpenOutcome::Remote;
                                }
                            }
                            Err(e) => warn!("session {}: encode failed: {e}", self.session_id),
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return OpenOutcome::Local;
                    }
                },
            }
        }
    }

    /// Decode one inbound frame and route it to the matching consumer
    /// stream. Unknown or undecodable frames are dropped with a warning,
    /// never fatal.
    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "session {}: dropping undecodable frame: {e}",
                    self.session_id
                );
                return;
            }
        };

        // Envelopes claiming another session are not trusted.
        if envelope.session_id() != self.session_id {
            warn!(
                "session {}: dropping frame addressed to session {}",
                self.session_id,
                envelope.session_id()
            );
            return;
        }

        match envelope {
            Envelope::AssistantReply {
                content,
                is_partial,
                ..
            } => self.push(&self.reply_tx, Reply { content, is_partial }, "reply"),
            event @ (Envelope::ToolInvoked { .. }
            | Envelope::ToolCompleted { .. }
            | Envelope::ModelCallStarted { .. }
            | Envelope::ModelCallFinished { .. }) => {
                self.push(&self.telemetry_tx, event, "telemetry");
            }
            Envelope::ChannelError { message, .. } => {
                self.push(&self.fault_tx, ChannelFault { message }, "error");
            }
            Envelope::ChannelStatus { state, .. } => {
                // Informational only; our own state machine is authoritative.
                debug!("session {}: server reports {state}", self.session_id);
            }
            Envelope::UserMessage { .. } => {
                debug!("session {}: ignoring echoed user_message", self.session_id);
            }
        }
    }

    fn push<T>(&self, tx: &mpsc::Sender<T>, value: T, label: &str) {
        if tx.try_send(value).is_err() {
            warn!(
                "session {}: {label} buffer full or abandoned, dropping event",
                self.session_id
            );
        }
    }

    fn publish(&self, machine: &Reconnector) {
        self.state_tx.send_replace(machine.state());
    }
}
