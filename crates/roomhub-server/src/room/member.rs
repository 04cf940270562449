//! Per-connection state machine: one joined member from admission through
//! graceful teardown.
//!
//! Two tasks per member: a receive task that classifies raw frames into
//! events, and the supervising loop that owns the socket's write half and
//! multiplexes keepalive pings, inbound events, coordinator-enqueued
//! outbound text, the idle deadline, and the close request token.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envelope::{ChatEnvelope, Route};
use super::group::{GroupHandle, MemberHandle};
use crate::config::HubConfig;

/// Bound on the close-frame write during graceful teardown.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period for the peer's close handshake before the transport drops.
const CLOSE_COOLDOWN: Duration = Duration::from_millis(50);

/// Capacity of the inbound event queue between the two member tasks.
const EVENT_BUFFER: usize = 32;

/// An inbound frame, classified by the receive task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MemberEvent {
    Text(String),
    Ping(Bytes),
    Pong,
    Close,
    Binary(usize),
}

fn classify(message: Message) -> MemberEvent {
    match message {
        Message::Text(text) => MemberEvent::Text(text.to_string()),
        Message::Ping(payload) => MemberEvent::Ping(payload),
        Message::Pong(_) => MemberEvent::Pong,
        Message::Close(_) => MemberEvent::Close,
        Message::Binary(data) => MemberEvent::Binary(data.len()),
    }
}

/// Pump raw frames into the event queue until the stream ends.
///
/// A normal closure (stream end) terminates silently; any other receive
/// error is logged and also ends the task. Ending the task does not by
/// itself remove the member — that is driven by the supervising loop.
async fn pump_frames(
    mut stream: SplitStream<WebSocket>,
    events: mpsc::Sender<MemberEvent>,
    member_id: String,
) {
    loop {
        match stream.next().await {
            Some(Ok(message)) => {
                let event = classify(message);
                let was_close = event == MemberEvent::Close;
                if events.send(event).await.is_err() {
                    return;
                }
                if was_close {
                    return;
                }
            }
            Some(Err(error)) => {
                warn!(member_id = %member_id, error = %error, "receive failed");
                return;
            }
            None => {
                debug!(member_id = %member_id, "peer stream ended");
                return;
            }
        }
    }
}

/// One joined connection plus its state machine.
pub struct Member {
    id: String,
    group: GroupHandle,
    ping_interval: Duration,
    idle_timeout: Duration,
    outbound_capacity: usize,
    is_active: bool,
}

impl Member {
    /// Build a member for a freshly upgraded connection.
    pub fn new(id: String, group: GroupHandle, config: &HubConfig) -> Self {
        Self {
            id,
            group,
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
            outbound_capacity: config.outbound_capacity,
            is_active: true,
        }
    }

    /// The member's assigned id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register with the group and drive the connection until it closes.
    ///
    /// Returns only once the member is fully torn down: removed from the
    /// group's table and its transport released.
    pub async fn run(mut self, socket: WebSocket) {
        let (mut sink, stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let handle = MemberHandle::new(self.id.clone(), outbound_tx, cancel.clone());
        if let Err(error) = self.group.add(handle).await {
            warn!(member_id = %self.id, error = %error, "admission failed");
            let _ = sink.close().await;
            return;
        }

        info!(member_id = %self.id, "member connected");
        counter!("room_members_joined_total").increment(1);
        gauge!("room_members_active").increment(1.0);
        let session_start = std::time::Instant::now();

        let reader = tokio::spawn(pump_frames(stream, event_tx, self.id.clone()));

        let mut ping = time::interval(self.ping_interval);
        let _ = ping.tick().await; // the first tick completes immediately
        let idle = time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        while self.is_active {
            tokio::select! {
                _ = ping.tick() => {
                    // Keepalive failure is logged, never fatal
                    if let Err(error) = sink.send(Message::Ping(Bytes::new())).await {
                        warn!(member_id = %self.id, error = %error, "keepalive ping failed");
                    }
                }
                event = event_rx.recv() => match event {
                    Some(event) => {
                        // Any inbound activity counts as liveness
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        self.dispatch(event, &mut sink).await;
                    }
                    None => {
                        self.close(&mut sink, "receive task ended").await;
                    }
                },
                outbound = outbound_rx.recv() => match outbound {
                    Some(text) => {
                        if let Err(error) = sink.send(Message::Text(text.into())).await {
                            warn!(member_id = %self.id, error = %error, "outbound write failed");
                            self.close(&mut sink, "write error").await;
                        }
                    }
                    None => {
                        self.close(&mut sink, "group released the member").await;
                    }
                },
                () = &mut idle => {
                    self.close(&mut sink, "inactivity").await;
                }
                () = cancel.cancelled() => {
                    self.close(&mut sink, "close requested").await;
                }
            }
        }

        // The receive task has no read deadline to arm; aborting it is the
        // cooperative unblock once the close handshake had its chance.
        reader.abort();
        gauge!("room_members_active").decrement(1.0);
        histogram!("room_member_session_seconds").record(session_start.elapsed().as_secs_f64());
        info!(member_id = %self.id, "member disconnected");
    }

    async fn dispatch(&mut self, event: MemberEvent, sink: &mut SplitSink<WebSocket, Message>) {
        match event {
            MemberEvent::Ping(payload) => {
                if let Err(error) = sink.send(Message::Pong(payload)).await {
                    warn!(member_id = %self.id, error = %error, "pong reply failed");
                }
            }
            MemberEvent::Pong => {}
            MemberEvent::Close => {
                debug!(member_id = %self.id, "peer requested close");
                self.close(sink, "peer close").await;
            }
            MemberEvent::Binary(len) => {
                debug!(member_id = %self.id, len, "ignoring binary frame");
            }
            MemberEvent::Text(text) => match ChatEnvelope::decode(&text).route() {
                Route::Broadcast { message } => {
                    if let Err(error) = self.group.broadcast(self.id.clone(), message).await {
                        warn!(member_id = %self.id, error = %error, "broadcast submission failed");
                    }
                }
                Route::SelfId => {
                    // Answered on the member's own socket, never via the group
                    if let Err(error) = sink.send(Message::Text(self.id.clone().into())).await {
                        warn!(member_id = %self.id, error = %error, "self-id reply failed");
                        self.close(sink, "write error").await;
                    }
                }
                Route::Direct { target, message } => {
                    if let Err(error) = self.group.direct(target, message).await {
                        warn!(member_id = %self.id, error = %error, "direct message submission failed");
                    }
                }
            },
        }
    }

    /// Graceful close: best-effort, every sub-step may fail without
    /// aborting the rest, and resource release always completes.
    async fn close(&mut self, sink: &mut SplitSink<WebSocket, Message>, reason: &str) {
        if !self.is_active {
            return;
        }
        self.is_active = false;
        info!(member_id = %self.id, reason, "closing member");

        if let Err(error) = self.group.remove(self.id.clone()).await {
            warn!(member_id = %self.id, error = %error, "remove submission failed");
        }

        let frame = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        }));
        match time::timeout(CLOSE_SEND_TIMEOUT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(member_id = %self.id, error = %error, "close frame write failed"),
            Err(_) => debug!(member_id = %self.id, "close frame write timed out"),
        }

        // Let the peer's close handshake land before the transport drops
        time::sleep(CLOSE_COOLDOWN).await;
    }
}
