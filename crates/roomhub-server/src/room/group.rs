//! The group coordinator — single authority over membership and routing.
//!
//! The membership table is owned by one task and reachable only through
//! commands, so it is single-writer by construction: add, remove, broadcast,
//! and direct-message requests from many member tasks are serviced strictly
//! one at a time, and every snapshot (welcome list, broadcast recipient set)
//! is taken between commands, never mid-mutation.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the command channel feeding the coordinator.
const COMMAND_BUFFER: usize = 64;

/// Bound on the shutdown drain while members run their close sequences.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Error returned when a command is submitted after the coordinator stopped.
#[derive(Debug, Error)]
#[error("group coordinator is no longer running")]
pub struct GroupClosed;

/// The group's view of one member: its id, the queue its supervising task
/// drains into the socket, and the token that asks it to close.
///
/// The coordinator never writes to a member's socket directly — enqueueing
/// here keeps each socket with exactly one writer.
pub struct MemberHandle {
    /// Unique member id.
    pub id: String,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl MemberHandle {
    /// Create a handle from the member's outbound queue and cancel token.
    pub fn new(id: String, outbound: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            id,
            outbound,
            cancel,
        }
    }

    fn deliver(&self, text: String) -> Result<(), TrySendError<String>> {
        self.outbound.try_send(text)
    }

    fn request_close(&self) {
        self.cancel.cancel();
    }
}

enum GroupCommand {
    Add(MemberHandle),
    Remove { id: String },
    Broadcast { from: String, text: String },
    Direct { target: String, text: String },
    MemberIds { reply: oneshot::Sender<Vec<String>> },
}

/// Cloneable handle used by member tasks and HTTP handlers to reach the
/// coordinator.
#[derive(Clone)]
pub struct GroupHandle {
    tx: mpsc::Sender<GroupCommand>,
}

impl GroupHandle {
    /// Register a member; the coordinator sends it the welcome text.
    pub async fn add(&self, member: MemberHandle) -> Result<(), GroupClosed> {
        self.send(GroupCommand::Add(member)).await
    }

    /// Remove a member by id. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: String) -> Result<(), GroupClosed> {
        self.send(GroupCommand::Remove { id }).await
    }

    /// Deliver `text` to every member except `from`.
    pub async fn broadcast(&self, from: String, text: String) -> Result<(), GroupClosed> {
        self.send(GroupCommand::Broadcast { from, text }).await
    }

    /// Deliver `text` to the single member `target`, if registered.
    pub async fn direct(&self, target: String, text: String) -> Result<(), GroupClosed> {
        self.send(GroupCommand::Direct { target, text }).await
    }

    /// Sorted snapshot of the currently-registered member ids.
    pub async fn member_ids(&self) -> Result<Vec<String>, GroupClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(GroupCommand::MemberIds { reply }).await?;
        rx.await.map_err(|_| GroupClosed)
    }

    /// Number of currently-registered members.
    pub async fn member_count(&self) -> Result<usize, GroupClosed> {
        Ok(self.member_ids().await?.len())
    }

    async fn send(&self, command: GroupCommand) -> Result<(), GroupClosed> {
        self.tx.send(command).await.map_err(|_| GroupClosed)
    }
}

/// The coordinator task state. Constructed and spawned via [`Group::spawn`].
pub struct Group {
    members: HashMap<String, MemberHandle>,
    cancel: CancellationToken,
}

impl Group {
    /// Spawn the coordinator. Cancelling `cancel` closes every member and
    /// stops the task once the table drains.
    pub fn spawn(cancel: CancellationToken) -> (GroupHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let group = Self {
            members: HashMap::new(),
            cancel,
        };
        let task = tokio::spawn(group.run(rx));
        (GroupHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<GroupCommand>) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                () = cancel.cancelled() => {
                    self.close_all(&mut rx).await;
                    break;
                }
            }
        }
        debug!("group coordinator stopped");
    }

    fn handle(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::Add(member) => self.add(member),
            GroupCommand::Remove { id } => self.remove(&id),
            GroupCommand::Broadcast { from, text } => self.broadcast(&from, &text),
            GroupCommand::Direct { target, text } => self.direct(&target, &text),
            GroupCommand::MemberIds { reply } => {
                let _ = reply.send(self.snapshot_ids());
            }
        }
    }

    fn add(&mut self, member: MemberHandle) {
        let id = member.id.clone();
        let _ = self.members.insert(id.clone(), member);

        // Snapshot of the *other* members, taken at the moment of insertion.
        let mut others: Vec<&str> = self
            .members
            .keys()
            .filter(|other| **other != id)
            .map(String::as_str)
            .collect();
        others.sort_unstable();
        let welcome = welcome_text(&others);

        // A failed welcome is logged; the member stays registered.
        if let Some(member) = self.members.get(&id) {
            if let Err(error) = member.deliver(welcome) {
                warn!(member_id = %id, error = %error, "failed to deliver welcome");
            }
        }
        info!(member_id = %id, size = self.members.len(), "member joined the group");
    }

    fn remove(&mut self, id: &str) {
        if self.members.remove(id).is_some() {
            info!(member_id = %id, size = self.members.len(), "member removed from the group");
        } else {
            debug!(member_id = %id, "remove for unknown member ignored");
        }
    }

    fn broadcast(&mut self, from: &str, text: &str) {
        let mut dead = Vec::new();
        let mut delivered = 0usize;
        for member in self.members.values() {
            if member.id == from {
                continue;
            }
            match member.deliver(text.to_owned()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(member_id = %member.id, "outbound queue full, dropping broadcast");
                }
                Err(TrySendError::Closed(_)) => dead.push(member.id.clone()),
            }
        }
        debug!(from = %from, recipients = delivered, "broadcast delivered");
        self.evict(dead);
    }

    fn direct(&mut self, target: &str, text: &str) {
        let Some(member) = self.members.get(target) else {
            debug!(target = %target, "direct message target not found");
            return;
        };
        match member.deliver(text.to_owned()) {
            Ok(()) => debug!(target = %target, "direct message delivered"),
            Err(TrySendError::Full(_)) => {
                warn!(target = %target, "outbound queue full, dropping direct message");
            }
            Err(TrySendError::Closed(_)) => self.evict(vec![target.to_owned()]),
        }
    }

    /// Drop members whose outbound queue turned out to be closed during a
    /// send, and ask their (possibly still running) tasks to close.
    fn evict(&mut self, ids: Vec<String>) {
        for id in ids {
            if let Some(member) = self.members.remove(&id) {
                warn!(member_id = %id, size = self.members.len(), "evicting member with closed outbound queue");
                member.request_close();
            }
        }
    }

    fn snapshot_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Shutdown path: ask every member to close, then keep servicing their
    /// Remove commands until the table empties or the grace period runs out.
    async fn close_all(&mut self, rx: &mut mpsc::Receiver<GroupCommand>) {
        info!(size = self.members.len(), "closing all members");
        for member in self.members.values() {
            member.request_close();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while !self.members.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(command)) => self.handle(command),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.members.len(), "shutdown drain timed out");
                    break;
                }
            }
        }
    }
}

fn welcome_text(others: &[&str]) -> String {
    format!("Welcome! IDs of the other members [{}]", others.join(", "))
}
