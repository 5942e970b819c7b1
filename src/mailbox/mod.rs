//! Mailbox collaborator.
//!
//! [`Mailbox`] opens sessions; a [`MailboxSession`] lists unconsumed
//! messages, fetches their content and parts, acknowledges them, and can be
//! turned into a push [`Subscription`]. The IMAP implementation lives in
//! [`imap`]; [`connection`] drives the session lifecycle.

pub mod bodystructure;
pub mod connection;
pub mod imap;
pub mod reset;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use connection::{ConnectionManager, ConnectionState, spawn_connection_manager};
pub use imap::{ImapConfig, ImapMailbox};
pub use reset::reset_mailbox;

use crate::auth::TokenSource;
use crate::error::MailboxError;

/// Structural descriptor of one MIME part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// Position among the message's leaf parts.
    pub index: usize,
    /// IMAP section path, e.g. `2` or `1.3`.
    pub section: String,
    pub content_type: String,
    pub disposition: Option<String>,
    /// Raw filename as sent; may still contain encoded words.
    pub filename: Option<String>,
    pub encoding: Option<String>,
    pub size: usize,
}

/// Immutable reference to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    /// Provider-assigned unique id, monotonic per mailbox.
    pub uid: u32,
    pub message_id: Option<String>,
    /// Attachment parts only; body text parts are not listed.
    pub parts: Vec<PartDescriptor>,
}

/// Header and body text of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub subject: String,
    pub body: String,
    pub from: Option<String>,
    pub date: Option<String>,
}

/// Push notifications from an idling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The server announced new messages.
    NewMessages,
    /// The server closed the connection.
    Closed,
    /// The connection failed.
    Error(String),
}

/// Live event stream. Dropping it stops the underlying listener.
pub struct Subscription {
    events: mpsc::Receiver<MailboxEvent>,
    stop: Arc<AtomicBool>,
}

impl Subscription {
    /// `stop` is raised when the subscription is dropped; the producer must
    /// watch it and exit.
    pub fn new(events: mpsc::Receiver<MailboxEvent>, stop: Arc<AtomicBool>) -> Self {
        Self { events, stop }
    }

    /// Next event. `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<MailboxEvent> {
        self.events.recv().await
    }

    /// Drain queued new-message events without waiting. Returns how many
    /// were pending, or the first terminal event found.
    pub fn drain_pending(&mut self) -> Result<usize, MailboxEvent> {
        let mut pending = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                MailboxEvent::NewMessages => pending += 1,
                terminal => return Err(terminal),
            }
        }
        Ok(pending)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Opens sessions against the mailbox.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Connect and authenticate. The bearer token is read from `tokens` at
    /// call time.
    async fn connect(&self, tokens: &dyn TokenSource) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// One authenticated connection with the watched folder selected.
#[async_trait]
pub trait MailboxSession: Send {
    /// Messages matching the "unconsumed" predicate, oldest first.
    async fn list_unconsumed(&mut self) -> Result<Vec<MessageRef>, MailboxError>;

    async fn fetch_content(&mut self, message: &MessageRef) -> Result<MessageContent, MailboxError>;

    /// Decoded bytes of part `index`.
    async fn fetch_part(&mut self, message: &MessageRef, index: usize) -> Result<Vec<u8>, MailboxError>;

    /// Mark the message consumed.
    async fn acknowledge(&mut self, uid: u32) -> Result<(), MailboxError>;

    /// Mark every consumed message unconsumed again. Returns how many changed.
    async fn reset_consumed(&mut self) -> Result<usize, MailboxError>;

    /// Switch to push mode. The session is consumed.
    async fn subscribe(self: Box<Self>) -> Result<Subscription, MailboxError>;

    /// Log out and drop the connection.
    async fn close(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_raises_stop_flag() {
        let (_tx, rx) = mpsc::channel(4);
        let stop = Arc::new(AtomicBool::new(false));
        let sub = Subscription::new(rx, stop.clone());
        drop(sub);
        assert!(stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn drain_counts_new_messages() {
        let (tx, rx) = mpsc::channel(8);
        let mut sub = Subscription::new(rx, Arc::new(AtomicBool::new(false)));
        tx.send(MailboxEvent::NewMessages).await.unwrap();
        tx.send(MailboxEvent::NewMessages).await.unwrap();
        assert_eq!(sub.drain_pending(), Ok(2));
        assert_eq!(sub.drain_pending(), Ok(0));

        tx.send(MailboxEvent::NewMessages).await.unwrap();
        tx.send(MailboxEvent::Closed).await.unwrap();
        assert_eq!(sub.drain_pending(), Err(MailboxEvent::Closed));
    }
}
