//! Connection lifecycle.
//!
//! `Disconnected → Connecting → Listening → Disconnected`, looping with a
//! fixed delay after errors. A credential refresh restarts the cycle
//! immediately from any state, tearing the live connection down first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Mailbox, MailboxEvent};
use crate::auth::TokenSource;
use crate::error::MailboxError;
use crate::pipeline::MessageProcessor;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Listening,
}

impl ConnectionState {
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Listening)
                | (Connecting, Disconnected)
                | (Listening, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
        };
        write!(f, "{s}")
    }
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    CredentialRefreshed,
    Failed(MailboxError),
}

/// Owns the mailbox connection and feeds the message processor.
pub struct ConnectionManager {
    mailbox: Arc<dyn Mailbox>,
    tokens: Arc<dyn TokenSource>,
    processor: Arc<MessageProcessor>,
    reconnect_delay: Duration,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        tokens: Arc<dyn TokenSource>,
        processor: Arc<MessageProcessor>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            mailbox,
            tokens,
            processor,
            reconnect_delay,
            state,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn transition(&self, to: ConnectionState) {
        let from = *self.state.borrow();
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(%from, %to, "Unexpected connection state transition");
        }
        info!(%from, %to, "Connection state changed");
        self.state.send_replace(to);
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut token_rx = self.tokens.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.transition(ConnectionState::Connecting);
            token_rx.borrow_and_update();
            let end = self.session(&mut token_rx, &mut shutdown).await;
            self.transition(ConnectionState::Disconnected);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::CredentialRefreshed => {
                    info!("Credentials refreshed, restarting connection");
                }
                SessionEnd::Failed(e) => {
                    error!(
                        error = %e,
                        class = %e.class(),
                        delay_secs = self.reconnect_delay.as_secs(),
                        "Connection failed, reconnecting after delay"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                        changed = token_rx.changed() => {
                            if changed.is_ok() {
                                info!("Credentials refreshed during reconnect delay");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }

    /// Connect, scan the backlog, then listen until something ends the session.
    async fn session(
        &self,
        token_rx: &mut watch::Receiver<u64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let connected = tokio::select! {
            r = self.mailbox.connect(self.tokens.as_ref()) => r,
            _ = token_rx.changed() => return SessionEnd::CredentialRefreshed,
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        };
        let mut session = match connected {
            Ok(s) => s,
            Err(e) => return SessionEnd::Failed(e),
        };
        // Connecting may itself have refreshed the token.
        token_rx.borrow_and_update();

        let scanned = interruptible(
            self.processor.process_backlog(session.as_mut()),
            token_rx,
            shutdown,
        )
        .await;
        match scanned {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                session.close().await;
                return SessionEnd::Failed(e);
            }
            Err(end) => {
                session.close().await;
                return end;
            }
        }

        let mut subscription = match session.subscribe().await {
            Ok(sub) => sub,
            Err(e) => return SessionEnd::Failed(e),
        };
        self.transition(ConnectionState::Listening);

        loop {
            tokio::select! {
                event = subscription.next() => match event {
                    Some(MailboxEvent::NewMessages) => {
                        debug!("New message event");
                        if let Err(end) = self.scan_fresh(token_rx, shutdown).await {
                            return end;
                        }
                        // Events that arrived during the scan fold into one more pass.
                        match subscription.drain_pending() {
                            Ok(0) => {}
                            Ok(n) => {
                                debug!(coalesced = n, "Running follow-up scan");
                                if let Err(end) = self.scan_fresh(token_rx, shutdown).await {
                                    return end;
                                }
                            }
                            Err(MailboxEvent::Error(reason)) => {
                                return SessionEnd::Failed(MailboxError::Protocol(reason));
                            }
                            Err(_) => return SessionEnd::Failed(MailboxError::Closed),
                        }
                    }
                    Some(MailboxEvent::Error(reason)) => {
                        return SessionEnd::Failed(MailboxError::Protocol(reason));
                    }
                    Some(MailboxEvent::Closed) | None => {
                        return SessionEnd::Failed(MailboxError::Closed);
                    }
                },
                _ = token_rx.changed() => return SessionEnd::CredentialRefreshed,
                _ = shutdown.changed() => return SessionEnd::Shutdown,
            }
        }
    }

    /// Backlog scan on a fresh connection, leaving the idling one alone.
    /// A credential refresh or shutdown abandons the scan.
    async fn scan_fresh(
        &self,
        token_rx: &mut watch::Receiver<u64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionEnd> {
        let scan = async {
            let mut session = self.mailbox.connect(self.tokens.as_ref()).await?;
            let result = self.processor.process_backlog(session.as_mut()).await;
            session.close().await;
            result.map(|_| ())
        };
        match interruptible(scan, token_rx, shutdown).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionEnd::Failed(e)),
            Err(end) => Err(end),
        }
    }
}

/// Run `work` unless the credentials change or shutdown is requested first,
/// in which case `work` is dropped.
async fn interruptible<F: Future>(
    work: F,
    token_rx: &mut watch::Receiver<u64>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<F::Output, SessionEnd> {
    tokio::select! {
        out = work => Ok(out),
        _ = token_rx.changed() => Err(SessionEnd::CredentialRefreshed),
        _ = shutdown.changed() => Err(SessionEnd::Shutdown),
    }
}

/// Spawn the connection manager. Send `true` on the returned sender to stop it.
pub fn spawn_connection_manager(
    manager: Arc<ConnectionManager>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        manager.run(shutdown_rx).await;
    });
    (handle, shutdown_tx)
}
