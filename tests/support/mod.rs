//! In-process stand-ins for the external collaborators.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio::time::Instant;

use mail_intake::attachments::{Extracted, Extractor, ExtractorFamily};
use mail_intake::auth::TokenSource;
use mail_intake::bundle::AggregateRecord;
use mail_intake::error::{ExtractError, MailboxError, ServiceError, WorkerError};
use mail_intake::llm::{EnrichOutcome, Enricher, OfferRecord};
use mail_intake::mailbox::{
    Mailbox, MailboxEvent, MailboxSession, MessageContent, MessageRef, PartDescriptor, Subscription,
};
use mail_intake::sink::{CommitAck, CommitSink};
use mail_intake::worker::{TaskSubmitter, WorkerTask};

/// Maximum time any wait in a test may take before the test counts as hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds or [`TEST_TIMEOUT`] passes.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────────

/// One attachment of a stub message.
#[derive(Debug, Clone)]
pub struct StubPart {
    pub filename: &'static str,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl StubPart {
    pub fn new(filename: &'static str, content_type: &'static str, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename,
            content_type,
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StubMessage {
    pub subject: String,
    pub body: String,
    pub parts: Vec<StubPart>,
}

impl StubMessage {
    pub fn new(subject: &str, body: &str, parts: Vec<StubPart>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            parts,
        }
    }
}

#[derive(Default)]
pub struct MailboxState {
    pub messages: BTreeMap<u32, StubMessage>,
    pub seen: HashSet<u32>,
    /// UIDs in acknowledgment order.
    pub acked: Vec<u32>,
    /// Tokens presented on each connect.
    pub connect_tokens: Vec<String>,
    /// Connects still to fail before one succeeds.
    pub failing_connects: usize,
    /// Event senders of live subscriptions, with their stop flags.
    pub subscriptions: Vec<(mpsc::Sender<MailboxEvent>, Arc<AtomicBool>)>,
    /// Added to every `fetch_content` call.
    pub fetch_delay: Duration,
}

/// Shared in-memory mailbox; every session sees the same state.
#[derive(Clone, Default)]
pub struct StubMailbox {
    pub state: Arc<Mutex<MailboxState>>,
}

impl StubMailbox {
    pub fn with_messages(messages: impl IntoIterator<Item = (u32, StubMessage)>) -> Self {
        let mailbox = Self::default();
        mailbox.state.lock().unwrap().messages.extend(messages);
        mailbox
    }

    pub fn add(&self, uid: u32, message: StubMessage) {
        self.state.lock().unwrap().messages.insert(uid, message);
    }

    pub fn acked(&self) -> Vec<u32> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connect_tokens.len()
    }

    pub fn connect_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().connect_tokens.clone()
    }

    pub fn delay_fetches(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = delay;
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().unwrap().failing_connects = n;
    }

    pub fn live_subscriptions(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|(_, stop)| !stop.load(Ordering::Relaxed))
            .count()
    }

    pub fn stopped_subscriptions(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|(_, stop)| stop.load(Ordering::Relaxed))
            .count()
    }

    /// Push an event to every live subscription.
    pub fn push(&self, event: MailboxEvent) {
        let state = self.state.lock().unwrap();
        for (tx, stop) in &state.subscriptions {
            if !stop.load(Ordering::Relaxed) {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    /// A session that bypasses `connect`, for driving the processor directly.
    pub fn session(&self) -> Box<dyn MailboxSession> {
        Box::new(StubSession {
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl Mailbox for StubMailbox {
    async fn connect(&self, tokens: &dyn TokenSource) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let token = tokens.access_token().await?;
        let mut state = self.state.lock().unwrap();
        state.connect_tokens.push(token.expose_secret().to_string());
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(MailboxError::ConnectFailed {
                host: "stub".into(),
                reason: "connection refused".into(),
            });
        }
        Ok(self.session())
    }
}

pub struct StubSession {
    state: Arc<Mutex<MailboxState>>,
}

impl StubSession {
    fn message(&self, uid: u32) -> Result<StubMessage, MailboxError> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(&uid)
            .cloned()
            .ok_or(MailboxError::MessageNotFound { uid })
    }
}

#[async_trait]
impl MailboxSession for StubSession {
    async fn list_unconsumed(&mut self) -> Result<Vec<MessageRef>, MailboxError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .iter()
            .filter(|(uid, _)| !state.seen.contains(uid))
            .map(|(uid, m)| MessageRef {
                uid: *uid,
                message_id: Some(format!("<{uid}@stub>")),
                parts: m
                    .parts
                    .iter()
                    .enumerate()
                    .map(|(index, p)| PartDescriptor {
                        index,
                        section: (index + 1).to_string(),
                        content_type: p.content_type.into(),
                        disposition: Some("attachment".into()),
                        filename: Some(p.filename.into()),
                        encoding: Some("base64".into()),
                        size: p.bytes.len(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn fetch_content(&mut self, message: &MessageRef) -> Result<MessageContent, MailboxError> {
        let delay = self.state.lock().unwrap().fetch_delay;
        tokio::time::sleep(delay).await;
        let m = self.message(message.uid)?;
        Ok(MessageContent {
            subject: m.subject,
            body: m.body,
            from: Some("sales@steel.example".into()),
            date: None,
        })
    }

    async fn fetch_part(&mut self, message: &MessageRef, index: usize) -> Result<Vec<u8>, MailboxError> {
        let m = self.message(message.uid)?;
        m.parts
            .get(index)
            .map(|p| p.bytes.clone())
            .ok_or(MailboxError::PartNotFound {
                uid: message.uid,
                part: index,
            })
    }

    async fn acknowledge(&mut self, uid: u32) -> Result<(), MailboxError> {
        let mut state = self.state.lock().unwrap();
        state.seen.insert(uid);
        state.acked.push(uid);
        Ok(())
    }

    async fn reset_consumed(&mut self) -> Result<usize, MailboxError> {
        let mut state = self.state.lock().unwrap();
        let n = state.seen.len();
        state.seen.clear();
        Ok(n)
    }

    async fn subscribe(self: Box<Self>) -> Result<Subscription, MailboxError> {
        let (tx, rx) = mpsc::channel(16);
        let stop = Arc::new(AtomicBool::new(false));
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .push((tx, Arc::clone(&stop)));
        Ok(Subscription::new(rx, stop))
    }

    async fn close(self: Box<Self>) {}
}

// ── Extraction ──────────────────────────────────────────────────────────

/// Document extractor reading the file as text, one page per form feed.
/// Files containing `CORRUPT` fail.
pub struct PlainDocumentExtractor;

#[async_trait]
impl Extractor for PlainDocumentExtractor {
    fn family(&self) -> ExtractorFamily {
        ExtractorFamily::Document
    }

    async fn extract(&self, path: &Path, _extension: &str) -> Result<Extracted, ExtractError> {
        let text = tokio::fs::read_to_string(path).await?;
        if text.contains("CORRUPT") {
            return Err(ExtractError::Unreadable {
                format: "pdf".into(),
                reason: "broken xref table".into(),
            });
        }
        let pages = text.split('\x0c').count();
        Ok(Extracted {
            content: text,
            metadata: serde_json::json!({ "pages": pages }),
        })
    }
}

// ── Worker side ─────────────────────────────────────────────────────────

/// Records submissions without running anything.
#[derive(Default)]
pub struct RecordingSubmitter {
    pub tasks: Mutex<Vec<WorkerTask>>,
}

impl RecordingSubmitter {
    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskSubmitter for RecordingSubmitter {
    async fn submit(&self, task: WorkerTask) -> Result<(), WorkerError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

/// Submitter whose every submission waits `hold` before it is admitted.
pub struct StallingSubmitter {
    pub hold: Duration,
    pub admitted: AtomicUsize,
}

impl StallingSubmitter {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            admitted: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskSubmitter for StallingSubmitter {
    async fn submit(&self, _task: WorkerTask) -> Result<(), WorkerError> {
        tokio::time::sleep(self.hold).await;
        self.admitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Enricher returning a fixed outcome, optionally holding each call open.
pub struct ScriptedEnricher {
    outcome: EnrichOutcome,
    hold: Duration,
    pub calls: AtomicUsize,
    running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedEnricher {
    pub fn offer(offer: OfferRecord) -> Self {
        Self::new(EnrichOutcome::Offer(offer))
    }

    pub fn refusing(reason: &str) -> Self {
        Self::new(EnrichOutcome::Refused(reason.into()))
    }

    fn new(outcome: EnrichOutcome) -> Self {
        Self {
            outcome,
            hold: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn holding(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }
}

#[async_trait]
impl Enricher for ScriptedEnricher {
    async fn enrich(&self, _record: &AggregateRecord) -> Result<EnrichOutcome, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}

/// Sink that fails with a transient 503 a set number of times, then succeeds.
pub struct FlakySink {
    failures_left: AtomicU32,
    pub calls: Mutex<Vec<Instant>>,
}

impl FlakySink {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CommitSink for FlakySink {
    async fn commit(&self, _offer: &OfferRecord) -> Result<CommitAck, ServiceError> {
        self.calls.lock().unwrap().push(Instant::now());
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ServiceError::from_status("stub-sink", 503, "service unavailable"));
        }
        Ok(CommitAck {
            location: "stub-sheet".into(),
        })
    }
}
