//! Connection lifecycle tests against the stub mailbox.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};

use mail_intake::attachments::AttachmentPipeline;
use mail_intake::auth::{StaticTokenSource, TokenSource};
use mail_intake::bundle::BundleStore;
use mail_intake::mailbox::{
    ConnectionManager, ConnectionState, MailboxEvent, reset_mailbox, spawn_connection_manager,
};
use mail_intake::pipeline::MessageProcessor;
use mail_intake::worker::TaskSubmitter;

use support::{
    RecordingSubmitter, StallingSubmitter, StubMailbox, StubMessage, TEST_TIMEOUT, eventually,
};

const RECONNECT_DELAY: Duration = Duration::from_millis(20);

struct Harness {
    mailbox: StubMailbox,
    tokens: Arc<StaticTokenSource>,
    submitter: Arc<RecordingSubmitter>,
    manager: Arc<ConnectionManager>,
    _tmp: TempDir,
}

fn manager(
    mailbox: &StubMailbox,
    tokens: Arc<StaticTokenSource>,
    submitter: Arc<dyn TaskSubmitter>,
    root: &std::path::Path,
    reconnect_delay: Duration,
) -> Arc<ConnectionManager> {
    let processor = Arc::new(MessageProcessor::new(
        BundleStore::new(root),
        Arc::new(AttachmentPipeline::empty()),
        submitter,
        Duration::from_secs(1),
    ));
    Arc::new(ConnectionManager::new(
        Arc::new(mailbox.clone()),
        tokens,
        processor,
        reconnect_delay,
    ))
}

fn harness(mailbox: StubMailbox, reconnect_delay: Duration) -> Harness {
    let tmp = TempDir::new().unwrap();
    let tokens = Arc::new(StaticTokenSource::new("token-1"));
    let submitter = Arc::new(RecordingSubmitter::default());
    let manager = manager(&mailbox, tokens.clone(), submitter.clone(), tmp.path(), reconnect_delay);
    Harness {
        mailbox,
        tokens,
        submitter,
        manager,
        _tmp: tmp,
    }
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    timeout(TEST_TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

fn message(subject: &str) -> StubMessage {
    StubMessage::new(subject, "", vec![])
}

#[tokio::test]
async fn backlog_is_scanned_before_listening() {
    let h = harness(
        StubMailbox::with_messages([(1, message("a")), (2, message("b"))]),
        RECONNECT_DELAY,
    );
    let mut state = h.manager.state();
    let (handle, shutdown) = spawn_connection_manager(h.manager.clone());

    wait_for_state(&mut state, ConnectionState::Listening).await;
    assert_eq!(h.mailbox.acked(), vec![1, 2]);
    let submitter = h.submitter.clone();
    eventually("both bundles submitted", || submitter.count() == 2).await;

    shutdown.send(true).unwrap();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn new_message_event_triggers_scan() {
    let h = harness(StubMailbox::default(), RECONNECT_DELAY);
    let mut state = h.manager.state();
    let (_handle, shutdown) = spawn_connection_manager(h.manager.clone());
    wait_for_state(&mut state, ConnectionState::Listening).await;

    h.mailbox.add(5, message("fresh"));
    h.mailbox.push(MailboxEvent::NewMessages);

    let mailbox = h.mailbox.clone();
    eventually("message 5 acknowledged", || mailbox.acked() == vec![5]).await;
    let submitter = h.submitter.clone();
    eventually("bundle 5 submitted", || submitter.count() == 1).await;
    // The idling connection stays up.
    assert_eq!(h.mailbox.live_subscriptions(), 1);
    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn connect_failures_retry_after_delay() {
    let mailbox = StubMailbox::with_messages([(1, message("a"))]);
    mailbox.fail_next_connects(2);
    let h = harness(mailbox, RECONNECT_DELAY);
    let mut state = h.manager.state();
    let (_handle, shutdown) = spawn_connection_manager(h.manager.clone());

    wait_for_state(&mut state, ConnectionState::Listening).await;
    assert_eq!(h.mailbox.connects(), 3);
    assert_eq!(h.mailbox.acked(), vec![1]);
    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn closed_connection_reconnects() {
    let h = harness(StubMailbox::default(), RECONNECT_DELAY);
    let mut state = h.manager.state();
    let (_handle, shutdown) = spawn_connection_manager(h.manager.clone());
    wait_for_state(&mut state, ConnectionState::Listening).await;

    h.mailbox.push(MailboxEvent::Closed);
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    wait_for_state(&mut state, ConnectionState::Listening).await;

    assert_eq!(h.mailbox.connects(), 2);
    assert_eq!(h.mailbox.live_subscriptions(), 1);
    assert_eq!(h.mailbox.stopped_subscriptions(), 1);
    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn credential_refresh_restarts_with_new_token() {
    // A long reconnect delay proves the restart does not wait for it.
    let h = harness(StubMailbox::default(), Duration::from_secs(60));
    let mut state = h.manager.state();
    let (_handle, shutdown) = spawn_connection_manager(h.manager.clone());
    wait_for_state(&mut state, ConnectionState::Listening).await;

    h.tokens.rotate("token-2").await;

    let mailbox = h.mailbox.clone();
    eventually("reconnect with new token", || mailbox.connects() == 2).await;
    wait_for_state(&mut state, ConnectionState::Listening).await;

    assert_eq!(h.mailbox.connect_tokens(), vec!["token-1", "token-2"]);
    assert_eq!(h.mailbox.stopped_subscriptions(), 1);
    assert_eq!(h.mailbox.live_subscriptions(), 1);
    assert_eq!(*h.tokens.subscribe().borrow(), 1);
    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn credential_refresh_does_not_wait_for_worker_admission() {
    let tmp = TempDir::new().unwrap();
    let mailbox = StubMailbox::with_messages([(1, message("a"))]);
    let tokens = Arc::new(StaticTokenSource::new("token-1"));
    let submitter = Arc::new(StallingSubmitter::new(Duration::from_secs(3)));
    let manager = manager(&mailbox, tokens.clone(), submitter.clone(), tmp.path(), Duration::from_secs(60));
    let mut state = manager.state();
    let (_handle, shutdown) = spawn_connection_manager(manager);

    // The hand-off is still pending when the backlog scan ends.
    wait_for_state(&mut state, ConnectionState::Listening).await;
    assert_eq!(mailbox.acked(), vec![1]);
    assert_eq!(submitter.admitted.load(std::sync::atomic::Ordering::SeqCst), 0);

    let rotated = Instant::now();
    tokens.rotate("token-2").await;
    let watched = mailbox.clone();
    eventually("reconnect with new token", || watched.connects() == 2).await;
    assert!(rotated.elapsed() < Duration::from_millis(500), "took {:?}", rotated.elapsed());
    assert_eq!(mailbox.connect_tokens(), vec!["token-1", "token-2"]);
    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn credential_refresh_interrupts_a_running_scan() {
    let tmp = TempDir::new().unwrap();
    let mailbox = StubMailbox::with_messages([(1, message("a"))]);
    mailbox.delay_fetches(Duration::from_secs(3));
    let tokens = Arc::new(StaticTokenSource::new("token-1"));
    let submitter = Arc::new(RecordingSubmitter::default());
    let manager = manager(&mailbox, tokens.clone(), submitter, tmp.path(), Duration::from_secs(60));
    let (handle, shutdown) = spawn_connection_manager(manager);

    let watched = mailbox.clone();
    eventually("first connect", || watched.connects() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rotated = Instant::now();
    tokens.rotate("token-2").await;
    eventually("reconnect with new token", || watched.connects() == 2).await;
    assert!(rotated.elapsed() < Duration::from_millis(500), "took {:?}", rotated.elapsed());
    // The interrupted scan never acknowledged anything.
    assert!(mailbox.acked().is_empty());

    // Shutdown also cuts the rescan short.
    let stopping = Instant::now();
    shutdown.send(true).unwrap();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(stopping.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn reset_marks_everything_unconsumed_and_clears_bundles() {
    let tmp = TempDir::new().unwrap();
    let store = BundleStore::new(tmp.path().join("bundles"));
    store.ensure_root().await.unwrap();
    std::fs::create_dir_all(store.dir_for(1)).unwrap();

    let mailbox = StubMailbox::with_messages([(1, message("a")), (2, message("b"))]);
    {
        let mut session = mailbox.session();
        session.acknowledge(1).await.unwrap();
        session.acknowledge(2).await.unwrap();
        assert!(session.list_unconsumed().await.unwrap().is_empty());
    }

    let tokens = StaticTokenSource::new("token-1");
    let count = reset_mailbox(&mailbox, &tokens, &store).await.unwrap();
    assert_eq!(count, 2);
    assert!(!store.root().exists());

    let mut session = mailbox.session();
    assert_eq!(session.list_unconsumed().await.unwrap().len(), 2);
}
