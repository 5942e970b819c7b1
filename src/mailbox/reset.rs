//! Mailbox reset: reprocess everything from scratch.

use tracing::info;

use super::Mailbox;
use crate::auth::TokenSource;
use crate::bundle::BundleStore;
use crate::error::Error;

/// Mark every message in the watched folder unconsumed and delete all
/// bundles. Returns the number of messages reset.
pub async fn reset_mailbox(
    mailbox: &dyn Mailbox,
    tokens: &dyn TokenSource,
    store: &BundleStore,
) -> Result<usize, Error> {
    let mut session = mailbox.connect(tokens).await?;
    let result = session.reset_consumed().await;
    session.close().await;
    let count = result?;
    info!(count, "Messages marked unconsumed");

    store.remove_all().await?;
    info!(root = %store.root().display(), "Bundle directory removed");
    Ok(count)
}
