//! Mail intake: mailbox watcher, attachment extraction pipeline, and
//! bounded enrichment workers.

pub mod attachments;
pub mod auth;
pub mod bundle;
pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod worker;
