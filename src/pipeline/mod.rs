//! Per-message processing.
//!
//! [`MessageProcessor`] turns each unconsumed message into a complete
//! bundle, acknowledges it when every stage succeeded, and submits it to the
//! worker side.

pub mod processor;

pub use processor::{MessageOutcome, MessageProcessor, ScanReport};
