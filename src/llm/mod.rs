//! Enrichment collaborator.
//!
//! An [`Enricher`] turns a bundle's aggregate record into a structured
//! [`OfferRecord`], or reports that the model refused. [`OpenAiEnricher`]
//! talks to OpenAI through rig-core.

pub mod enrichment;
pub mod offer;

use async_trait::async_trait;

pub use enrichment::{EnrichmentConfig, OpenAiEnricher};
pub use offer::{Dimension, OfferRecord, Product, offer_schema};

use crate::bundle::AggregateRecord;
use crate::error::ServiceError;

/// Result of a successful enrichment call.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichOutcome {
    Offer(OfferRecord),
    /// The model declined; the reason is its refusal text.
    Refused(String),
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, record: &AggregateRecord) -> Result<EnrichOutcome, ServiceError>;
}
