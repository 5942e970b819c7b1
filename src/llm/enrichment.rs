//! OpenAI enrichment client.
//!
//! Sends the aggregate record through rig's OpenAI provider with a
//! `json_schema` structured-output format and parses the offer out of the
//! reply. Under structured output a reply that is not a JSON object is the
//! model's refusal, which is a normal outcome, not an error.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rig::client::CompletionClient;
use rig::completion::{AssistantContent, CompletionError, CompletionModel};
use rig::providers::openai;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::offer::{OfferRecord, offer_schema};
use super::{EnrichOutcome, Enricher};
use crate::bundle::AggregateRecord;
use crate::config::{env_or, env_required};
use crate::error::{ConfigError, ServiceError};

const SERVICE: &str = "enrichment";

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-2024-08-06";

/// Name of the structured-output format sent with every request.
const SCHEMA_NAME: &str = "offerSummary";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const SYSTEM_PROMPT: &str = "\
You extract structured summaries from commercial offers received by email.

Rules:
1. Use only information stated explicitly in the input.
2. Leave a field out when the input does not state it. Never guess.
3. Do not move data between fields; fill each field only with data meant for it.
4. For numeric ranges such as length or thickness, use a two-element array [min, max]. \
Use a single number when only one value is given.
5. Write every numeric value as a number, never as a string.
6. If the supplier is not named, infer it from the sender's mail domain.
7. Dimensions are in millimetres. `material` is the commodity (for example cold-rolled steel), \
`grade` is the steel grade (for example HC220), `price` is the unit price of that product.
8. In offerDetails, `deliveryTerms` are incoterms such as CIP or DDP with a place, \
`paymentTerms` are the payment conditions as written.";

/// Enrichment endpoint settings.
#[derive(Debug)]
pub struct EnrichmentConfig {
    pub api_base: String,
    pub api_key: SecretString,
    pub model: String,
}

impl EnrichmentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: env_or("INTAKE_LLM_API_BASE", DEFAULT_API_BASE),
            api_key: SecretString::from(env_required("INTAKE_LLM_API_KEY")?),
            model: env_or("INTAKE_LLM_MODEL", DEFAULT_MODEL),
        })
    }
}

/// Enricher backed by the OpenAI API (or a compatible proxy at `api_base`).
pub struct OpenAiEnricher {
    client: rig::client::Client<openai::client::OpenAIResponsesExt>,
    model: String,
}

impl OpenAiEnricher {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, ConfigError> {
        let client = openai::Client::builder()
            .api_key(config.api_key.expose_secret())
            .base_url(config.api_base.trim_end_matches('/'))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "INTAKE_LLM_API_BASE".into(),
                message: format!("failed to create OpenAI client: {e}"),
            })?;
        info!(model = %config.model, api_base = %config.api_base, "Using OpenAI for enrichment");
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }
}

/// Structured-output format attached to every request.
fn response_format() -> Value {
    json!({
        "text": {
            "format": {
                "type": "json_schema",
                "name": SCHEMA_NAME,
                "schema": offer_schema(),
            }
        }
    })
}

/// The user turn: subject, body, attachment names and extracted attachment data.
fn user_prompt(record: &AggregateRecord) -> String {
    let names = record
        .metadata
        .attachments
        .iter()
        .map(|a| a.filename.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let data = serde_json::to_string_pretty(&record.attachments).unwrap_or_else(|_| "[]".into());

    format!(
        "Summarize the following offer.\n\n\
         Email subject: {}\n\
         Email body: {}\n\
         Attachments: {}\n\n\
         Attachment data (if any):\n{}\n\n\
         Produce a structured offer summary following the schema, using all available information.",
        record.subject, record.body, names, data
    )
}

fn invalid(reason: impl Into<String>) -> ServiceError {
    ServiceError::InvalidResponse {
        service: SERVICE.into(),
        reason: reason.into(),
    }
}

/// Strip a Markdown code fence some proxies wrap around JSON.
fn strip_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Turn the model's reply into an outcome: parsed offer, or its refusal.
fn parse_reply(reply: &str) -> Result<EnrichOutcome, ServiceError> {
    let content = strip_fence(reply);
    if content.is_empty() {
        return Err(invalid("completion has neither content nor refusal"));
    }
    if !content.starts_with('{') {
        return Ok(EnrichOutcome::Refused(content.to_string()));
    }
    let offer: OfferRecord = serde_json::from_str(content)
        .map_err(|e| invalid(format!("offer does not match schema: {e}")))?;
    Ok(EnrichOutcome::Offer(offer.cleaned()))
}

static STATUS_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)status(?:\s+code)?\D{0,3}([1-5]\d\d)\b").expect("status pattern is valid")
});

/// Provider messages that mean "try again later".
const TRANSIENT_HINTS: &[&str] = &[
    "timed out",
    "timeout",
    "connection",
    "connect error",
    "rate limit",
    "rate_limit",
    "overloaded",
    "server_error",
    "temporarily",
];

/// Classify a rig completion error by the status or wording it carries.
fn classify_error(err: CompletionError) -> ServiceError {
    let reason = err.to_string();
    match err {
        CompletionError::JsonError(_) | CompletionError::ResponseError(_) => invalid(reason),
        _ => {
            if let Some(status) = STATUS_CODE
                .captures(&reason)
                .and_then(|c| c[1].parse::<u16>().ok())
            {
                return ServiceError::from_status(SERVICE, status, reason);
            }
            let lower = reason.to_ascii_lowercase();
            if TRANSIENT_HINTS.iter().any(|hint| lower.contains(hint)) {
                ServiceError::Transient {
                    service: SERVICE.into(),
                    status: None,
                    reason,
                }
            } else {
                ServiceError::Fatal {
                    service: SERVICE.into(),
                    status: None,
                    reason,
                }
            }
        }
    }
}

#[async_trait]
impl Enricher for OpenAiEnricher {
    async fn enrich(&self, record: &AggregateRecord) -> Result<EnrichOutcome, ServiceError> {
        debug!(uid = record.uid, model = %self.model, "Requesting offer summary");

        let request = self
            .client
            .completion_model(&self.model)
            .completion_request(user_prompt(record))
            .preamble(SYSTEM_PROMPT.to_string())
            .temperature(0.0)
            .additional_params(response_format())
            .send();
        let response = tokio::time::timeout(REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| ServiceError::Transient {
                service: SERVICE.into(),
                status: None,
                reason: format!("no reply within {REQUEST_TIMEOUT:?}"),
            })?
            .map_err(classify_error)?;

        info!(
            uid = record.uid,
            total_tokens = response.usage.total_tokens,
            prompt_tokens = response.usage.input_tokens,
            completion_tokens = response.usage.output_tokens,
            "Enrichment token usage"
        );

        let reply: String = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect();

        let outcome = parse_reply(&reply)?;
        if let EnrichOutcome::Refused(reason) = &outcome {
            warn!(uid = record.uid, %reason, "Model refused to summarize offer");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{AttachmentSummary, BundleMetadata, ContentSummary};

    #[test]
    fn parses_structured_content() {
        let reply = r#"{"supplier": {"name": " Acme Steel "}, "products": [{"thickness": [0.5, 0.8]}]}"#;
        match parse_reply(reply).unwrap() {
            EnrichOutcome::Offer(offer) => {
                assert_eq!(offer.supplier_name(), Some("Acme Steel"));
                assert_eq!(offer.products.len(), 1);
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[test]
    fn fenced_json_is_accepted() {
        let reply = "```json\n{\"supplier\": {\"name\": \"Acme\"}}\n```";
        assert!(matches!(parse_reply(reply).unwrap(), EnrichOutcome::Offer(_)));
    }

    #[test]
    fn refusal_is_an_outcome() {
        let outcome = parse_reply("I can't help with that.").unwrap();
        assert_eq!(outcome, EnrichOutcome::Refused("I can't help with that.".into()));
    }

    #[test]
    fn malformed_content_is_permanent() {
        let err = parse_reply("{\"products\": \"none\"").unwrap_err();
        assert!(err.class().is_permanent());
    }

    #[test]
    fn empty_reply_rejected() {
        let err = parse_reply("  ").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidResponse { .. }));
    }

    #[test]
    fn provider_errors_are_classified() {
        let limited = classify_error(CompletionError::ProviderError(
            "Rate limit reached for gpt-4o, status code 429".into(),
        ));
        assert!(matches!(limited, ServiceError::Transient { status: Some(429), .. }), "{limited:?}");

        let overloaded = classify_error(CompletionError::ProviderError("The server is overloaded".into()));
        assert!(matches!(overloaded, ServiceError::Transient { status: None, .. }), "{overloaded:?}");

        let auth = classify_error(CompletionError::ProviderError("Incorrect API key provided".into()));
        assert!(auth.class().is_permanent());

        let garbled = classify_error(CompletionError::ResponseError("missing output".into()));
        assert!(matches!(garbled, ServiceError::InvalidResponse { .. }));
    }

    #[test]
    fn request_format_carries_schema() {
        let format = response_format();
        assert_eq!(format["text"]["format"]["type"], "json_schema");
        assert_eq!(format["text"]["format"]["name"], SCHEMA_NAME);
        assert_eq!(format["text"]["format"]["schema"], offer_schema());
    }

    #[test]
    fn client_builds_for_custom_base() {
        let enricher = OpenAiEnricher::new(&EnrichmentConfig {
            api_base: "http://localhost:9/v1/".into(),
            api_key: SecretString::from("sk-test"),
            model: "test-model".into(),
        })
        .unwrap();
        assert_eq!(enricher.model, "test-model");
    }

    #[test]
    fn prompt_carries_subject_and_attachments() {
        let record = AggregateRecord {
            uid: 7,
            message_id: None,
            subject: "Offer 12/2024".into(),
            body: "Please see attached.".into(),
            metadata: BundleMetadata {
                uid: 7,
                message_id: None,
                from: None,
                date: None,
                content: ContentSummary::new("Offer 12/2024", "Please see attached."),
                attachments: vec![AttachmentSummary {
                    filename: "offer.pdf".into(),
                    mime_type: "application/pdf".into(),
                    extension: Some("pdf".into()),
                    allowed: true,
                    size: 10,
                }],
            },
            attachments: vec![],
        };

        let user = user_prompt(&record);
        assert!(user.contains("Offer 12/2024"));
        assert!(user.contains("offer.pdf"));
    }
}
