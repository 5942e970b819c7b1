//! Google Sheets sink.
//!
//! Each offer gets its own sheet, named after the supplier and duplicated
//! from a template when one is configured. The summary row lands at `A2`
//! and the product table below it.
//!
//! A commit that fails after its sheet was created remembers the sheet, so
//! the retry writes into it instead of creating another one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::Url;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{CommitAck, CommitSink};
use crate::auth::TokenSource;
use crate::error::ServiceError;
use crate::llm::{Dimension, OfferRecord};

const SERVICE: &str = "sheets";

pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

const FALLBACK_SHEET_NAME: &str = "New Offer";
const MISSING: &str = "N/A";

/// Blank rows between the summary row and the product table, matching the
/// template layout.
const SUMMARY_GAP_ROWS: usize = 5;

#[derive(Debug, Deserialize)]
struct SpreadsheetSheets {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

pub struct SheetsSink {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    api_base: String,
    spreadsheet_id: String,
    template_sheet_id: Option<i64>,
    /// Serialized offer to the sheet created for it, until its rows land.
    created: Mutex<HashMap<String, String>>,
}

impl SheetsSink {
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        spreadsheet_id: impl Into<String>,
        template_sheet_id: Option<i64>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens,
            api_base: DEFAULT_API_BASE.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            template_sheet_id,
            created: Mutex::new(HashMap::new()),
        }
    }

    /// Point at a different API root (tests, proxies).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = Url::parse(&self.api_base).map_err(|e| invalid(format!("bad API base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| invalid("API base cannot carry a path".into()))?
            .extend(segments);
        Ok(url)
    }

    async fn existing_titles(&self, token: &str) -> Result<Vec<String>, ServiceError> {
        let mut url = self.url(&[&self.spreadsheet_id])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties.title");

        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(SERVICE, &e))?;
        let resp = check(resp).await?;
        let body: SpreadsheetSheets = resp
            .json()
            .await
            .map_err(|e| invalid(e.to_string()))?;
        Ok(body.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn create_sheet(&self, token: &str, name: &str) -> Result<(), ServiceError> {
        let request = match self.template_sheet_id {
            Some(source) => json!({
                "duplicateSheet": {
                    "sourceSheetId": source,
                    "insertSheetIndex": 1,
                    "newSheetName": name,
                }
            }),
            None => json!({"addSheet": {"properties": {"title": name, "index": 1}}}),
        };

        let resp = self
            .client
            .post(self.url(&[&format!("{}:batchUpdate", self.spreadsheet_id)])?)
            .bearer_auth(token)
            .json(&json!({"requests": [request]}))
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(SERVICE, &e))?;
        check(resp).await?;
        Ok(())
    }

    async fn write_rows(&self, token: &str, name: &str, rows: Vec<Vec<Value>>) -> Result<(), ServiceError> {
        let range = format!("{}!A2", quote_sheet_name(name));
        let mut url = self.url(&[&self.spreadsheet_id, "values", &range])?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");

        let resp = self
            .client
            .put(url)
            .bearer_auth(token)
            .json(&json!({"range": range, "values": rows}))
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(SERVICE, &e))?;
        check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl CommitSink for SheetsSink {
    async fn commit(&self, offer: &OfferRecord) -> Result<CommitAck, ServiceError> {
        // Re-read on every call; the refresher may have rotated it.
        let token = self.tokens.access_token().await?;
        let token = token.expose_secret();

        let key = serde_json::to_string(offer).map_err(|e| invalid(e.to_string()))?;
        let existing = self.existing_titles(token).await?;
        let earlier = self
            .created_sheets()
            .get(&key)
            .filter(|name| existing.contains(name))
            .cloned();

        let name = match earlier {
            Some(name) => {
                debug!(sheet = %name, "Reusing sheet from an earlier attempt");
                name
            }
            None => {
                let name = unique_sheet_name(&existing, offer.supplier_name());
                debug!(sheet = %name, "Creating sheet");
                self.create_sheet(token, &name).await?;
                self.created_sheets().insert(key.clone(), name.clone());
                name
            }
        };

        if offer.products.is_empty() {
            warn!(sheet = %name, "Offer has no products");
        }
        self.write_rows(token, &name, offer_rows(offer)).await?;
        self.created_sheets().remove(&key);

        info!(sheet = %name, products = offer.products.len(), "Offer written to sheet");
        Ok(CommitAck { location: name })
    }
}

impl SheetsSink {
    fn created_sheets(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.created.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn invalid(reason: String) -> ServiceError {
    ServiceError::InvalidResponse {
        service: SERVICE.into(),
        reason,
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ServiceError::from_status(SERVICE, status.as_u16(), body))
}

/// `base`, or `"<base> - Copy <n>"` with the smallest free `n`.
pub fn unique_sheet_name(existing: &[String], base: Option<&str>) -> String {
    let base = base
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(FALLBACK_SHEET_NAME);
    let taken = |name: &str| existing.iter().any(|e| e == name);

    if !taken(base) {
        return base.to_string();
    }
    (1u32..)
        .map(|n| format!("{base} - Copy {n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| format!("{base} - Copy"))
}

/// A1-notation sheet reference, quoted.
fn quote_sheet_name(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

fn text_cell(value: Option<&str>) -> Value {
    Value::from(value.unwrap_or(MISSING))
}

fn number_cell(value: Option<f64>) -> Value {
    value.map(Value::from).unwrap_or_else(|| Value::from(MISSING))
}

fn dimension_cell(value: Option<Dimension>) -> Value {
    match value {
        Some(Dimension::Single(v)) => Value::from(v),
        Some(range) => Value::from(range.to_string()),
        None => Value::from(MISSING),
    }
}

/// Cell values written from `A2`: the summary row, a gap, then one row per
/// product. Columns the offer schema does not carry (paint coating,
/// manufacturer) are `N/A`.
pub fn offer_rows(offer: &OfferRecord) -> Vec<Vec<Value>> {
    let details = offer.offer_details.clone().unwrap_or_default();
    let mut rows = vec![vec![
        text_cell(offer.supplier_name()),
        text_cell(details.currency.as_deref()),
        text_cell(details.delivery_terms.as_deref()),
        text_cell(details.delivery_date.as_deref()),
        text_cell(details.payment_terms.as_deref()),
    ]];
    rows.extend(std::iter::repeat_n(Vec::new(), SUMMARY_GAP_ROWS));

    for product in &offer.products {
        rows.push(vec![
            text_cell(product.material.as_deref()),
            dimension_cell(product.thickness),
            dimension_cell(product.width),
            text_cell(product.grade.as_deref()),
            text_cell(product.surface.as_deref()),
            text_cell(None),
            text_cell(None),
            number_cell(product.price),
        ]);
    }
    rows
}
