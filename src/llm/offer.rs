//! Structured offer record produced by enrichment.
//!
//! Every field is optional: the model fills only what the message states
//! explicitly. Numeric dimensions may be a single value or a `[min, max]`
//! range.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<Customer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<Supplier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_details: Option<OfferDetails>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<Product>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_terms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_terms: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_offered: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thickness: Option<Dimension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<Dimension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<Dimension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

/// A measurement in millimetres: one value, or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    Single(f64),
    Range([f64; 2]),
}

impl Dimension {
    fn is_finite(&self) -> bool {
        match self {
            Self::Single(v) => v.is_finite(),
            Self::Range([lo, hi]) => lo.is_finite() && hi.is_finite(),
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(v) => write!(f, "{v}"),
            Self::Range([lo, hi]) => write!(f, "{lo}-{hi}"),
        }
    }
}

fn text(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn number(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn dimension(value: Option<Dimension>) -> Option<Dimension> {
    value.filter(Dimension::is_finite)
}

/// `None` when every field of the cleaned struct is empty.
fn non_empty<T: Default + PartialEq>(value: T) -> Option<T> {
    (value != T::default()).then_some(value)
}

impl OfferRecord {
    /// Trim strings, drop blank strings and non-finite numbers, and collapse
    /// sections left empty.
    pub fn cleaned(self) -> Self {
        Self {
            offer_number: text(self.offer_number),
            offer_date: text(self.offer_date),
            customer: self.customer.and_then(|c| {
                non_empty(Customer {
                    name: text(c.name),
                    location: text(c.location),
                })
            }),
            supplier: self.supplier.and_then(|s| {
                non_empty(Supplier {
                    name: text(s.name),
                    contact: s.contact.and_then(|c| {
                        non_empty(Contact {
                            name: text(c.name),
                            email: text(c.email),
                            phone: text(c.phone),
                        })
                    }),
                })
            }),
            offer_details: self.offer_details.and_then(|d| {
                non_empty(OfferDetails {
                    currency: text(d.currency),
                    delivery_terms: text(d.delivery_terms),
                    delivery_date: text(d.delivery_date),
                    payment_terms: text(d.payment_terms),
                    total_quantity: number(d.total_quantity),
                    period_offered: text(d.period_offered),
                })
            }),
            products: self
                .products
                .into_iter()
                .map(|p| Product {
                    item_number: text(p.item_number),
                    material: text(p.material),
                    grade: text(p.grade),
                    surface: text(p.surface),
                    thickness: dimension(p.thickness),
                    width: dimension(p.width),
                    length: dimension(p.length),
                    quantity: number(p.quantity),
                    price: number(p.price),
                })
                .filter(|p| *p != Product::default())
                .collect(),
        }
    }

    /// Supplier name, if known.
    pub fn supplier_name(&self) -> Option<&str> {
        self.supplier.as_ref()?.name.as_deref()
    }
}

/// JSON schema for the offer record, used as the structured-output format.
pub fn offer_schema() -> Value {
    let string = json!({"type": "string"});
    let number = json!({"type": "number"});
    let dimension = json!({
        "anyOf": [
            {"type": "number"},
            {"type": "array", "items": {"type": "number"}, "minItems": 2, "maxItems": 2}
        ]
    });

    json!({
        "type": "object",
        "properties": {
            "offerNumber": string,
            "offerDate": string,
            "customer": {
                "type": "object",
                "properties": {"name": string, "location": string},
                "additionalProperties": false
            },
            "supplier": {
                "type": "object",
                "properties": {
                    "name": string,
                    "contact": {
                        "type": "object",
                        "properties": {"name": string, "email": string, "phone": string},
                        "additionalProperties": false
                    }
                },
                "additionalProperties": false
            },
            "offerDetails": {
                "type": "object",
                "properties": {
                    "currency": string,
                    "deliveryTerms": string,
                    "deliveryDate": string,
                    "paymentTerms": string,
                    "totalQuantity": number,
                    "periodOffered": string
                },
                "additionalProperties": false
            },
            "products": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "itemNumber": string,
                        "material": string,
                        "grade": string,
                        "surface": string,
                        "thickness": dimension,
                        "width": dimension,
                        "length": dimension,
                        "quantity": number,
                        "price": number
                    },
                    "additionalProperties": false
                }
            }
        },
        "additionalProperties": false
    })
}
