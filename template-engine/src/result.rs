//! Records and reports produced by an execution

use crate::codec;
use crate::dsl::value_to_string;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

fn as_text<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&codec::from_bytes(bytes.to_vec()))
}

/// One request/response pair of a sequence
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExchangeRecord {
    /// 1-based position inside the sequence
    pub index: usize,
    pub url: String,
    pub is_https: bool,
    #[serde(serialize_with = "as_text")]
    pub request: Vec<u8>,
    /// Empty when the transport failed
    #[serde(serialize_with = "as_text")]
    pub response: Vec<u8>,
    /// Seconds spent waiting for the response
    pub duration: f64,
    pub error: Option<String>,
    pub matched: bool,
}

impl ExchangeRecord {
    pub fn has_response(&self) -> bool {
        !self.response.is_empty()
    }
}

/// Values extracted under one name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtractedValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ExtractedValue {
    /// Collapse a result list: nothing for none, a scalar for one, a list otherwise
    pub fn collapse(mut values: Vec<String>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => values.pop().map(ExtractedValue::Single),
            _ => Some(ExtractedValue::Multiple(values)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ExtractedValue::Single(s) => Value::String(s.clone()),
            ExtractedValue::Multiple(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }

    pub fn values(&self) -> Vec<String> {
        match self {
            ExtractedValue::Single(s) => vec![s.clone()],
            ExtractedValue::Multiple(items) => items.clone(),
        }
    }
}

impl std::fmt::Display for ExtractedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&value_to_string(&self.to_value()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceKind {
    Http,
    Network,
}

/// Outcome of one request sequence, delivered to the result callback
#[derive(Debug, Clone, Serialize)]
pub struct SequenceReport {
    pub template_id: String,
    pub target: String,
    pub sequence_index: usize,
    pub kind: SequenceKind,
    pub responses: Vec<ExchangeRecord>,
    pub matched: bool,
    pub extracted: IndexMap<String, ExtractedValue>,
    pub cancelled: bool,
    /// Set when the sequence was cut short by an internal fault
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one template against one target
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSummary {
    pub template_id: String,
    pub target: String,
    pub matched: bool,
    pub sequences: usize,
    pub requests_sent: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}
