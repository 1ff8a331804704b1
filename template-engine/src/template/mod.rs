//! Parsed detection templates
//!
//! A [`Template`] is built once by the [loader](loader) and is read-only
//! afterwards. Runtime variable updates go into a per-execution copy of
//! [`Template::variables`] owned by the executor.

pub mod loader;

use crate::extractor::Extractor;
use crate::fuzztag::{AttackMode, PayloadSet};
use crate::matcher::Matcher;
use crate::vars::VariableStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Unknown,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Severity::Info,
            "low" => Severity::Low,
            "medium" | "moderate" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Unknown,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Unknown => "unknown",
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Template metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub author: String,
    pub severity: Severity,
    pub description: String,
    pub reference: Vec<String>,
    pub tags: Vec<String>,
    pub cve: Option<String>,
}

/// How a request template was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestForm {
    /// A literal packet from a `raw` list
    Raw,
    /// Built from `method`, one `path` entry, `headers` and `body`
    Path,
}

/// One literal request of a sequence, still containing tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub packet: String,
    pub form: RequestForm,
    pub sni: Option<String>,
    pub timeout: Option<Duration>,
    /// Connect to this host instead of the one named by the packet
    pub override_host: Option<String>,
}

impl RequestTemplate {
    pub fn raw(packet: impl Into<String>) -> Self {
        Self {
            packet: packet.into(),
            form: RequestForm::Raw,
            sni: None,
            timeout: None,
            override_host: None,
        }
    }
}

/// An HTTP request sequence
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSequence {
    pub requests: Vec<RequestTemplate>,
    pub attack_mode: AttackMode,
    pub payloads: PayloadSet,
    pub matcher: Option<Matcher>,
    pub extractors: Vec<Extractor>,
    pub stop_at_first_match: bool,
    /// Match only after every request of the sequence has been sent
    pub after_requested: bool,
    pub cookie_reuse: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub max_size: Option<usize>,
    /// Send packets exactly as rendered, without fixing Content-Length
    pub unsafe_packet: bool,
}

impl Default for RequestSequence {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            attack_mode: AttackMode::Cartesian,
            payloads: PayloadSet::new(),
            matcher: None,
            extractors: Vec::new(),
            stop_at_first_match: false,
            after_requested: false,
            cookie_reuse: false,
            follow_redirects: false,
            max_redirects: 3,
            max_size: None,
            unsafe_packet: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputEncoding {
    #[default]
    Raw,
    Hex,
    Base64,
}

impl InputEncoding {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hex" => InputEncoding::Hex,
            "base64" => InputEncoding::Base64,
            _ => InputEncoding::Raw,
        }
    }
}

/// One write-then-read step of a network sequence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInput {
    pub data: String,
    pub encoding: InputEncoding,
    /// Bytes to read after writing; 0 reads nothing
    pub read: usize,
    /// Store the chunk read by this step as a variable
    pub name: Option<String>,
}

/// A raw TCP conversation
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSequence {
    pub inputs: Vec<NetworkInput>,
    pub hosts: Vec<String>,
    /// Final read after the last input
    pub read_size: usize,
    pub attack_mode: AttackMode,
    pub payloads: PayloadSet,
    pub matcher: Option<Matcher>,
    pub extractors: Vec<Extractor>,
    pub stop_at_first_match: bool,
}

impl Default for NetworkSequence {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            hosts: Vec::new(),
            read_size: 1024,
            attack_mode: AttackMode::Cartesian,
            payloads: PayloadSet::new(),
            matcher: None,
            extractors: Vec::new(),
            stop_at_first_match: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateRequests {
    Http(Vec<RequestSequence>),
    Network(Vec<NetworkSequence>),
}

impl TemplateRequests {
    pub fn len(&self) -> usize {
        match self {
            TemplateRequests::Http(sequences) => sequences.len(),
            TemplateRequests::Network(sequences) => sequences.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One detection rule
#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub info: TemplateInfo,
    /// Acquire an OOB address before sending anything
    pub needs_oob: bool,
    pub variables: VariableStore,
    pub requests: TemplateRequests,
}

impl Template {
    pub fn http_sequences(&self) -> &[RequestSequence] {
        match &self.requests {
            TemplateRequests::Http(sequences) => sequences,
            TemplateRequests::Network(_) => &[],
        }
    }

    pub fn network_sequences(&self) -> &[NetworkSequence] {
        match &self.requests {
            TemplateRequests::Network(sequences) => sequences,
            TemplateRequests::Http(_) => &[],
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.info.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}
