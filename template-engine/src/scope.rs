//! Traffic scopes and the evaluation context shared by matchers and extractors

use crate::codec;
use crate::dsl::builtin_vars;
use crate::dsl::{Evaluator, VarMap};
use crate::oob::OobChecker;
use crate::packet::RawPacket;
use crate::result::ExchangeRecord;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Names under which OOB results are exposed to matchers
pub const OOB_PROTOCOL_VAR: &str = "interactsh_protocol";
pub const OOB_REQUEST_VAR: &str = "interactsh_request";

/// Which slice of an exchange a matcher or extractor reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Status,
    Header,
    Body,
    #[default]
    Raw,
    RequestHeader,
    RequestBody,
    RequestRaw,
    RequestUrl,
    OobProtocol,
    OobRequest,
}

impl Scope {
    /// Map a template `part:` value
    pub fn from_part(part: &str) -> Option<Self> {
        let scope = match part.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "status" | "status_code" => Scope::Status,
            "header" | "headers" | "all_headers" | "response_header" => Scope::Header,
            "body" | "response_body" => Scope::Body,
            "" | "raw" | "all" | "response" => Scope::Raw,
            "request" | "request_raw" => Scope::RequestRaw,
            "request_header" | "request_headers" => Scope::RequestHeader,
            "request_body" => Scope::RequestBody,
            "request_url" | "url" => Scope::RequestUrl,
            "interactsh_protocol" | "oob_protocol" => Scope::OobProtocol,
            "interactsh_request" | "oob_request" => Scope::OobRequest,
            _ => return None,
        };
        Some(scope)
    }

    pub fn is_request(self) -> bool {
        matches!(
            self,
            Scope::RequestHeader | Scope::RequestBody | Scope::RequestRaw | Scope::RequestUrl
        )
    }

    pub fn is_oob(self) -> bool {
        matches!(self, Scope::OobProtocol | Scope::OobRequest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MaterialKey {
    packet: u64,
    scope: Scope,
    is_https: bool,
}

/// Short-lived cache of scope material keyed by packet contents
#[derive(Debug)]
pub struct MaterialCache {
    entries: DashMap<MaterialKey, (Instant, Arc<str>)>,
    ttl: Duration,
}

impl Default for MaterialCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MaterialCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get_or_insert_with(&self, key: MaterialKey, build: impl FnOnce() -> String) -> Arc<str> {
        if let Some(entry) = self.entries.get(&key) {
            if entry.0.elapsed() < self.ttl {
                return entry.1.clone();
            }
        }
        let value: Arc<str> = Arc::from(build());
        self.entries.insert(key, (Instant::now(), value.clone()));
        value
    }

    /// Drop entries older than the TTL
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (created, _)| created.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn packet_hash(packet: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    packet.hash(&mut hasher);
    hasher.finish()
}

/// OOB token of the running execution and an optional direct checker
#[derive(Clone)]
pub struct OobContext {
    pub token: String,
    pub checker: Option<OobChecker>,
}

impl std::fmt::Debug for OobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobContext")
            .field("token", &self.token)
            .field("checker", &self.checker.is_some())
            .finish()
    }
}

/// Everything matchers and extractors need besides the exchange under test
pub struct EvalContext<'a> {
    /// Exchanges of the running sequence, addressable by their 1-based index
    pub exchanges: &'a [ExchangeRecord],
    /// Template and runtime variables; these win over response variables
    pub vars: &'a VarMap,
    pub evaluator: &'a dyn Evaluator,
    pub cache: &'a MaterialCache,
    pub oob: Option<&'a OobContext>,
    /// Memoized results of `id`-addressed matcher leaves
    pub memo: DashMap<(usize, usize), bool>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        exchanges: &'a [ExchangeRecord],
        vars: &'a VarMap,
        evaluator: &'a dyn Evaluator,
        cache: &'a MaterialCache,
    ) -> Self {
        Self {
            exchanges,
            vars,
            evaluator,
            cache,
            oob: None,
            memo: DashMap::new(),
        }
    }

    pub fn with_oob(mut self, oob: Option<&'a OobContext>) -> Self {
        self.oob = oob;
        self
    }

    /// Exchange a matcher/extractor reads: `target == 0` means the current one
    pub fn select<'e>(
        &'e self,
        target: usize,
        current: Option<&'e ExchangeRecord>,
    ) -> Option<&'e ExchangeRecord> {
        if target == 0 {
            current
        } else {
            self.exchanges.iter().find(|exchange| exchange.index == target)
        }
    }

    /// Response variables of the sequence overlaid with the context variables
    pub fn expression_vars(&self, current: Option<&ExchangeRecord>) -> VarMap {
        let mut vars = builtin_vars::exchange_vars(self.exchanges, current);
        for (name, value) in self.vars {
            vars.insert(name.clone(), value.clone());
        }
        vars
    }

    /// Text of `scope` for an exchange; `None` when there is nothing to read
    pub fn material(&self, scope: Scope, exchange: Option<&ExchangeRecord>) -> Option<Arc<str>> {
        if scope.is_oob() {
            return self.oob_material(scope);
        }
        let exchange = exchange?;
        if scope.is_request() {
            if exchange.request.is_empty() {
                return Some(Arc::from(""));
            }
            let key = MaterialKey {
                packet: packet_hash(&exchange.request),
                scope,
                is_https: exchange.is_https,
            };
            return Some(self.cache.get_or_insert_with(key, || {
                request_material(scope, &exchange.request, exchange.is_https)
            }));
        }
        if !exchange.has_response() {
            return None;
        }
        let key = MaterialKey {
            packet: packet_hash(&exchange.response),
            scope,
            is_https: exchange.is_https,
        };
        Some(
            self.cache
                .get_or_insert_with(key, || response_material(scope, &exchange.response)),
        )
    }

    fn oob_material(&self, scope: Scope) -> Option<Arc<str>> {
        let name = match scope {
            Scope::OobProtocol => OOB_PROTOCOL_VAR,
            _ => OOB_REQUEST_VAR,
        };
        if let Some(value) = self.vars.get(name) {
            return Some(Arc::from(crate::dsl::value_to_string(value)));
        }
        let oob = self.oob?;
        if scope == Scope::OobRequest {
            return Some(Arc::from(""));
        }
        let checker = oob.checker.as_ref()?;
        let protocol = checker(&oob.token).unwrap_or_default();
        debug!(token = %oob.token, protocol = %protocol, "OOB checker consulted");
        Some(Arc::from(protocol))
    }
}

fn response_material(scope: Scope, response: &[u8]) -> String {
    match scope {
        Scope::Raw => codec::from_bytes(response.to_vec()),
        Scope::Body => {
            let (_, body) = crate::packet::split_packet(response);
            codec::from_bytes(body.to_vec())
        }
        Scope::Header => RawPacket::parse(response).header_block(),
        Scope::Status => RawPacket::parse(response).status_code().to_string(),
        _ => String::new(),
    }
}

fn request_material(scope: Scope, request: &[u8], is_https: bool) -> String {
    match scope {
        Scope::RequestRaw => codec::from_bytes(request.to_vec()),
        Scope::RequestBody => {
            let (_, body) = crate::packet::split_packet(request);
            codec::from_bytes(body.to_vec())
        }
        Scope::RequestHeader => RawPacket::parse(request).header_block(),
        Scope::RequestUrl => RawPacket::parse(request)
            .request_url(is_https)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

/// Convert extracted or computed values into expression variables
pub fn value_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(crate::dsl::value_to_string).collect(),
        Value::Null => Vec::new(),
        other => vec![crate::dsl::value_to_string(other)],
    }
}
