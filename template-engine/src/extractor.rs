//! Named value extraction from scoped traffic

use crate::dsl::{compile_regex, value_to_string, VarMap};
use crate::packet::RawPacket;
use crate::result::ExchangeRecord;
use crate::scope::{value_list, EvalContext, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json_path::JsonPath;
use sxd_document::dom::{Document, Element};
use sxd_document::Package;
use sxd_xpath::nodeset::Node;
use tracing::{debug, warn};

/// Deepest JSON nesting the key-value scan descends into
const KVAL_MAX_DEPTH: usize = 8;

/// Submatch selector of a regex extractor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegexGroup {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExtractorKind {
    Regex {
        patterns: Vec<String>,
        /// Empty selects the whole match
        groups: Vec<RegexGroup>,
    },
    KeyValue { keys: Vec<String> },
    Json { queries: Vec<String> },
    XPath {
        queries: Vec<String>,
        attribute: Option<String>,
    },
    Expression { expressions: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extractor {
    pub name: String,
    pub kind: ExtractorKind,
    pub scope: Scope,
    /// Internal values feed later requests but are not reported
    pub internal: bool,
    /// 0 reads the exchange under evaluation, k reads the k-th exchange
    pub target: usize,
}

impl Extractor {
    /// Values for this extractor. `previous` holds results of extractors that
    /// already ran for the same exchange.
    pub fn execute(
        &self,
        ctx: &EvalContext<'_>,
        current: Option<&ExchangeRecord>,
        previous: &VarMap,
    ) -> Vec<String> {
        let exchange = ctx.select(self.target, current);
        if self.target != 0 && exchange.is_none() {
            return Vec::new();
        }

        let values = match &self.kind {
            ExtractorKind::Expression { expressions } => {
                let mut vars = ctx.expression_vars(exchange);
                for (name, value) in previous {
                    vars.insert(name.clone(), value.clone());
                }
                expressions
                    .iter()
                    .flat_map(|expression| match ctx.evaluator.evaluate(expression, &vars) {
                        Ok(value) => value_list(&value),
                        Err(err) => {
                            warn!(extractor = %self.name, error = %err, "expression extractor failed");
                            Vec::new()
                        }
                    })
                    .collect()
            }
            kind => {
                let Some(material) = ctx.material(self.scope, exchange) else {
                    return Vec::new();
                };
                match kind {
                    ExtractorKind::Regex { patterns, groups } => extract_regex(patterns, groups, &material),
                    ExtractorKind::KeyValue { keys } => extract_kval(keys, &material, self.scope),
                    ExtractorKind::Json { queries } => extract_json(queries, &material),
                    ExtractorKind::XPath { queries, attribute } => {
                        extract_xpath(queries, attribute.as_deref(), &material)
                    }
                    ExtractorKind::Expression { .. } => Vec::new(),
                }
            }
        };

        let mut unique: Vec<String> = Vec::with_capacity(values.len());
        for value in values {
            if !value.is_empty() && !unique.contains(&value) {
                unique.push(value);
            }
        }
        debug!(extractor = %self.name, count = unique.len(), "extracted");
        unique
    }
}

fn extract_regex(patterns: &[String], groups: &[RegexGroup], material: &str) -> Vec<String> {
    let whole = [RegexGroup::Index(0)];
    let groups = if groups.is_empty() { &whole[..] } else { groups };
    let mut out = Vec::new();
    for pattern in patterns {
        let re = match compile_regex(pattern) {
            Ok(re) => re,
            Err(err) => {
                warn!(error = %err, "regex extractor pattern skipped");
                continue;
            }
        };
        for caps in re.captures_iter(material) {
            for group in groups {
                let found = match group {
                    RegexGroup::Index(index) => caps.get(*index),
                    RegexGroup::Name(name) => caps.name(name),
                };
                if let Some(found) = found {
                    out.push(found.as_str().to_string());
                }
            }
        }
    }
    out
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('-', "_")
}

fn flatten_json(prefix: &str, value: &Value, depth: usize, out: &mut Vec<(String, String)>) {
    if depth > KVAL_MAX_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                out.push((key.clone(), value_to_string(child)));
                let nested = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                if nested != *key {
                    out.push((nested.clone(), value_to_string(child)));
                }
                flatten_json(&nested, child, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_json(prefix, item, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// Scan headers, `k=v` pairs and JSON documents for the requested keys.
/// Only packet-shaped scopes carry a start line and headers.
fn extract_kval(keys: &[String], material: &str, scope: Scope) -> Vec<String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let has_head = matches!(
        scope,
        Scope::Raw | Scope::Header | Scope::RequestRaw | Scope::RequestHeader
    );
    let body = if has_head {
        let packet = RawPacket::parse(material.as_bytes());
        pairs.extend(packet.headers.iter().cloned());
        if let Some(cookie) = packet.header("Cookie") {
            pairs.extend(split_pairs(cookie, ';'));
        }
        for value in packet.header_values("Set-Cookie") {
            pairs.extend(split_pairs(value.split(';').next().unwrap_or_default(), ';'));
        }
        let (_, body) = crate::packet::split_packet(material.as_bytes());
        if body.is_empty() && packet.headers.is_empty() {
            material
        } else {
            std::str::from_utf8(body).unwrap_or(material)
        }
    } else {
        material
    };
    match serde_json::from_str::<Value>(body.trim()) {
        Ok(json @ (Value::Object(_) | Value::Array(_))) => flatten_json("", &json, 0, &mut pairs),
        _ => {
            for line in body.lines() {
                pairs.extend(split_pairs(line, '&'));
            }
        }
    }

    let mut out = Vec::new();
    for key in keys {
        let wanted = normalize_key(key);
        out.extend(
            pairs
                .iter()
                .filter(|(name, _)| normalize_key(name) == wanted)
                .map(|(_, value)| value.clone()),
        );
    }
    out
}

fn split_pairs(text: &str, separator: char) -> Vec<(String, String)> {
    text.split(separator)
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

/// jq-style `.a.b[]` queries become JSONPath `$.a.b[*]`
fn to_json_path(query: &str) -> String {
    let query = query.trim();
    if query.starts_with('$') {
        return query.to_string();
    }
    let body = query.replace("[]", "[*]");
    if body == "." {
        "$".to_string()
    } else if body.starts_with('.') || body.starts_with('[') {
        format!("${}", body)
    } else {
        format!("$.{}", body)
    }
}

fn extract_json(queries: &[String], material: &str) -> Vec<String> {
    let (_, body) = crate::packet::split_packet(material.as_bytes());
    let text = if body.is_empty() {
        material.to_string()
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    let document: Value = match serde_json::from_str(text.trim()) {
        Ok(document) => document,
        Err(err) => {
            debug!(error = %err, "json extractor: material is not JSON");
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for query in queries {
        let path = match JsonPath::parse(&to_json_path(query)) {
            Ok(path) => path,
            Err(err) => {
                warn!(query = %query, error = %err, "json extractor query skipped");
                continue;
            }
        };
        out.extend(path.query(&document).all().into_iter().map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }));
    }
    out
}

fn build_element<'d>(doc: &Document<'d>, source: scraper::ElementRef<'_>) -> Element<'d> {
    let element = doc.create_element(source.value().name());
    for (name, value) in source.value().attrs() {
        element.set_attribute_value(name, value);
    }
    for child in source.children() {
        match child.value() {
            scraper::Node::Element(_) => {
                if let Some(child) = scraper::ElementRef::wrap(child) {
                    element.append_child(build_element(doc, child));
                }
            }
            scraper::Node::Text(text) => element.append_child(doc.create_text(&**text)),
            _ => {}
        }
    }
    element
}

/// Parse HTML leniently and rebuild it as an XPath-queryable document
fn html_package(html: &str) -> Package {
    let parsed = scraper::Html::parse_document(html);
    let package = Package::new();
    {
        let doc = package.as_document();
        let root = build_element(&doc, parsed.root_element());
        doc.root().append_child(root);
    }
    package
}

fn extract_xpath(queries: &[String], attribute: Option<&str>, material: &str) -> Vec<String> {
    let (_, body) = crate::packet::split_packet(material.as_bytes());
    let text = if body.is_empty() {
        material.to_string()
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    let package = match sxd_document::parser::parse(text.trim()) {
        Ok(package) => package,
        Err(_) => html_package(&text),
    };
    let document = package.as_document();

    let mut out = Vec::new();
    for query in queries {
        let value = match sxd_xpath::evaluate_xpath(&document, query) {
            Ok(value) => value,
            Err(err) => {
                warn!(query = %query, error = %err, "xpath extractor query skipped");
                continue;
            }
        };
        match value {
            sxd_xpath::Value::Nodeset(nodes) => {
                for node in nodes.document_order() {
                    match (attribute, node) {
                        (Some(name), Node::Element(element)) => {
                            if let Some(value) = element.attribute_value(name) {
                                out.push(value.to_string());
                            }
                        }
                        (Some(_), _) => {}
                        (None, node) => out.push(node.string_value().trim().to_string()),
                    }
                }
            }
            other => out.push(other.string()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::DslEvaluator;
    use crate::scope::MaterialCache;
    use serde_json::json;

    fn exchange(content_type: &str, body: &str) -> ExchangeRecord {
        ExchangeRecord {
            index: 1,
            request: b"GET / HTTP/1.1\r\nHost: t\r\n\r\n".to_vec(),
            response: format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nSet-Cookie: session=s3cr3t; Path=/\r\n\r\n{}",
                content_type, body
            )
            .into_bytes(),
            ..Default::default()
        }
    }

    fn extractor(kind: ExtractorKind, scope: Scope) -> Extractor {
        Extractor {
            name: "out".into(),
            kind,
            scope,
            internal: false,
            target: 0,
        }
    }

    fn run(extractor: &Extractor, exchange: ExchangeRecord, previous: &VarMap) -> Vec<String> {
        let evaluator = DslEvaluator::new();
        let vars = VarMap::new();
        let cache = MaterialCache::default();
        let exchanges = vec![exchange];
        let ctx = EvalContext::new(&exchanges, &vars, &evaluator, &cache);
        extractor.execute(&ctx, exchanges.first(), previous)
    }

    #[test]
    fn test_regex_group() {
        let ex = extractor(
            ExtractorKind::Regex {
                patterns: vec!["token=([a-z0-9]+)".into()],
                groups: vec![RegexGroup::Index(1)],
            },
            Scope::Body,
        );
        assert_eq!(
            run(&ex, exchange("text/html", "<p>token=abc123</p>"), &VarMap::new()),
            vec!["abc123"]
        );
    }

    #[test]
    fn test_regex_whole_match_and_named_group() {
        let whole = extractor(
            ExtractorKind::Regex {
                patterns: vec!["v[0-9]+".into()],
                groups: Vec::new(),
            },
            Scope::Body,
        );
        assert_eq!(run(&whole, exchange("text/plain", "v1 v2 v1"), &VarMap::new()), vec!["v1", "v2"]);

        let named = extractor(
            ExtractorKind::Regex {
                patterns: vec!["id=(?P<id>\\d+)".into()],
                groups: vec![RegexGroup::Name("id".into())],
            },
            Scope::Body,
        );
        assert_eq!(run(&named, exchange("text/plain", "id=42"), &VarMap::new()), vec!["42"]);
    }

    #[test]
    fn test_kval_headers_cookies_and_json() {
        let ex = extractor(
            ExtractorKind::KeyValue {
                keys: vec!["content_type".into(), "session".into(), "role".into()],
            },
            Scope::Raw,
        );
        let values = run(&ex, exchange("application/json", r#"{"user":{"role":"admin"}}"#), &VarMap::new());
        assert_eq!(values, vec!["application/json", "s3cr3t", "admin"]);
    }

    #[test]
    fn test_kval_body_keeps_first_line() {
        let ex = extractor(
            ExtractorKind::KeyValue {
                keys: vec!["a".into(), "b".into()],
            },
            Scope::Body,
        );
        assert_eq!(run(&ex, exchange("text/plain", "a=1\nb=2"), &VarMap::new()), vec!["1", "2"]);
    }

    #[test]
    fn test_json_queries() {
        let ex = extractor(
            ExtractorKind::Json {
                queries: vec![".data.items[].name".into(), "$.data.count".into()],
            },
            Scope::Body,
        );
        let body = r#"{"data":{"count":2,"items":[{"name":"a"},{"name":"b"}]}}"#;
        assert_eq!(run(&ex, exchange("application/json", body), &VarMap::new()), vec!["a", "b", "2"]);
    }

    #[test]
    fn test_xpath_xml_and_html() {
        let attr = extractor(
            ExtractorKind::XPath {
                queries: vec!["//input[@name='csrf']".into()],
                attribute: Some("value".into()),
            },
            Scope::Body,
        );
        let html = "<html><body><form><input name='csrf' value='tok123'><br></form></body></html>";
        assert_eq!(run(&attr, exchange("text/html", html), &VarMap::new()), vec!["tok123"]);

        let text = extractor(
            ExtractorKind::XPath {
                queries: vec!["/root/item".into()],
                attribute: None,
            },
            Scope::Body,
        );
        let xml = "<root><item>one</item><item>two</item></root>";
        assert_eq!(run(&text, exchange("text/xml", xml), &VarMap::new()), vec!["one", "two"]);
    }

    #[test]
    fn test_expression_sees_previous_results() {
        let ex = extractor(
            ExtractorKind::Expression {
                expressions: vec!["to_upper(token) + '-' + status_code".into()],
            },
            Scope::Raw,
        );
        let mut previous = VarMap::new();
        previous.insert("token".into(), json!("abc"));
        assert_eq!(run(&ex, exchange("text/plain", ""), &previous), vec!["ABC-200"]);
    }

    #[test]
    fn test_jq_conversion() {
        assert_eq!(to_json_path(".a.b"), "$.a.b");
        assert_eq!(to_json_path(".a[]"), "$.a[*]");
        assert_eq!(to_json_path("."), "$");
        assert_eq!(to_json_path("a"), "$.a");
        assert_eq!(to_json_path("$.x"), "$.x");
    }
}
