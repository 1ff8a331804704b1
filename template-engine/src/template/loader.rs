//! Template document loading
//!
//! Documents are parsed into a generic `serde_json::Value` tree first and
//! mapped onto the typed model by hand. Field spellings follow the nuclei
//! template format.

use super::{
    InputEncoding, NetworkInput, NetworkSequence, RequestForm, RequestSequence, RequestTemplate,
    Severity, Template, TemplateInfo, TemplateRequests,
};
use crate::error::{EngineError, EngineResult};
use crate::extractor::{Extractor, ExtractorKind, RegexGroup};
use crate::fuzztag::{AttackMode, PayloadSet, TagTree};
use crate::matcher::{Condition, GroupEncoding, Matcher, MatcherKind, MatcherLeaf};
use crate::packet::normalize_crlf;
use crate::scope::Scope;
use crate::vars::{VarEntry, VariableStore};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Markers that make a template request an OOB address
const OOB_MARKERS: [&str; 4] = [
    "\"{{interactsh-url}}\"",
    "{{interactsh}}",
    "{{interactsh_url}}",
    "interactsh",
];

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; rv:78.0) Gecko/20100101 Firefox/78.0";

/// Length of identifiers substituted for `{{randstr}}`
const RANDSTR_LEN: usize = 27;

impl Template {
    /// Parse a template document
    pub fn from_yaml(source: &str) -> EngineResult<Template> {
        load(source, None)
    }

    /// Load a template file. Relative payload files resolve against the
    /// template's own directory first.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Template> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| EngineError::template(&path.display().to_string(), err.to_string()))?;
        load(&source, path.parent())
    }
}

fn preprocessor_regex() -> Option<&'static Regex> {
    static PRE: OnceLock<Option<Regex>> = OnceLock::new();
    PRE.get_or_init(|| Regex::new(r"\{\{([a-z0-9_]+)\}\}").ok()).as_ref()
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDSTR_LEN)
        .map(char::from)
        .collect()
}

/// Replace every `{{randstr}}` / `{{randstr_N}}` with one identifier per name
fn expand_preprocessors(source: &str) -> String {
    let Some(re) = preprocessor_regex() else {
        return source.to_string();
    };
    let mut seen = HashSet::new();
    let mut out = source.to_string();
    for caps in re.captures_iter(source) {
        let name = &caps[1];
        if !seen.insert(name.to_string()) {
            continue;
        }
        if name.eq_ignore_ascii_case("randstr") || name.starts_with("randstr_") {
            out = out.replace(&caps[0], &random_id());
        }
    }
    out
}

fn load(source: &str, base_dir: Option<&Path>) -> EngineResult<Template> {
    let source = if source.contains("{{") {
        expand_preprocessors(source)
    } else {
        source.to_string()
    };
    let needs_oob = OOB_MARKERS.iter().any(|marker| source.contains(marker));

    let document: Value = serde_saphyr::from_str(&source)
        .map_err(|err| EngineError::template("<unparsed>", format!("invalid YAML: {}", err)))?;
    let root = document
        .as_object()
        .ok_or_else(|| EngineError::template("<unparsed>", "document is not a mapping"))?;

    let id = get_string(root, "id").unwrap_or_default();
    if id.is_empty() {
        return Err(EngineError::template("<unnamed>", "missing `id`"));
    }
    let info = parse_info(root.get("info"));

    for unsupported in ["workflows", "headless"] {
        if root.contains_key(unsupported) {
            return Err(EngineError::template(
                &id,
                format!("`{}` templates are not supported", unsupported),
            ));
        }
    }

    let requests = if let Some(items) = first_array(root, &["requests", "http"]) {
        let sequences: Vec<RequestSequence> = items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| match parse_http_sequence(item, base_dir) {
                Ok(sequence) => Some(sequence),
                Err(reason) => {
                    error!(template_id = %id, sequence = index, reason = %reason, "request sequence skipped");
                    None
                }
            })
            .collect();
        TemplateRequests::Http(sequences)
    } else if let Some(items) = first_array(root, &["network", "tcp"]) {
        let sequences: Vec<NetworkSequence> = items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| match parse_network_sequence(item, base_dir) {
                Ok(sequence) => Some(sequence),
                Err(reason) => {
                    error!(template_id = %id, sequence = index, reason = %reason, "network sequence skipped");
                    None
                }
            })
            .collect();
        TemplateRequests::Network(sequences)
    } else {
        return Err(EngineError::template(&id, "no `requests`, `http` or `network` section"));
    };

    if requests.is_empty() {
        return Err(EngineError::template(&id, "no usable request sequence"));
    }

    let template = Template {
        needs_oob: needs_oob || uses_oob_scope(&requests),
        variables: parse_variables(root.get("variables")),
        info,
        requests,
        id,
    };
    debug!(
        template_id = %template.id,
        sequences = template.requests.len(),
        needs_oob = template.needs_oob,
        "template loaded"
    );
    Ok(template)
}

fn uses_oob_scope(requests: &TemplateRequests) -> bool {
    let matchers: Vec<&Matcher> = match requests {
        TemplateRequests::Http(s) => s.iter().filter_map(|s| s.matcher.as_ref()).collect(),
        TemplateRequests::Network(s) => s.iter().filter_map(|s| s.matcher.as_ref()).collect(),
    };
    matchers.iter().any(|matcher| matcher.uses_oob())
}

fn first_array<'v>(map: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Vec<Value>> {
    keys.iter().find_map(|key| map.get(*key).and_then(Value::as_array))
}

fn first_value<'v>(map: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Value> {
    keys.iter().find_map(|key| map.get(*key).filter(|v| !v.is_null()))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn get_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(scalar_string)
}

fn get_bool(map: &Map<String, Value>, keys: &[&str]) -> bool {
    match first_value(map, keys) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn get_usize(map: &Map<String, Value>, keys: &[&str]) -> Option<usize> {
    match first_value(map, keys)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A scalar becomes a one-element list
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(other) => scalar_string(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn parse_info(value: Option<&Value>) -> TemplateInfo {
    let Some(info) = value.and_then(Value::as_object) else {
        return TemplateInfo::default();
    };
    let author = match info.get("author") {
        Some(Value::Array(_)) => string_list(info.get("author")).join(","),
        _ => get_string(info, "author").unwrap_or_default(),
    };
    let tags = match info.get("tags") {
        Some(Value::Array(_)) => string_list(info.get("tags")),
        _ => get_string(info, "tags")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
    };
    let cve = info
        .get("classification")
        .and_then(Value::as_object)
        .and_then(|c| get_string(c, "cve-id"))
        .filter(|cve| !cve.is_empty());
    TemplateInfo {
        name: get_string(info, "name").unwrap_or_default(),
        author,
        severity: Severity::parse(&get_string(info, "severity").unwrap_or_default()),
        description: get_string(info, "description").unwrap_or_default(),
        reference: string_list(info.get("reference")),
        tags,
        cve,
    }
}

/// Untagged values and single literals are raw, everything else an expression
fn parse_variables(value: Option<&Value>) -> VariableStore {
    let mut store = VariableStore::new();
    let Some(map) = value.and_then(Value::as_object) else {
        return store;
    };
    for (name, value) in map {
        match value {
            Value::String(text) if TagTree::parse(text).has_tags() => {
                store.set(name.clone(), VarEntry::Expression(text.clone()))
            }
            other => store.set(name.clone(), VarEntry::Raw(other.clone())),
        }
    }
    store
}

fn read_payload_file(path: &str, base_dir: Option<&Path>) -> Option<Vec<String>> {
    let candidates: Vec<PathBuf> = match base_dir {
        Some(dir) if Path::new(path).is_relative() => vec![dir.join(path), PathBuf::from(path)],
        _ => vec![PathBuf::from(path)],
    };
    let found = candidates.into_iter().find(|candidate| candidate.is_file())?;
    match std::fs::read_to_string(&found) {
        Ok(content) => Some(
            content
                .lines()
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Err(err) => {
            error!(path = %found.display(), error = %err, "payload file unreadable");
            None
        }
    }
}

fn parse_payloads(value: Option<&Value>, base_dir: Option<&Path>) -> PayloadSet {
    let mut payloads = PayloadSet::new();
    let Some(map) = value.and_then(Value::as_object) else {
        return payloads;
    };
    for (name, value) in map {
        match value {
            Value::Array(_) => {
                payloads.insert(name.clone(), string_list(Some(value)));
            }
            other => {
                let path = scalar_string(other).unwrap_or_default();
                match read_payload_file(&path, base_dir) {
                    Some(lines) => {
                        payloads.insert(name.clone(), lines);
                    }
                    None => error!(payload = %name, path = %path, "payload file not found, payload dropped"),
                }
            }
        }
    }
    payloads
}

fn parse_scope(map: &Map<String, Value>) -> Scope {
    let part = get_string(map, "part").unwrap_or_default();
    Scope::from_part(&part).unwrap_or_else(|| {
        warn!(part = %part, "unknown part, reading the raw response");
        Scope::Raw
    })
}

fn parse_matcher(value: &Value) -> Option<Matcher> {
    let map = value.as_object()?;
    let kind_name = get_string(map, "type").unwrap_or_default();
    let scope = parse_scope(map);
    let kind = match kind_name.as_str() {
        "word" | "words" => MatcherKind::Word {
            words: string_list(map.get("words")),
            encoding: GroupEncoding::parse(&get_string(map, "encoding").unwrap_or_default()),
            case_insensitive: get_bool(map, &["case-insensitive"]),
        },
        "status" => MatcherKind::Status {
            codes: string_list(map.get("status"))
                .iter()
                .filter_map(|code| code.trim().parse().ok())
                .collect(),
        },
        "size" => MatcherKind::Size {
            sizes: string_list(first_value(map, &["size", "sizes", "content-length"]))
                .iter()
                .filter_map(|size| size.trim().parse().ok())
                .collect(),
        },
        "binary" => MatcherKind::Binary {
            patterns: string_list(map.get("binary")),
        },
        "regex" | "regexp" => MatcherKind::Regex {
            patterns: string_list(first_value(map, &["regex", "regexp"])),
        },
        "dsl" | "expr" => MatcherKind::Expression {
            expressions: string_list(map.get("dsl")),
        },
        other => {
            error!(matcher_type = %other, "unsupported matcher type skipped");
            return None;
        }
    };
    Some(Matcher::Leaf(MatcherLeaf {
        index: 0,
        scope: match kind {
            MatcherKind::Status { .. } => Scope::Status,
            _ => scope,
        },
        kind,
        condition: Condition::parse(&get_string(map, "condition").unwrap_or_default()),
        negate: get_bool(map, &["negative"]),
        target: get_usize(map, &["id"]).unwrap_or(0),
    }))
}

/// Several matchers are combined under `matchers-condition`
fn parse_matchers(map: &Map<String, Value>) -> Option<Matcher> {
    let mut leaves: Vec<Matcher> = map
        .get("matchers")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_matcher).collect())
        .unwrap_or_default();
    let mut matcher = match leaves.len() {
        0 => return None,
        1 => leaves.pop()?,
        _ => Matcher::Group {
            condition: Condition::parse(&get_string(map, "matchers-condition").unwrap_or_default()),
            negate: false,
            children: leaves,
        },
    };
    matcher.reindex();
    Some(matcher)
}

fn parse_extractor(value: &Value) -> Option<Extractor> {
    let map = value.as_object()?;
    let kind_name = get_string(map, "type").unwrap_or_default();
    let kind = match kind_name.as_str() {
        "regex" => ExtractorKind::Regex {
            patterns: string_list(map.get("regex")),
            groups: match map.get("group") {
                Some(Value::String(name)) if name.trim().parse::<usize>().is_err() => {
                    vec![RegexGroup::Name(name.clone())]
                }
                Some(_) => vec![RegexGroup::Index(get_usize(map, &["group"]).unwrap_or(0))],
                None => Vec::new(),
            },
        },
        "kval" => ExtractorKind::KeyValue {
            keys: string_list(map.get("kval")),
        },
        "json" => ExtractorKind::Json {
            queries: string_list(map.get("json")),
        },
        "xpath" => ExtractorKind::XPath {
            queries: string_list(map.get("xpath")),
            attribute: get_string(map, "attribute").filter(|a| !a.is_empty()),
        },
        "dsl" => ExtractorKind::Expression {
            expressions: string_list(map.get("dsl")),
        },
        other => {
            error!(extractor_type = %other, "unsupported extractor type skipped");
            return None;
        }
    };
    Some(Extractor {
        name: get_string(map, "name").unwrap_or_else(|| kind_name.clone()),
        kind,
        scope: parse_scope(map),
        internal: get_bool(map, &["internal"]),
        target: get_usize(map, &["id"]).unwrap_or(0),
    })
}

fn parse_extractors(map: &Map<String, Value>) -> Vec<Extractor> {
    map.get("extractors")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_extractor).collect())
        .unwrap_or_default()
}

/// Default the matcher when a sequence would otherwise produce no signal
fn matcher_or_default(matcher: Option<Matcher>, extractors: &[Extractor]) -> Option<Matcher> {
    if matcher.is_none() && extractors.is_empty() {
        warn!("sequence has neither matchers nor extractors, matching status 200");
        return Some(Matcher::default_status());
    }
    matcher
}

/// `5s`, `500ms`, `1m` or a bare number of seconds
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let seconds = match unit.trim() {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(seconds))
}

/// A `raw` entry, with optional leading `@key: value` annotations
fn parse_raw_packet(text: &str) -> RequestTemplate {
    let mut request = RequestTemplate::raw(String::new());
    let mut lines = text.trim_start().lines().peekable();
    while let Some(&line) = lines.peek() {
        let Some(annotation) = line.strip_prefix('@') else {
            break;
        };
        let (key, value) = annotation.split_once(':').unwrap_or((annotation, ""));
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "tls-sni" => request.sni = Some(value.to_string()),
            "timeout" => request.timeout = parse_duration(value),
            "host" => request.override_host = Some(value.to_string()),
            other => debug!(annotation = %other, "ignored packet annotation"),
        }
        lines.next();
    }
    let packet = lines.collect::<Vec<_>>().join("\n");
    request.packet = normalize_crlf(&packet);
    request
}

/// Build a packet from `method`, one `path`, `headers` and `body`
fn build_path_packet(map: &Map<String, Value>, path: &str) -> RequestTemplate {
    let method = get_string(map, "method")
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| "GET".to_string());
    let target = if let Some(rest) = path.strip_prefix("{{BaseURL}}") {
        if rest.starts_with('/') {
            format!("{{{{__path_trim_end_slash__}}}}{}", rest)
        } else {
            format!("{{{{__path__}}}}{}", rest)
        }
    } else if let Some(rest) = path.strip_prefix("{{RootURL}}") {
        rest.to_string()
    } else {
        path.to_string()
    };
    let target = if target.is_empty() { "/".to_string() } else { target };

    let mut lines = vec![format!("{} {} HTTP/1.1", method.trim().to_ascii_uppercase(), target)];
    let headers = map.get("headers").and_then(Value::as_object);
    let has_host = headers
        .map(|h| h.keys().any(|k| k.eq_ignore_ascii_case("host")))
        .unwrap_or(false);
    if !has_host {
        lines.push("Host: {{Hostname}}".to_string());
    }
    match headers {
        Some(headers) if !headers.is_empty() => {
            for (name, value) in headers {
                lines.push(format!("{}: {}", name, scalar_string(value).unwrap_or_default()));
            }
        }
        _ => lines.push(format!("User-Agent: {}", DEFAULT_USER_AGENT)),
    }
    let mut packet = lines.join("\r\n");
    packet.push_str("\r\n\r\n");
    packet.push_str(&get_string(map, "body").unwrap_or_default());

    RequestTemplate {
        packet,
        form: RequestForm::Path,
        sni: None,
        timeout: None,
        override_host: None,
    }
}

fn parse_http_sequence(value: &Value, base_dir: Option<&Path>) -> Result<RequestSequence, String> {
    let map = value.as_object().ok_or("sequence is not a mapping")?;

    let requests: Vec<RequestTemplate> = match map.get("raw") {
        Some(raw) => string_list(Some(raw)).iter().map(|text| parse_raw_packet(text)).collect(),
        None => string_list(map.get("path"))
            .iter()
            .map(|path| build_path_packet(map, path))
            .collect(),
    };
    if requests.is_empty() {
        return Err("no `raw` packets or `path` entries".to_string());
    }

    let extractors = parse_extractors(map);
    let matcher = matcher_or_default(parse_matchers(map), &extractors);
    Ok(RequestSequence {
        requests,
        attack_mode: AttackMode::from_template(&get_string(map, "attack").unwrap_or_default()),
        payloads: parse_payloads(map.get("payloads"), base_dir),
        matcher,
        extractors,
        stop_at_first_match: get_bool(map, &["stop-at-first-match"]),
        after_requested: get_bool(map, &["req-condition"]),
        cookie_reuse: get_bool(map, &["cookie-reuse"]),
        follow_redirects: get_bool(map, &["host-redirects", "redirects"]),
        max_redirects: get_usize(map, &["max-redirects"]).unwrap_or(3),
        max_size: get_usize(map, &["max-size"]).filter(|size| *size > 0),
        unsafe_packet: get_bool(map, &["unsafe"]),
    })
}

fn parse_network_sequence(value: &Value, base_dir: Option<&Path>) -> Result<NetworkSequence, String> {
    let map = value.as_object().ok_or("sequence is not a mapping")?;
    let inputs: Vec<NetworkInput> = map
        .get("inputs")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|input| NetworkInput {
                    data: get_string(input, "data").unwrap_or_default(),
                    encoding: InputEncoding::parse(&get_string(input, "type").unwrap_or_default()),
                    read: get_usize(input, &["read"]).unwrap_or(0),
                    name: get_string(input, "name").filter(|n| !n.is_empty()),
                })
                .collect()
        })
        .unwrap_or_default();
    let hosts = string_list(first_value(map, &["host", "address"]));
    if hosts.is_empty() {
        return Err("no `host` entries".to_string());
    }

    let extractors = parse_extractors(map);
    let matcher = matcher_or_default(parse_matchers(map), &extractors);
    Ok(NetworkSequence {
        inputs,
        hosts,
        read_size: get_usize(map, &["read-size"]).filter(|n| *n > 0).unwrap_or(1024),
        attack_mode: AttackMode::from_template(&get_string(map, "attack").unwrap_or_default()),
        payloads: parse_payloads(map.get("payloads"), base_dir),
        matcher,
        extractors,
        stop_at_first_match: get_bool(map, &["stop-at-first-match"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_TEMPLATE: &str = r#"
id: demo-login
info:
  name: Demo login
  author: tester
  severity: high
  tags: login, demo ,
  reference:
    - https://example.com/advisory
  classification:
    cve-id: CVE-2024-0001
variables:
  user: admin
  marker: "{{to_upper(user)}}"
requests:
  - raw:
      - |
        @timeout: 5s
        @tls-sni: sni.example.com
        POST /login HTTP/1.1
        Host: {{Hostname}}

        user={{username}}&pass={{password}}
    attack: pitchfork
    payloads:
      username:
        - admin
        - root
      password:
        - "123456"
    cookie-reuse: true
    req-condition: true
    matchers-condition: and
    matchers:
      - type: word
        part: body
        words:
          - welcome
      - type: status
        status:
          - 200
          - 302
    extractors:
      - type: regex
        name: session
        part: header
        group: 1
        regex:
          - 'sid=([a-z0-9]+)'
        internal: true
"#;

    #[test]
    fn test_raw_template() {
        let template = Template::from_yaml(RAW_TEMPLATE).expect("template loads");
        assert_eq!(template.id, "demo-login");
        assert_eq!(template.info.severity, Severity::High);
        assert_eq!(template.info.tags, vec!["login", "demo"]);
        assert_eq!(template.info.cve.as_deref(), Some("CVE-2024-0001"));
        assert!(!template.needs_oob);
        assert_eq!(template.variables.get("user"), Some(&VarEntry::Raw(Value::String("admin".into()))));
        assert!(matches!(template.variables.get("marker"), Some(VarEntry::Expression(_))));

        let sequence = &template.http_sequences()[0];
        assert_eq!(sequence.attack_mode, AttackMode::Sync);
        assert!(sequence.cookie_reuse);
        assert!(sequence.after_requested);
        assert_eq!(sequence.payloads["password"], vec!["123456"]);

        let request = &sequence.requests[0];
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.sni.as_deref(), Some("sni.example.com"));
        assert!(request.packet.starts_with("POST /login HTTP/1.1\r\nHost: {{Hostname}}\r\n\r\nuser="));

        match sequence.matcher.as_ref() {
            Some(Matcher::Group { condition, children, .. }) => {
                assert_eq!(*condition, Condition::And);
                assert_eq!(children.len(), 2);
            }
            other => panic!("unexpected matcher {:?}", other),
        }
        let extractor = &sequence.extractors[0];
        assert!(extractor.internal);
        assert_eq!(extractor.scope, Scope::Header);
    }

    #[test]
    fn test_path_form() {
        let yaml = r#"
id: path-demo
info:
  name: path demo
  severity: info
http:
  - method: get
    path:
      - "{{BaseURL}}/admin"
      - "{{BaseURL}}?x=1"
      - "{{RootURL}}/robots.txt"
    matchers:
      - type: status
        status: [200]
"#;
        let template = Template::from_yaml(yaml).expect("template loads");
        let requests = &template.http_sequences()[0].requests;
        assert_eq!(
            requests[0].packet,
            format!(
                "GET {{{{__path_trim_end_slash__}}}}/admin HTTP/1.1\r\nHost: {{{{Hostname}}}}\r\nUser-Agent: {}\r\n\r\n",
                DEFAULT_USER_AGENT
            )
        );
        assert!(requests[1].packet.starts_with("GET {{__path__}}?x=1 HTTP/1.1"));
        assert!(requests[2].packet.starts_with("GET /robots.txt HTTP/1.1"));
        assert_eq!(requests[0].form, RequestForm::Path);
    }

    #[test]
    fn test_default_matcher_and_oob_detection() {
        let yaml = r#"
id: oob-demo
info:
  name: oob
requests:
  - raw:
      - "GET /?u={{interactsh-url}} HTTP/1.1\nHost: {{Hostname}}\n\n"
"#;
        let template = Template::from_yaml(yaml).expect("template loads");
        assert!(template.needs_oob);
        assert_eq!(template.http_sequences()[0].matcher, Some(Matcher::default_status()));
    }

    #[test]
    fn test_randstr_expansion() {
        let out = expand_preprocessors("{{randstr}}-{{randstr}}-{{randstr_1}}-{{other}}");
        let parts: Vec<&str> = out.split('-').collect();
        assert_eq!(parts[0], parts[1]);
        assert_ne!(parts[0], parts[2]);
        assert_eq!(parts[0].len(), RANDSTR_LEN);
        assert_eq!(parts[3], "{{other}}");
    }

    #[test]
    fn test_rejections() {
        assert!(Template::from_yaml("id: x\nworkflows:\n  - template: a.yaml\n").is_err());
        assert!(Template::from_yaml("id: x\ninfo:\n  name: y\n").is_err());
        assert!(Template::from_yaml("info:\n  name: y\nrequests: []\n").is_err());
        assert!(Template::from_yaml("- just\n- a list\n").is_err());
    }

    #[test]
    fn test_network_sequence() {
        let yaml = r#"
id: redis-unauth
info:
  name: redis
  severity: high
network:
  - inputs:
      - data: "info\r\n"
      - data: "50494e470d0a"
        type: hex
        read: 64
        name: pong
    host:
      - "{{Hostname}}"
      - "{{Host}}:6379"
    read-size: 2048
    matchers:
      - type: word
        words:
          - redis_version
"#;
        let template = Template::from_yaml(yaml).expect("template loads");
        let sequence = &template.network_sequences()[0];
        assert_eq!(sequence.inputs.len(), 2);
        assert_eq!(sequence.inputs[1].encoding, InputEncoding::Hex);
        assert_eq!(sequence.inputs[1].read, 64);
        assert_eq!(sequence.inputs[1].name.as_deref(), Some("pong"));
        assert_eq!(sequence.read_size, 2048);
        assert_eq!(sequence.hosts.len(), 2);
    }

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("soon"), None);
    }
}
