//! Request generation: target variables, variable combinations and packet rendering

use crate::codec;
use crate::dsl::{value_to_string, Evaluator, VarMap};
use crate::error::{EngineError, EngineResult};
use crate::fuzztag::{self, lookup};
use crate::packet::RawPacket;
use crate::template::{
    InputEncoding, NetworkSequence, RequestForm, RequestSequence, RequestTemplate, Template, TemplateRequests,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// URL-shaped variables derived from one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetInfo {
    pub url: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// `host:port` when the target named a port, else the host
    pub hostname: String,
    pub path: String,
    pub root_url: String,
    pub file: String,
}

impl TargetInfo {
    /// Parse a target; a bare `host[:port]` is taken as plain HTTP
    pub fn parse(target: &str) -> EngineResult<Self> {
        let target = target.trim();
        let with_scheme = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{}", target)
        };
        let url = Url::parse(&with_scheme)?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::generation(format!("target {} has no host", target)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| EngineError::generation(format!("target {} has no port", target)))?;
        let hostname = match url.port() {
            Some(explicit) => format!("{}:{}", host, explicit),
            None => host.clone(),
        };
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path = format!("{}?{}", path, query);
        }
        if path.is_empty() {
            path = "/".to_string();
        }
        let file = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            root_url: format!("{}://{}", url.scheme(), hostname),
            scheme: url.scheme().to_string(),
            url: with_scheme,
            host,
            port,
            hostname,
            path,
            file,
        })
    }

    pub fn is_https(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("https")
    }

    /// Variables every template sees
    pub fn to_vars(&self) -> VarMap {
        let trimmed = self.path.split('?').next().unwrap_or_default().trim_end_matches('/');
        let pairs = [
            ("BaseURL", self.url.clone()),
            ("RootURL", self.root_url.clone()),
            ("Hostname", self.hostname.clone()),
            ("Host", self.host.clone()),
            ("Port", self.port.to_string()),
            ("Path", self.path.clone()),
            ("File", self.file.clone()),
            ("Scheme", self.scheme.clone()),
            ("Schema", self.scheme.clone()),
            ("__path__", self.path.clone()),
            ("__path_trim_end_slash__", trimmed.to_string()),
        ];
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), Value::String(value)))
            .collect()
    }
}

/// Cartesian product over array-valued variables. Scalar variables are
/// shared by every combination; with no arrays there is one combination.
pub fn variable_combinations(vars: &VarMap) -> Vec<VarMap> {
    let mut arrays: Vec<(&String, &Vec<Value>)> = vars
        .iter()
        .filter_map(|(name, value)| match value {
            Value::Array(items) if !items.is_empty() => Some((name, items)),
            _ => None,
        })
        .collect();
    arrays.sort_by(|a, b| a.0.cmp(b.0));

    let mut combinations = vec![vars.clone()];
    for (name, items) in arrays {
        combinations = combinations
            .into_iter()
            .flat_map(|combination| {
                items.iter().map(move |item| {
                    let mut next = combination.clone();
                    next.insert(name.clone(), item.clone());
                    next
                })
            })
            .collect();
    }
    combinations
}

/// A concrete request ready for a transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedRequest {
    pub sequence_index: usize,
    /// Which request template of the sequence produced this packet
    pub template_index: usize,
    #[serde(serialize_with = "packet_text")]
    pub packet: Vec<u8>,
    pub is_https: bool,
    pub sni: Option<String>,
    pub timeout: Option<Duration>,
    pub override_host: Option<String>,
}

fn packet_text<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&codec::from_bytes(bytes.to_vec()))
}

impl PreparedRequest {
    pub fn url(&self) -> String {
        RawPacket::parse(&self.packet)
            .request_url(self.is_https)
            .unwrap_or_default()
    }
}

fn scheme_is_https(value: Option<&Value>) -> Option<bool> {
    let scheme = value_to_string(value?);
    match scheme.trim().to_ascii_lowercase().as_str() {
        "https" => Some(true),
        "http" => Some(false),
        _ => None,
    }
}

/// HTTPS-ness of a rendered packet: the request target's own scheme for
/// path-built packets, the `Schema` variable for raw ones
fn packet_is_https(form: RequestForm, packet: &RawPacket, vars: &VarMap, default: bool) -> bool {
    match form {
        RequestForm::Path => {
            let path = packet.path();
            if path.starts_with("https://") {
                true
            } else if path.starts_with("http://") {
                false
            } else {
                default
            }
        }
        RequestForm::Raw => scheme_is_https(lookup(vars, "Schema"))
            .or_else(|| scheme_is_https(lookup(vars, "Scheme")))
            .unwrap_or(default),
    }
}

/// Render one request template into every packet its payloads produce
pub fn render_request(
    sequence_index: usize,
    template_index: usize,
    request: &RequestTemplate,
    sequence: &RequestSequence,
    vars: &VarMap,
    evaluator: &dyn Evaluator,
    default_https: bool,
) -> Vec<PreparedRequest> {
    fuzztag::render_all(&request.packet, &sequence.payloads, sequence.attack_mode, vars, evaluator)
        .into_iter()
        .map(|rendered| {
            let mut packet = RawPacket::parse(&codec::to_bytes(&rendered));
            let is_https = packet_is_https(request.form, &packet, vars, default_https);
            let bytes = if sequence.unsafe_packet {
                codec::to_bytes(&rendered)
            } else {
                packet.fix_content_length();
                packet.to_bytes()
            };
            PreparedRequest {
                sequence_index,
                template_index,
                packet: bytes,
                is_https,
                sni: request.sni.as_ref().map(|sni| fuzztag::render_first(sni, vars, evaluator)),
                timeout: request.timeout,
                override_host: request
                    .override_host
                    .as_ref()
                    .map(|host| fuzztag::render_first(host, vars, evaluator)),
            }
        })
        .collect()
}

/// Every packet of a template against one target, materialized eagerly.
/// The executor renders lazily instead so extracted values reach later
/// requests; this is for previews and dry runs.
pub fn generate(
    template: &Template,
    target: &str,
    extra: &VarMap,
    evaluator: &dyn Evaluator,
) -> EngineResult<Vec<PreparedRequest>> {
    let info = TargetInfo::parse(target)?;
    let mut base = info.to_vars();
    base.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));

    let sequences = match &template.requests {
        TemplateRequests::Http(sequences) => sequences,
        TemplateRequests::Network(_) => {
            return Err(EngineError::generation("network templates have no HTTP packets"))
        }
    };

    let mut out = Vec::new();
    for combination in variable_combinations(&base) {
        let mut vars = template.variables.to_map(&combination, evaluator);
        vars.extend(combination.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (sequence_index, sequence) in sequences.iter().enumerate() {
            for (template_index, request) in sequence.requests.iter().enumerate() {
                out.extend(render_request(
                    sequence_index,
                    template_index,
                    request,
                    sequence,
                    &vars,
                    evaluator,
                    info.is_https(),
                ));
            }
        }
    }
    debug!(template_id = %template.id, target = %target, packets = out.len(), "generated requests");
    Ok(out)
}

/// One rendered TCP conversation
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPlan {
    pub steps: Vec<NetworkStep>,
    pub read_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStep {
    pub data: Vec<u8>,
    pub read: usize,
    pub name: Option<String>,
}

/// Joins input data so one rendering pass keeps payload values consistent
/// across the inputs of a conversation
const INPUT_SEPARATOR: &str = "\u{0}\u{1}\u{0}";

fn decode_input(data: &str, encoding: InputEncoding) -> Option<Vec<u8>> {
    match encoding {
        InputEncoding::Raw => Some(codec::to_bytes(data)),
        InputEncoding::Hex => codec::hex_decode(data.trim()),
        InputEncoding::Base64 => codec::base64_decode(data.trim()),
    }
}

/// Every conversation a network sequence produces for its payloads
pub fn render_network(sequence: &NetworkSequence, vars: &VarMap, evaluator: &dyn Evaluator) -> Vec<NetworkPlan> {
    let joined = sequence
        .inputs
        .iter()
        .map(|input| input.data.as_str())
        .collect::<Vec<_>>()
        .join(INPUT_SEPARATOR);
    fuzztag::render_all(&joined, &sequence.payloads, sequence.attack_mode, vars, evaluator)
        .into_iter()
        .filter_map(|rendered| {
            let parts: Vec<&str> = rendered.split(INPUT_SEPARATOR).collect();
            if parts.len() != sequence.inputs.len() && !sequence.inputs.is_empty() {
                warn!("rendered input data contained the separator, conversation skipped");
                return None;
            }
            let mut steps = Vec::with_capacity(sequence.inputs.len());
            for (input, data) in sequence.inputs.iter().zip(parts) {
                let Some(data) = decode_input(data, input.encoding) else {
                    warn!(encoding = ?input.encoding, "undecodable network input, conversation skipped");
                    return None;
                };
                steps.push(NetworkStep {
                    data,
                    read: input.read,
                    name: input.name.clone(),
                });
            }
            Some(NetworkPlan {
                steps,
                read_size: sequence.read_size,
            })
        })
        .collect()
}

/// Rendered `host:port` addresses of a network sequence
pub fn network_addresses(
    sequence: &NetworkSequence,
    info: &TargetInfo,
    vars: &VarMap,
    evaluator: &dyn Evaluator,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for host in &sequence.hosts {
        let rendered = fuzztag::render_first(host, vars, evaluator);
        let rendered = rendered.trim();
        let address = if rendered.starts_with("tls://") || rendered.rsplit_once(':').map_or(false, |(_, p)| p.parse::<u16>().is_ok()) {
            rendered.to_string()
        } else {
            format!("{}:{}", rendered, info.port)
        };
        if !out.contains(&address) {
            out.push(address);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::DslEvaluator;
    use crate::fuzztag::{AttackMode, PayloadSet};
    use crate::template::NetworkInput;
    use serde_json::json;

    #[test]
    fn test_target_info() {
        let info = TargetInfo::parse("https://example.com:8443/app/index.php?x=1").expect("valid");
        assert_eq!(info.hostname, "example.com:8443");
        assert_eq!(info.host, "example.com");
        assert_eq!(info.port, 8443);
        assert_eq!(info.root_url, "https://example.com:8443");
        assert_eq!(info.file, "index.php");
        assert_eq!(info.path, "/app/index.php?x=1");
        assert!(info.is_https());

        let bare = TargetInfo::parse("example.com").expect("valid");
        assert_eq!(bare.port, 80);
        assert_eq!(bare.hostname, "example.com");
        assert_eq!(bare.to_vars()["__path_trim_end_slash__"], json!(""));
        assert!(TargetInfo::parse("http://").is_err());
    }

    #[test]
    fn test_variable_combinations() {
        let mut vars = VarMap::new();
        vars.insert("a".into(), json!(["1", "2"]));
        vars.insert("b".into(), json!(["x", "y", "z"]));
        vars.insert("c".into(), json!("fixed"));
        let combinations = variable_combinations(&vars);
        assert_eq!(combinations.len(), 6);
        assert!(combinations.iter().all(|c| c["c"] == json!("fixed") && c["a"].is_string()));
        assert_eq!(variable_combinations(&VarMap::new()).len(), 1);
    }

    #[test]
    fn test_render_request_fixes_length_and_scheme() {
        let evaluator = DslEvaluator::new();
        let info = TargetInfo::parse("http://example.com/base/").expect("valid");
        let mut payloads = PayloadSet::new();
        payloads.insert("user".into(), vec!["admin".into(), "guest".into()]);
        let sequence = RequestSequence {
            payloads,
            attack_mode: AttackMode::Cartesian,
            ..Default::default()
        };
        let request = RequestTemplate::raw("POST {{__path_trim_end_slash__}}/login HTTP/1.1\r\nHost: {{Hostname}}\r\n\r\nuser={{user}}");
        let mut vars = info.to_vars();
        vars.insert("Schema".into(), json!("https"));
        let packets = render_request(0, 0, &request, &sequence, &vars, &evaluator, false);
        assert_eq!(packets.len(), 2);
        let first = codec::from_bytes(packets[0].packet.clone());
        assert!(first.starts_with("POST /base/login HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(first.contains("Content-Length: 10\r\n"));
        assert!(first.ends_with("user=admin"));
        assert!(packets[0].is_https);
        assert_eq!(packets[1].url(), "https://example.com/base/login");
    }

    #[test]
    fn test_render_network_keeps_payloads_aligned() {
        let evaluator = DslEvaluator::new();
        let mut payloads = PayloadSet::new();
        payloads.insert("cmd".into(), vec!["PING".into(), "INFO".into()]);
        let sequence = NetworkSequence {
            inputs: vec![
                NetworkInput {
                    data: "{{cmd}}\r\n".into(),
                    ..Default::default()
                },
                NetworkInput {
                    data: "{{cmd}}".into(),
                    read: 16,
                    name: Some("reply".into()),
                    ..Default::default()
                },
                NetworkInput {
                    data: "0d0a".into(),
                    encoding: InputEncoding::Hex,
                    ..Default::default()
                },
            ],
            hosts: vec!["{{Hostname}}".into(), "{{Host}}:6379".into()],
            payloads,
            ..Default::default()
        };
        let plans = render_network(&sequence, &VarMap::new(), &evaluator);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[1].steps[0].data, b"INFO\r\n");
        assert_eq!(plans[1].steps[1].data, b"INFO");
        assert_eq!(plans[1].steps[1].name.as_deref(), Some("reply"));
        assert_eq!(plans[0].steps[2].data, b"\r\n");

        let info = TargetInfo::parse("redis.local:7000").expect("valid");
        let addresses = network_addresses(&sequence, &info, &info.to_vars(), &evaluator);
        assert_eq!(addresses, vec!["redis.local:7000", "redis.local:6379"]);
    }
}
