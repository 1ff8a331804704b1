//! Engine Execution Tests
//!
//! Drives templates end to end through a scripted transport and a scripted
//! OOB provider: value chaining, exchange references, deferred matching,
//! cookie reuse, cancellation, out-of-band detection, raw TCP conversations
//! and recovery from a failing sequence.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use template_engine::{
    Engine, EngineConfig, ExtractedValue, NetworkExchange, NetworkPlan, NetworkTransport, OobError, OobProvider,
    OobRegistry, OobToken, PreparedRequest, RawPacket, ReportCallback, SendOptions, SequenceKind, SequenceReport,
    Template, Transport, TransportError, TransportResponse, VarMap,
};
use tokio_util::sync::CancellationToken;

const TARGET: &str = "http://target.test";

/// Answers by request path and remembers every packet it was given
struct ScriptedTransport {
    sent: Mutex<Vec<String>>,
    routes: Vec<(&'static str, &'static str)>,
}

impl ScriptedTransport {
    fn new(routes: Vec<(&'static str, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            routes,
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &PreparedRequest,
        _options: &SendOptions,
    ) -> Result<TransportResponse, TransportError> {
        let packet = String::from_utf8_lossy(&request.packet).to_string();
        self.sent.lock().push(packet);
        let path = RawPacket::parse(&request.packet).path().to_string();
        let response = self
            .routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map(|(_, response)| response.to_string())
            .unwrap_or_else(|| "HTTP/1.1 404 Not Found\r\n\r\nmissing".to_string());
        Ok(TransportResponse {
            packet: response.into_bytes(),
            duration: Duration::from_millis(1),
            url: request.url(),
        })
    }
}

struct ScriptedOob {
    acquired: AtomicUsize,
    polled: AtomicUsize,
    protocol: Option<&'static str>,
}

impl ScriptedOob {
    fn new(protocol: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            acquired: AtomicUsize::new(0),
            polled: AtomicUsize::new(0),
            protocol,
        })
    }
}

#[async_trait]
impl OobProvider for ScriptedOob {
    async fn acquire(&self) -> Result<OobToken, OobError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(OobToken {
            url: "c0ffee.oob.test".to_string(),
            token: "c0ffee".to_string(),
        })
    }

    async fn poll(&self, token: &str, _timeout: Duration) -> Result<Option<String>, OobError> {
        self.polled.fetch_add(1, Ordering::SeqCst);
        assert_eq!(token, "c0ffee");
        Ok(self.protocol.map(str::to_string))
    }
}

fn collector() -> (ReportCallback, Arc<Mutex<Vec<SequenceReport>>>) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let callback: ReportCallback = Arc::new(move |report: &SequenceReport| sink.lock().push(report.clone()));
    (callback, reports)
}

fn engine(transport: Arc<ScriptedTransport>) -> Engine {
    Engine::new(EngineConfig::default().with_oob_timeout(1))
        .unwrap()
        .with_transport(transport)
}

async fn run(engine: &Engine, yaml: &str) -> (template_engine::ExecutionSummary, Vec<SequenceReport>) {
    let template = Arc::new(Template::from_yaml(yaml).unwrap());
    let (callback, reports) = collector();
    let summary = engine
        .execute(template, TARGET, &VarMap::new(), CancellationToken::new(), callback)
        .await
        .unwrap();
    let reports = reports.lock().clone();
    (summary, reports)
}

const CHAINED: &str = r#"
id: chained-token
info:
  name: chained token
  severity: medium
requests:
  - raw:
      - |
        GET /login HTTP/1.1
        Host: {{Hostname}}
      - |
        GET /next?t={{token}} HTTP/1.1
        Host: {{Hostname}}
    extractors:
      - type: regex
        name: token
        internal: true
        group: 1
        regex:
          - 'token=([a-z0-9]+)'
      - type: regex
        name: greeting
        part: body
        regex:
          - 'welcome [a-z]+'
    matchers:
      - type: word
        words:
          - "welcome back"
"#;

#[tokio::test]
async fn test_extracted_value_reaches_next_request() {
    let transport = ScriptedTransport::new(vec![
        ("/login", "HTTP/1.1 200 OK\r\n\r\ntoken=abc123"),
        ("/next?t=abc123", "HTTP/1.1 200 OK\r\n\r\nwelcome back"),
    ]);
    let engine = engine(transport.clone());
    let (summary, reports) = run(&engine, CHAINED).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].starts_with("GET /next?t=abc123 HTTP/1.1\r\n"));
    assert!(sent[1].contains("Host: target.test\r\n"));

    assert!(summary.matched);
    assert_eq!(summary.requests_sent, 2);
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.matched);
    assert!(!report.responses[0].matched);
    assert!(report.responses[1].matched);
    // internal values stay out of the report
    assert!(!report.extracted.contains_key("token"));
    assert_eq!(report.extracted["greeting"].to_string(), "welcome back");
}

fn referencing_template(deferred: bool) -> String {
    format!(
        r#"
id: exchange-reference
info:
  name: exchange reference
requests:
  - raw:
      - |
        GET /first HTTP/1.1
        Host: {{{{Hostname}}}}
      - |
        GET /second HTTP/1.1
        Host: {{{{Hostname}}}}
    req-condition: {}
    matchers-condition: and
    matchers:
      - type: word
        id: 1
        words:
          - "first-page"
      - type: word
        words:
          - "second-page"
"#,
        deferred
    )
}

#[tokio::test]
async fn test_deferred_and_immediate_matching_agree() {
    for deferred in [true, false] {
        let transport = ScriptedTransport::new(vec![
            ("/first", "HTTP/1.1 200 OK\r\n\r\nfirst-page"),
            ("/second", "HTTP/1.1 200 OK\r\n\r\nsecond-page"),
        ]);
        let engine = engine(transport.clone());
        let (summary, reports) = run(&engine, &referencing_template(deferred)).await;
        assert!(summary.matched, "deferred = {}", deferred);
        assert!(!reports[0].responses[0].matched);
        assert!(reports[0].responses[1].matched);
        assert_eq!(transport.sent().len(), 2);
    }
}

#[tokio::test]
async fn test_cookie_reuse() {
    let yaml = r#"
id: cookie-reuse
info:
  name: cookie reuse
requests:
  - raw:
      - |
        GET /login HTTP/1.1
        Host: {{Hostname}}
      - |
        GET /profile HTTP/1.1
        Host: {{Hostname}}
        Cookie: theme=dark
    cookie-reuse: true
    matchers:
      - type: status
        status:
          - 200
"#;
    let transport = ScriptedTransport::new(vec![
        ("/login", "HTTP/1.1 200 OK\r\nSet-Cookie: session=xyz; Path=/\r\n\r\nok"),
        ("/profile", "HTTP/1.1 200 OK\r\n\r\nprofile"),
    ]);
    let engine = engine(transport.clone());
    let (summary, _) = run(&engine, yaml).await;
    assert!(summary.matched);
    let sent = transport.sent();
    assert!(sent[1].contains("Cookie: session=xyz; theme=dark\r\n"));
}

#[tokio::test]
async fn test_stop_at_first_match() {
    let yaml = r#"
id: first-hit
info:
  name: first hit
requests:
  - method: GET
    path:
      - "{{BaseURL}}/a"
      - "{{BaseURL}}/b"
      - "{{BaseURL}}/c"
    stop-at-first-match: true
    matchers:
      - type: status
        status:
          - 200
"#;
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let engine = engine(transport.clone());
    let (summary, reports) = run(&engine, yaml).await;
    assert!(summary.matched);
    assert_eq!(transport.sent().len(), 1);
    assert!(transport.sent()[0].starts_with("GET /a HTTP/1.1\r\n"));
    assert_eq!(reports[0].responses.len(), 1);
}

#[tokio::test]
async fn test_cancelled_execution_still_reports() {
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let engine = engine(transport.clone());
    let template = Arc::new(Template::from_yaml(CHAINED).unwrap());
    let (callback, reports) = collector();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = engine
        .execute(template, TARGET, &VarMap::new(), cancel, callback)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert!(!summary.matched);
    assert_eq!(summary.requests_sent, 0);
    assert!(transport.sent().is_empty());

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].cancelled);
}

const OOB_TEMPLATE: &str = r#"
id: oob-callback
info:
  name: oob callback
  severity: critical
requests:
  - raw:
      - |
        GET /?callback=http://{{interactsh-url}} HTTP/1.1
        Host: {{Hostname}}
    matchers:
      - type: word
        part: interactsh_protocol
        words:
          - "dns"
"#;

#[tokio::test]
async fn test_oob_polling() {
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let provider = ScriptedOob::new(Some("dns"));
    let engine = engine(transport.clone())
        .with_oob_registry(OobRegistry::new().with_provider("scripted", provider.clone()));

    let (summary, _) = run(&engine, OOB_TEMPLATE).await;
    assert!(summary.matched);
    assert_eq!(provider.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(provider.polled.load(Ordering::SeqCst), 1);
    assert!(transport.sent()[0].contains("callback=http://c0ffee.oob.test"));
}

#[tokio::test]
async fn test_oob_without_interaction() {
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let provider = ScriptedOob::new(None);
    let engine = engine(transport).with_oob_registry(OobRegistry::new().with_provider("scripted", provider));
    let (summary, _) = run(&engine, OOB_TEMPLATE).await;
    assert!(!summary.matched);
}

#[tokio::test]
async fn test_oob_checker_replaces_polling() {
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let provider = ScriptedOob::new(Some("http"));
    let engine = engine(transport)
        .with_oob_registry(OobRegistry::new().with_provider("scripted", provider.clone()))
        .with_oob_checker(Arc::new(|token: &str| (token == "c0ffee").then(|| "dns".to_string())));

    let (summary, _) = run(&engine, OOB_TEMPLATE).await;
    assert!(summary.matched);
    assert_eq!(provider.polled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_oob_acquisition_failure_aborts_template() {
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let engine = engine(transport.clone());
    let template = Arc::new(Template::from_yaml(OOB_TEMPLATE).unwrap());
    let (callback, reports) = collector();
    let result = engine
        .execute(template, TARGET, &VarMap::new(), CancellationToken::new(), callback)
        .await;
    assert!(result.is_err());
    assert!(transport.sent().is_empty());
    assert!(reports.lock().is_empty());
}

#[tokio::test]
async fn test_scan_runs_every_pair() {
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let engine = engine(transport.clone());
    let yaml = r#"
id: status-only
info:
  name: status only
requests:
  - method: GET
    path:
      - "{{BaseURL}}/"
"#;
    let templates = vec![Arc::new(Template::from_yaml(yaml).unwrap())];
    let targets = vec!["http://one.test".to_string(), "two.test:8080".to_string()];
    let (callback, reports) = collector();

    let summaries = engine
        .scan(&templates, &targets, &VarMap::new(), CancellationToken::new(), callback)
        .await;
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|summary| summary.matched));
    assert_eq!(reports.lock().len(), 2);

    let sent = transport.sent();
    assert!(sent.iter().any(|packet| packet.contains("Host: two.test:8080\r\n")));
}

#[tokio::test]
async fn test_array_variable_passes_rederive_template_variables() {
    let transport = ScriptedTransport::new(vec![("/", "HTTP/1.1 200 OK\r\n\r\nok")]);
    let engine = engine(transport.clone());
    let yaml = r#"
id: derived-path
info:
  name: derived path
variables:
  full: "{{prefix}}/admin"
requests:
  - raw:
      - |
        GET {{full}} HTTP/1.1
        Host: {{Hostname}}
"#;
    let template = Arc::new(Template::from_yaml(yaml).unwrap());
    let mut vars = VarMap::new();
    vars.insert("prefix".to_string(), json!(["/a", "/b"]));
    let (callback, reports) = collector();
    let summary = engine
        .execute(template, TARGET, &vars, CancellationToken::new(), callback)
        .await
        .unwrap();

    assert_eq!(summary.requests_sent, 2);
    assert_eq!(reports.lock().len(), 2);
    let lines: Vec<String> = transport
        .sent()
        .iter()
        .map(|packet| packet.lines().next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(lines, vec!["GET /a/admin HTTP/1.1", "GET /b/admin HTTP/1.1"]);
}

/// Replies like a tiny Redis: `INFO` gets a version banner, anything else `+PONG`
struct ScriptedNetwork {
    addresses: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            addresses: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl NetworkTransport for ScriptedNetwork {
    async fn converse(
        &self,
        address: &str,
        plan: &NetworkPlan,
        _timeout: Duration,
    ) -> Result<NetworkExchange, TransportError> {
        self.addresses.lock().push(address.to_string());
        let mut exchange = NetworkExchange::default();
        for step in &plan.steps {
            exchange.sent.extend_from_slice(&step.data);
            let reply: &[u8] = if step.data.starts_with(b"INFO") {
                b"redis_version:7.0.5\r\n"
            } else {
                b"+PONG\r\n"
            };
            exchange.received.extend_from_slice(reply);
            if let Some(name) = &step.name {
                exchange.named.push((name.clone(), reply.to_vec()));
            }
        }
        Ok(exchange)
    }
}

const REDIS_TEMPLATE: &str = r#"
id: redis-info
info:
  name: redis info
  severity: high
network:
  - inputs:
      - data: "{{cmd}}\r\n"
        read: 64
        name: reply
    host:
      - "{{Host}}:6379"
    payloads:
      cmd:
        - PING
        - INFO
        - QUIT
    stop-at-first-match: true
    matchers-condition: and
    matchers:
      - type: word
        words:
          - redis_version
      - type: dsl
        dsl:
          - "contains(reply, 'redis_version') && contains(data, 'redis_version')"
    extractors:
      - type: regex
        name: version
        group: 1
        regex:
          - 'redis_version:([0-9.]+)'
"#;

#[tokio::test]
async fn test_network_conversation() {
    let transport = ScriptedTransport::new(Vec::new());
    let network = ScriptedNetwork::new();
    let engine = engine(transport.clone()).with_network_transport(network.clone());

    let (summary, reports) = run(&engine, REDIS_TEMPLATE).await;
    assert!(summary.matched);
    assert_eq!(summary.requests_sent, 2);
    assert!(transport.sent().is_empty());
    assert_eq!(
        network.addresses.lock().clone(),
        vec!["target.test:6379".to_string(), "target.test:6379".to_string()]
    );

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.kind, SequenceKind::Network);
    assert_eq!(report.responses.len(), 2);
    assert!(!report.responses[0].matched);
    assert!(report.responses[1].matched);
    assert_eq!(report.responses[1].request, b"INFO\r\n".to_vec());
    assert_eq!(report.extracted["version"], ExtractedValue::Single("7.0.5".into()));
}

/// Answers the first request, then panics
struct FailingTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for FailingTransport {
    async fn send(
        &self,
        request: &PreparedRequest,
        _options: &SendOptions,
    ) -> Result<TransportResponse, TransportError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            panic!("connection pool corrupted");
        }
        Ok(TransportResponse {
            packet: b"HTTP/1.1 200 OK\r\n\r\nfirst".to_vec(),
            duration: Duration::from_millis(1),
            url: request.url(),
        })
    }
}

#[tokio::test]
async fn test_failing_sequence_still_reports() {
    let engine = Engine::new(EngineConfig::default())
        .unwrap()
        .with_transport(Arc::new(FailingTransport {
            calls: AtomicUsize::new(0),
        }));
    let yaml = r#"
id: two-steps
info:
  name: two steps
requests:
  - raw:
      - |
        GET /one HTTP/1.1
        Host: {{Hostname}}
      - |
        GET /two HTTP/1.1
        Host: {{Hostname}}
    matchers:
      - type: word
        words:
          - first
"#;
    let (summary, reports) = run(&engine, yaml).await;
    assert!(summary.matched);
    assert_eq!(summary.errors.len(), 1);

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.matched);
    assert_eq!(report.responses.len(), 1);
    let error = report.error.clone().unwrap_or_default();
    assert!(error.contains("connection pool corrupted"));
}
