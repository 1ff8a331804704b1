//! Template execution against live targets
//!
//! [`Engine::execute`] runs one template against one target. Sequences run
//! concurrently under a semaphore; requests inside a sequence are rendered
//! lazily and sent strictly in order so values extracted from one response
//! reach the next packet. [`Engine::scan`] adds the template-level pool.

use crate::codec;
use crate::config::EngineConfig;
use crate::dsl::{DslEvaluator, Evaluator, VarMap};
use crate::error::EngineResult;
use crate::extractor::Extractor;
use crate::generator::{
    network_addresses, render_network, render_request, variable_combinations, PreparedRequest, TargetInfo,
};
use crate::matcher::Matcher;
use crate::oob::{OobChecker, OobProvider, OobRegistry, OobToken};
use crate::packet::RawPacket;
use crate::result::{ExchangeRecord, ExecutionSummary, ExtractedValue, SequenceKind, SequenceReport};
use crate::scope::{EvalContext, MaterialCache, OobContext, OOB_PROTOCOL_VAR};
use crate::template::{NetworkSequence, RequestSequence, Template, TemplateRequests};
use crate::transport::{NetworkTransport, ReqwestTransport, SendOptions, TcpNetworkTransport, Transport};
use crate::vars::{VarEntry, VariableStore};
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives every sequence report as soon as the sequence finishes
pub type ReportCallback = Arc<dyn Fn(&SequenceReport) + Send + Sync>;

/// Variable names an acquired OOB address is published under
const OOB_URL_VARS: [&str; 3] = ["interactsh-url", "interactsh_url", "reverse_url"];
const OOB_TOKEN_VAR: &str = "reverse_token";

/// Template execution engine
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    transport: Arc<dyn Transport>,
    network: Arc<dyn NetworkTransport>,
    evaluator: Arc<dyn Evaluator>,
    oob: OobRegistry,
    checker: Option<OobChecker>,
    cache: Arc<MaterialCache>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("oob", &self.oob)
            .field("checker", &self.checker.is_some())
            .finish()
    }
}

struct OobSession {
    token: OobToken,
    provider: Arc<dyn OobProvider>,
    context: OobContext,
}

impl OobSession {
    fn vars(&self) -> impl Iterator<Item = (String, Value)> + '_ {
        OOB_URL_VARS
            .iter()
            .map(|name| (name.to_string(), Value::String(self.token.url.clone())))
            .chain(std::iter::once((
                OOB_TOKEN_VAR.to_string(),
                Value::String(self.token.token.clone()),
            )))
    }
}

/// State shared by the sequences of one execution
struct RunState {
    template: Arc<Template>,
    target: TargetInfo,
    base: VarMap,
    store: Mutex<VariableStore>,
    oob: OnceCell<OobSession>,
    polled: tokio::sync::Mutex<Option<String>>,
    cancel: CancellationToken,
    callback: ReportCallback,
    requests_sent: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

impl RunState {
    /// Current variables: target and caller values, the OOB address, the
    /// template store (including extracted values) and the pass overrides
    fn vars(&self, overrides: &VarMap, evaluator: &dyn Evaluator) -> VarMap {
        let mut base = self.base.clone();
        if let Some(session) = self.oob.get() {
            base.extend(session.vars());
        }
        // Derived entries must see this pass's scalar values, not the arrays
        base.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut vars = self.store.lock().to_map(&base, evaluator);
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    fn oob_context(&self) -> Option<&OobContext> {
        self.oob.get().map(|session| &session.context)
    }

    fn record_error(&self, message: String) {
        self.errors.lock().push(message);
    }

    /// Write extracted values back so later requests can use them
    fn store_extracted(&self, name: &str, value: &ExtractedValue) {
        self.store
            .lock()
            .set(name, VarEntry::Raw(Value::String(value.to_string())));
    }
}

/// Array-valued variables split into one scalar assignment per combination
fn array_overrides(resolved: &VarMap) -> Vec<VarMap> {
    variable_combinations(resolved)
        .into_iter()
        .map(|combination| {
            combination
                .into_iter()
                .filter(|(name, _)| matches!(resolved.get(name), Some(Value::Array(items)) if !items.is_empty()))
                .collect()
        })
        .collect()
}

/// Run extractors in order against one exchange. Each extractor sees the
/// values of the ones before it.
pub(crate) fn run_extractors<'e>(
    extractors: &'e [Extractor],
    ctx: &EvalContext<'_>,
    current: Option<&ExchangeRecord>,
) -> Vec<(&'e Extractor, ExtractedValue)> {
    let mut previous = VarMap::new();
    let mut out = Vec::new();
    for extractor in extractors {
        let values = extractor.execute(ctx, current, &previous);
        if let Some(value) = ExtractedValue::collapse(values) {
            previous.insert(extractor.name.clone(), value.to_value());
            out.push((extractor, value));
        }
    }
    out
}

/// Per-pass bookkeeping shared by HTTP and network sequences
struct Pass {
    exchanges: Vec<ExchangeRecord>,
    extracted: IndexMap<String, ExtractedValue>,
    matched: bool,
    cancelled: bool,
    error: Option<String>,
}

impl Pass {
    fn new() -> Self {
        Self {
            exchanges: Vec::new(),
            extracted: IndexMap::new(),
            matched: false,
            cancelled: false,
            error: None,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "unknown panic".to_string(),
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            transport: Arc::new(ReqwestTransport::new(config.proxy.clone())),
            network: Arc::new(TcpNetworkTransport),
            evaluator: Arc::new(DslEvaluator::new()),
            oob: OobRegistry::new(),
            checker: None,
            cache: Arc::new(MaterialCache::new(config.material_cache_ttl())),
            config: Arc::new(config),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_network_transport(mut self, network: Arc<dyn NetworkTransport>) -> Self {
        self.network = network;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_oob_registry(mut self, registry: OobRegistry) -> Self {
        self.oob = registry;
        self
    }

    /// Look interactions up through `checker` instead of polling the provider
    pub fn with_oob_checker(mut self, checker: OobChecker) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn acquire_oob(&self, template_id: &str) -> EngineResult<OobSession> {
        let provider = self.oob.get(self.config.default_oob_provider.as_deref())?;
        let token = provider.acquire().await?;
        info!(template_id = %template_id, url = %token.url, "acquired OOB address");
        Ok(OobSession {
            context: OobContext {
                token: token.token.clone(),
                checker: self.checker.clone(),
            },
            token,
            provider,
        })
    }

    /// Poll once per execution until an interaction shows up
    async fn poll_oob(&self, state: &RunState) -> Option<String> {
        let session = state.oob.get()?;
        let mut polled = state.polled.lock().await;
        if let Some(protocol) = polled.as_ref() {
            return Some(protocol.clone());
        }
        match session
            .provider
            .poll(&session.token.token, self.config.oob_timeout())
            .await
        {
            Ok(Some(protocol)) => {
                debug!(token = %session.token.token, protocol = %protocol, "OOB interaction observed");
                *polled = Some(protocol.clone());
                Some(protocol)
            }
            Ok(None) => Some(String::new()),
            Err(err) => {
                warn!(error = %err, "OOB poll failed");
                state.record_error(err.to_string());
                Some(String::new())
            }
        }
    }

    fn needs_poll(&self, state: &RunState, matcher: Option<&Matcher>) -> bool {
        state.template.needs_oob
            && self.checker.is_none()
            && matcher.map_or(false, Matcher::uses_oob)
    }

    /// Run one template against one target. Every sequence report goes to
    /// `callback`, cancelled ones included.
    pub async fn execute(
        &self,
        template: Arc<Template>,
        target: &str,
        vars: &VarMap,
        cancel: CancellationToken,
        callback: ReportCallback,
    ) -> EngineResult<ExecutionSummary> {
        let info = TargetInfo::parse(target)?;
        let mut base = info.to_vars();
        base.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        let state = Arc::new(RunState {
            store: Mutex::new(template.variables.clone()),
            template: template.clone(),
            target: info,
            base,
            oob: OnceCell::new(),
            polled: tokio::sync::Mutex::new(None),
            cancel,
            callback,
            requests_sent: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
        });

        if template.needs_oob {
            if let Err(err) = state
                .oob
                .get_or_try_init(|| self.acquire_oob(&template.id))
                .await
            {
                error!(template_id = %template.id, error = %err, "OOB acquisition failed, template aborted");
                return Err(err);
            }
        }

        info!(template_id = %template.id, target = %target, sequences = template.requests.len(), "executing template");
        let permits = Arc::new(Semaphore::new(self.config.sequence_concurrency));
        let mut tasks = JoinSet::new();
        for index in 0..template.requests.len() {
            let engine = self.clone();
            let state = state.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                match &state.template.requests {
                    TemplateRequests::Http(sequences) => match sequences.get(index) {
                        Some(sequence) => engine.run_http_sequence(&state, index, sequence).await,
                        None => Vec::new(),
                    },
                    TemplateRequests::Network(sequences) => match sequences.get(index) {
                        Some(sequence) => engine.run_network_sequence(&state, index, sequence).await,
                        None => Vec::new(),
                    },
                }
            });
        }

        let mut summary = ExecutionSummary {
            template_id: template.id.clone(),
            target: target.to_string(),
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reports) => {
                    for report in reports {
                        summary.sequences += 1;
                        summary.matched |= report.matched;
                        summary.cancelled |= report.cancelled;
                    }
                }
                Err(err) => {
                    error!(template_id = %template.id, error = %err, "sequence task failed");
                    state.record_error(format!("sequence task failed: {}", err));
                }
            }
        }

        summary.requests_sent = state.requests_sent.load(Ordering::Relaxed);
        summary.errors = std::mem::take(&mut *state.errors.lock());
        self.cache.purge_expired();
        info!(
            template_id = %template.id,
            target = %target,
            matched = summary.matched,
            requests = summary.requests_sent,
            "template finished"
        );
        Ok(summary)
    }

    /// Run every template against every target under the template pool
    pub async fn scan(
        &self,
        templates: &[Arc<Template>],
        targets: &[String],
        vars: &VarMap,
        cancel: CancellationToken,
        callback: ReportCallback,
    ) -> Vec<ExecutionSummary> {
        let permits = Arc::new(Semaphore::new(self.config.template_concurrency));
        let mut tasks = JoinSet::new();
        for target in targets {
            for template in templates {
                let engine = self.clone();
                let permits = permits.clone();
                let template = template.clone();
                let target = target.clone();
                let vars = vars.clone();
                let cancel = cancel.clone();
                let callback = callback.clone();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    if cancel.is_cancelled() {
                        return ExecutionSummary {
                            template_id: template.id.clone(),
                            target,
                            cancelled: true,
                            ..Default::default()
                        };
                    }
                    let id = template.id.clone();
                    match engine.execute(template, &target, &vars, cancel, callback).await {
                        Ok(summary) => summary,
                        Err(err) => {
                            warn!(template_id = %id, target = %target, error = %err, "template skipped");
                            ExecutionSummary {
                                template_id: id,
                                target,
                                errors: vec![err.to_string()],
                                ..Default::default()
                            }
                        }
                    }
                });
            }
        }

        let mut summaries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => summaries.push(summary),
                Err(err) => error!(error = %err, "template task failed"),
            }
        }
        summaries
    }

    async fn send(
        &self,
        state: &RunState,
        prepared: &PreparedRequest,
        options: &SendOptions,
        index: usize,
    ) -> ExchangeRecord {
        if self.config.debug_request {
            info!(request = %codec::from_bytes(prepared.packet.clone()), "sending");
        }
        state.requests_sent.fetch_add(1, Ordering::Relaxed);
        let mut record = ExchangeRecord {
            index,
            url: prepared.url(),
            is_https: prepared.is_https,
            request: prepared.packet.clone(),
            ..Default::default()
        };
        match self.transport.send(prepared, options).await {
            Ok(response) => {
                if self.config.debug_response {
                    info!(response = %codec::from_bytes(response.packet.clone()), "received");
                }
                record.response = response.packet;
                record.duration = response.duration.as_secs_f64();
            }
            Err(err) => {
                warn!(
                    template_id = %state.template.id,
                    sequence = prepared.sequence_index,
                    request = index,
                    error = %err,
                    "request failed"
                );
                state.record_error(format!("{}: {}", record.url, err));
                record.error = Some(err.to_string());
            }
        }
        record
    }

    /// Extract from the newest exchange and fold the values back into the store
    fn extract_latest(
        &self,
        state: &RunState,
        extractors: &[Extractor],
        pass: &mut Pass,
        vars: &VarMap,
    ) {
        if extractors.is_empty() {
            return;
        }
        let results = {
            let ctx = EvalContext::new(&pass.exchanges, vars, &*self.evaluator, &self.cache)
                .with_oob(state.oob_context());
            run_extractors(extractors, &ctx, pass.exchanges.last())
        };
        for (extractor, value) in results {
            debug!(template_id = %state.template.id, extractor = %extractor.name, value = %value, "extracted");
            state.store_extracted(&extractor.name, &value);
            if !extractor.internal {
                pass.extracted.insert(extractor.name.clone(), value);
            }
        }
    }

    /// Match the newest exchange; true when it matched
    fn match_latest(&self, state: &RunState, matcher: &Matcher, pass: &mut Pass, vars: &VarMap) -> bool {
        let hit = {
            let ctx = EvalContext::new(&pass.exchanges, vars, &*self.evaluator, &self.cache)
                .with_oob(state.oob_context());
            matcher.execute(&ctx, pass.exchanges.last())
        };
        if let Some(latest) = pass.exchanges.last_mut() {
            latest.matched = hit;
        }
        pass.matched |= hit;
        hit
    }

    /// Match every recorded exchange after the sequence completed
    fn match_all(&self, state: &RunState, matcher: &Matcher, pass: &mut Pass, vars: &VarMap) {
        let hits: Vec<bool> = {
            let ctx = EvalContext::new(&pass.exchanges, vars, &*self.evaluator, &self.cache)
                .with_oob(state.oob_context());
            pass.exchanges
                .iter()
                .map(|exchange| matcher.execute(&ctx, Some(exchange)))
                .collect()
        };
        for (exchange, hit) in pass.exchanges.iter_mut().zip(hits) {
            exchange.matched = hit;
            pass.matched |= hit;
        }
    }

    fn finish(
        &self,
        state: &RunState,
        sequence_index: usize,
        kind: SequenceKind,
        matcher: Option<&Matcher>,
        pass: Pass,
    ) -> SequenceReport {
        // Extractor-only sequences report a hit when they extracted something
        let matched = match matcher {
            Some(_) => pass.matched,
            None => !pass.extracted.is_empty(),
        };
        let report = SequenceReport {
            template_id: state.template.id.clone(),
            target: state.target.url.clone(),
            sequence_index,
            kind,
            responses: pass.exchanges,
            matched,
            extracted: pass.extracted,
            cancelled: pass.cancelled,
            error: pass.error,
        };
        if report.matched {
            info!(
                template_id = %report.template_id,
                target = %report.target,
                sequence = sequence_index,
                severity = %state.template.info.severity,
                "template matched"
            );
        }
        (state.callback)(&report);
        report
    }

    /// Keep what the pass gathered before it panicked and flag the report
    fn record_panic(&self, state: &RunState, index: usize, pass: &mut Pass, payload: Box<dyn Any + Send>) {
        let message = format!("sequence {} panicked: {}", index, panic_message(payload));
        error!(template_id = %state.template.id, sequence = index, error = %message, "sequence aborted");
        state.record_error(message.clone());
        pass.error = Some(message);
    }

    async fn run_http_sequence(
        &self,
        state: &RunState,
        index: usize,
        sequence: &RequestSequence,
    ) -> Vec<SequenceReport> {
        let resolved = state.vars(&VarMap::new(), &*self.evaluator);
        let mut reports = Vec::new();
        for overrides in array_overrides(&resolved) {
            let mut pass = Pass::new();
            let run = AssertUnwindSafe(self.run_http_pass(state, index, sequence, &overrides, &mut pass));
            if let Err(payload) = run.catch_unwind().await {
                self.record_panic(state, index, &mut pass, payload);
            }
            let report = self.finish(state, index, SequenceKind::Http, sequence.matcher.as_ref(), pass);
            let cancelled = report.cancelled;
            reports.push(report);
            if cancelled {
                break;
            }
        }
        reports
    }

    async fn run_http_pass(
        &self,
        state: &RunState,
        index: usize,
        sequence: &RequestSequence,
        overrides: &VarMap,
        pass: &mut Pass,
    ) {
        let evaluator = &*self.evaluator;
        let poll = self.needs_poll(state, sequence.matcher.as_ref());
        let defer = sequence.after_requested || poll;
        let options = send_options(&self.config, sequence);
        let mut jar: IndexMap<String, String> = IndexMap::new();

        'requests: for (template_index, request) in sequence.requests.iter().enumerate() {
            let vars = state.vars(overrides, evaluator);
            let prepared = render_request(
                index,
                template_index,
                request,
                sequence,
                &vars,
                evaluator,
                state.target.is_https(),
            );
            for mut prepared in prepared {
                if state.cancel.is_cancelled() {
                    debug!(template_id = %state.template.id, sequence = index, "cancelled before send");
                    pass.cancelled = true;
                    break 'requests;
                }
                if sequence.cookie_reuse && !jar.is_empty() {
                    let mut packet = RawPacket::parse(&prepared.packet);
                    packet.merge_cookies(&jar);
                    prepared.packet = packet.to_bytes();
                }

                let record = self
                    .send(state, &prepared, &options, pass.exchanges.len() + 1)
                    .await;
                if sequence.cookie_reuse {
                    jar.extend(RawPacket::parse(&record.response).set_cookies());
                }
                pass.exchanges.push(record);

                let vars = state.vars(overrides, evaluator);
                self.extract_latest(state, &sequence.extractors, pass, &vars);
                if defer {
                    continue;
                }
                if let Some(matcher) = &sequence.matcher {
                    let vars = state.vars(overrides, evaluator);
                    if self.match_latest(state, matcher, pass, &vars) && sequence.stop_at_first_match {
                        debug!(template_id = %state.template.id, sequence = index, "stopping at first match");
                        break 'requests;
                    }
                }
            }
        }

        if defer {
            if let Some(matcher) = &sequence.matcher {
                let mut vars = state.vars(overrides, evaluator);
                if poll && !pass.cancelled {
                    if let Some(protocol) = self.poll_oob(state).await {
                        vars.insert(OOB_PROTOCOL_VAR.to_string(), Value::String(protocol));
                    }
                }
                self.match_all(state, matcher, pass, &vars);
            }
        }
    }

    async fn run_network_sequence(
        &self,
        state: &RunState,
        index: usize,
        sequence: &NetworkSequence,
    ) -> Vec<SequenceReport> {
        let resolved = state.vars(&VarMap::new(), &*self.evaluator);
        let mut reports = Vec::new();
        for overrides in array_overrides(&resolved) {
            let mut pass = Pass::new();
            let run = AssertUnwindSafe(self.run_network_pass(state, index, sequence, &overrides, &mut pass));
            if let Err(payload) = run.catch_unwind().await {
                self.record_panic(state, index, &mut pass, payload);
            }
            let report = self.finish(state, index, SequenceKind::Network, sequence.matcher.as_ref(), pass);
            let cancelled = report.cancelled;
            reports.push(report);
            if cancelled {
                break;
            }
        }
        reports
    }

    async fn run_network_pass(
        &self,
        state: &RunState,
        index: usize,
        sequence: &NetworkSequence,
        overrides: &VarMap,
        pass: &mut Pass,
    ) {
        let evaluator = &*self.evaluator;
        let poll = self.needs_poll(state, sequence.matcher.as_ref());
        let timeout = self.config.request_timeout();

        let vars = state.vars(overrides, evaluator);
        let addresses = network_addresses(sequence, &state.target, &vars, evaluator);
        let plans = render_network(sequence, &vars, evaluator);

        'conversations: for address in &addresses {
            for plan in &plans {
                if state.cancel.is_cancelled() {
                    pass.cancelled = true;
                    break 'conversations;
                }
                state.requests_sent.fetch_add(1, Ordering::Relaxed);
                let mut record = ExchangeRecord {
                    index: pass.exchanges.len() + 1,
                    url: address.clone(),
                    ..Default::default()
                };
                match self.network.converse(address, plan, timeout).await {
                    Ok(exchange) => {
                        for (name, chunk) in &exchange.named {
                            state.store.lock().set(
                                name.clone(),
                                VarEntry::Raw(Value::String(codec::from_bytes(chunk.clone()))),
                            );
                        }
                        record.request = exchange.sent;
                        record.response = exchange.received;
                        record.duration = exchange.duration.as_secs_f64();
                    }
                    Err(err) => {
                        warn!(template_id = %state.template.id, address = %address, error = %err, "conversation failed");
                        state.record_error(format!("{}: {}", address, err));
                        record.request = plan.steps.iter().flat_map(|s| s.data.clone()).collect();
                        record.error = Some(err.to_string());
                    }
                }
                let data = Value::String(codec::from_bytes(record.response.clone()));
                pass.exchanges.push(record);

                let mut vars = state.vars(overrides, evaluator);
                vars.insert("data".to_string(), data.clone());
                self.extract_latest(state, &sequence.extractors, pass, &vars);
                if poll {
                    continue;
                }
                if let Some(matcher) = &sequence.matcher {
                    let mut vars = state.vars(overrides, evaluator);
                    vars.insert("data".to_string(), data);
                    if self.match_latest(state, matcher, pass, &vars) && sequence.stop_at_first_match {
                        break 'conversations;
                    }
                }
            }
        }

        if poll {
            if let Some(matcher) = &sequence.matcher {
                let mut vars = state.vars(overrides, evaluator);
                if !pass.cancelled {
                    if let Some(protocol) = self.poll_oob(state).await {
                        vars.insert(OOB_PROTOCOL_VAR.to_string(), Value::String(protocol));
                    }
                }
                self.match_all(state, matcher, pass, &vars);
            }
        }
    }
}

/// A callback that drops every report
pub fn discard_reports() -> ReportCallback {
    Arc::new(|_: &SequenceReport| {})
}

/// Transport options for one HTTP sequence
pub fn send_options(config: &EngineConfig, sequence: &RequestSequence) -> SendOptions {
    SendOptions {
        timeout: config.request_timeout(),
        follow_redirects: sequence.follow_redirects,
        max_redirects: sequence.max_redirects,
        max_size: sequence.max_size.or(config.max_response_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_array_overrides() {
        let mut resolved = VarMap::new();
        resolved.insert("paths".into(), json!(["/a", "/b"]));
        resolved.insert("host".into(), json!("example.com"));
        let overrides = array_overrides(&resolved);
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides[0].len(), 1);
        assert_eq!(overrides[1]["paths"], json!("/b"));
        assert_eq!(array_overrides(&VarMap::new()), vec![VarMap::new()]);
    }

    #[test]
    fn test_engine_rejects_bad_config() {
        assert!(Engine::new(EngineConfig::default().with_sequence_concurrency(0)).is_err());
        assert!(Engine::new(EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_send_options_follow_sequence() {
        let sequence = RequestSequence {
            follow_redirects: true,
            max_redirects: 5,
            ..Default::default()
        };
        let options = send_options(&EngineConfig::default().with_request_timeout(3), &sequence);
        assert_eq!(options.timeout, Duration::from_secs(3));
        assert!(options.follow_redirects);
        assert_eq!(options.max_redirects, 5);
    }
}
