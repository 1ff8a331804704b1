use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use template_engine::{Engine, ReportCallback, SequenceReport, Severity, Template, VarMap};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod logging;

use config::ScanConfig;

/// Template Scan - run YAML detection templates against HTTP and TCP targets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Template files or directories (searched recursively for .yaml/.yml)
    #[arg(short = 't', long = "template", required = true)]
    templates: Vec<PathBuf>,

    /// Target URL or host[:port]
    #[arg(short = 'u', long = "target")]
    targets: Vec<String>,

    /// File with one target per line
    #[arg(short = 'l', long = "list")]
    list: Option<PathBuf>,

    /// TOML configuration file with [engine] and [logging] sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only run templates carrying one of these tags
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Extra variables as name=value
    #[arg(long = "var")]
    vars: Vec<String>,

    /// Templates running at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Sequences running at once inside a template
    #[arg(long)]
    sequence_concurrency: Option<usize>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Upstream HTTP proxy
    #[arg(long)]
    proxy: Option<String>,

    /// Print reports as JSON lines
    #[arg(long)]
    json: bool,

    /// Print every sequence report, not only matches
    #[arg(long)]
    all: bool,

    /// Log every request packet
    #[arg(long)]
    debug_req: bool,

    /// Log every response packet
    #[arg(long)]
    debug_resp: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Layer command line flags over the configuration file
fn merge_args(mut config: ScanConfig, args: &Args) -> ScanConfig {
    if let Some(value) = args.concurrency {
        config.engine.template_concurrency = value;
    }
    if let Some(value) = args.sequence_concurrency {
        config.engine.sequence_concurrency = value;
    }
    if let Some(value) = args.timeout {
        config.engine.request_timeout = value;
    }
    if let Some(proxy) = &args.proxy {
        config.engine.proxy = Some(proxy.clone());
    }
    config.engine.debug_request |= args.debug_req;
    config.engine.debug_response |= args.debug_resp;
    if args.verbose > 0 {
        config.logging.level = logging::levels::from_verbosity(args.verbose).to_string();
    }
    if let Some(path) = &args.log_file {
        config.logging.log_file = Some(path.display().to_string());
    }
    config
}

fn parse_vars(pairs: &[String]) -> Result<VarMap> {
    pairs
        .iter()
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("variable {} is not name=value", pair))?;
            Ok((name.trim().to_string(), Value::String(value.to_string())))
        })
        .collect()
}

fn collect_template_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    let entries = std::fs::read_dir(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mut children: Vec<PathBuf> = entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect();
    children.sort();
    for child in children {
        if child.is_dir() {
            collect_template_files(&child, out)?;
        } else if matches!(
            child.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(child);
        }
    }
    Ok(())
}

/// Load every template; broken ones are logged and skipped
fn load_templates(paths: &[PathBuf], tags: &[String]) -> Result<Vec<Arc<Template>>> {
    let mut files = Vec::new();
    for path in paths {
        collect_template_files(path, &mut files)?;
    }

    let mut templates = Vec::new();
    for file in files {
        match Template::from_file(&file) {
            Ok(template) => {
                if tags.is_empty() || tags.iter().any(|tag| template.has_tag(tag)) {
                    templates.push(Arc::new(template));
                }
            }
            Err(err) => warn!(path = %file.display(), error = %err, "skipping template"),
        }
    }
    Ok(templates)
}

fn load_targets(args: &Args) -> Result<Vec<String>> {
    let mut targets = args.targets.clone();
    if let Some(list) = &args.list {
        let content =
            std::fs::read_to_string(list).with_context(|| format!("cannot read target list {}", list.display()))?;
        targets.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    if targets.is_empty() {
        return Err(anyhow!("no targets given, use --target or --list"));
    }
    Ok(targets)
}

fn format_report(report: &SequenceReport, severity: Severity) -> String {
    let mut line = format!("[{}] [{}] {}", report.template_id, severity, report.target);
    if !report.matched {
        line.push_str(" (no match)");
    }
    if report.cancelled {
        line.push_str(" (cancelled)");
    }
    if let Some(error) = &report.error {
        line.push_str(&format!(" (error: {})", error));
    }
    for (name, value) in &report.extracted {
        line.push_str(&format!(" {}={}", name, value));
    }
    line
}

fn report_printer(templates: &[Arc<Template>], json: bool, all: bool) -> ReportCallback {
    let severities: HashMap<String, Severity> = templates
        .iter()
        .map(|template| (template.id.clone(), template.info.severity))
        .collect();
    Arc::new(move |report: &SequenceReport| {
        if !report.matched && !all {
            return;
        }
        if json {
            match serde_json::to_string(report) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!(error = %err, "cannot serialize report"),
            }
        } else {
            let severity = severities.get(&report.template_id).copied().unwrap_or_default();
            println!("{}", format_report(report, severity));
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ScanConfig::from_file(path)?,
        None => ScanConfig::default(),
    };
    let config = merge_args(config, &args);
    let _guard = logging::init_logging(&config.logging)?;

    let templates = load_templates(&args.templates, &args.tags)?;
    let targets = load_targets(&args)?;
    let vars = parse_vars(&args.vars)?;
    info!(templates = templates.len(), targets = targets.len(), "starting scan");

    let engine = Engine::new(config.engine.clone())?;
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing in-flight requests");
            interrupt.cancel();
        }
    });

    let callback = report_printer(&templates, args.json, args.all);
    let summaries = engine.scan(&templates, &targets, &vars, cancel, callback).await;

    let matched = summaries.iter().filter(|summary| summary.matched).count();
    let requests: usize = summaries.iter().map(|summary| summary.requests_sent).sum();
    let errors: usize = summaries.iter().map(|summary| summary.errors.len()).sum();
    info!(runs = summaries.len(), matched, requests, errors, "scan finished");
    Ok(())
}
