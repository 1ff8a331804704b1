//! Template Engine - YAML-driven vulnerability detection
//!
//! This crate loads detection templates, expands their fuzz tags into
//! concrete request packets, sends them through pluggable transports and
//! decides matches from the responses with matchers, extractors and an
//! embedded expression language.

pub mod codec;
pub mod config;
pub mod dsl;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod fuzztag;
pub mod generator;
pub mod matcher;
pub mod oob;
pub mod offline;
pub mod packet;
pub mod result;
pub mod scope;
pub mod template;
pub mod transport;
pub mod vars;


pub use config::EngineConfig;

pub use dsl::{DslEvaluator, Evaluator, VarMap};

pub use error::{EngineError, EngineResult, ErrorCategory, EvaluationError, OobError, TransportError};

pub use executor::{discard_reports, Engine, ReportCallback};

pub use extractor::{Extractor, ExtractorKind, RegexGroup};

pub use fuzztag::{render_all, render_first, AttackMode, PayloadSet};

pub use generator::{generate, NetworkPlan, NetworkStep, PreparedRequest, TargetInfo};

pub use matcher::{Condition, Matcher, MatcherKind, MatcherLeaf};

pub use oob::{OobChecker, OobProvider, OobRegistry, OobToken};

pub use offline::{match_response, OfflineOutcome};

pub use packet::RawPacket;

pub use result::{ExchangeRecord, ExecutionSummary, ExtractedValue, SequenceKind, SequenceReport};

pub use scope::Scope;

pub use template::{
    NetworkSequence, RequestSequence, RequestTemplate, Severity, Template, TemplateInfo, TemplateRequests,
};

pub use transport::{
    NetworkExchange, NetworkTransport, ReqwestTransport, SendOptions, TcpNetworkTransport, Transport, TransportResponse,
};

pub use vars::{VarEntry, VariableStore};
