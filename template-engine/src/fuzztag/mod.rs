//! Tag templating: `{{...}}` parsing and combinatorial rendering
//!
//! A string is parsed once into a [`TagTree`] and rendered lazily through a
//! [`TagGenerator`]. Tags whose name matches a payload list iterate that
//! list according to the [`AttackMode`]; every other tag goes through a
//! [`TagResolver`], normally [`VarResolver`], which looks up variables,
//! evaluates expressions and finally falls back to the builtin methods.

pub mod generator;
pub mod methods;
pub mod parser;

pub use generator::{TagGenerator, TagResolver};
pub use parser::{split_call, NodeId, Segment, TagCall, TagNode, TagTree};

use crate::dsl::{value_to_string, Evaluator, VarMap};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Named payload lists of one request sequence
pub type PayloadSet = IndexMap<String, Vec<String>>;

/// How payload lists are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackMode {
    /// Full cross product of every list
    #[default]
    Cartesian,
    /// Lists stepped in lock-step ("pitchfork")
    Sync,
}

impl AttackMode {
    /// Map a template `attack:` value; only pitchfork is synchronized
    pub fn from_template(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pitchfork" | "sync" => AttackMode::Sync,
            _ => AttackMode::Cartesian,
        }
    }
}

/// Look a name up exactly, then case-insensitively
pub fn lookup<'v>(vars: &'v VarMap, name: &str) -> Option<&'v Value> {
    vars.get(name).or_else(|| {
        vars.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn values_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(value_to_string).collect(),
        other => vec![value_to_string(other)],
    }
}

/// Default resolver: variables, then expressions, then builtin methods.
/// A tag nothing can resolve renders as its own source text.
pub struct VarResolver<'a> {
    vars: &'a VarMap,
    evaluator: &'a dyn Evaluator,
}

impl<'a> VarResolver<'a> {
    pub fn new(vars: &'a VarMap, evaluator: &'a dyn Evaluator) -> Self {
        Self { vars, evaluator }
    }
}

impl TagResolver for VarResolver<'_> {
    fn resolve(&self, call: &TagCall<'_>) -> Vec<String> {
        if let Some(name) = call.name {
            match call.args {
                None => {
                    if let Some(value) = lookup(self.vars, name) {
                        return values_of(value);
                    }
                }
                Some(args) if matches!(name, "params" | "param" | "p") => {
                    return lookup(self.vars, args.trim())
                        .map(values_of)
                        .unwrap_or_default();
                }
                Some(_) => {}
            }
        }

        match self.evaluator.evaluate(call.inner, self.vars) {
            Ok(value) => return vec![value_to_string(&value)],
            Err(err) => trace!(tag = call.inner, error = %err, "tag is not an expression"),
        }

        if let Some(name) = call.name {
            if let Some(values) = methods::call(name, call.args.unwrap_or("")) {
                return values;
            }
        }
        vec![format!("{{{{{}}}}}", call.inner)]
    }
}

/// Every rendering of `text`
pub fn render_all(
    text: &str,
    payloads: &PayloadSet,
    mode: AttackMode,
    vars: &VarMap,
    evaluator: &dyn Evaluator,
) -> Vec<String> {
    let tree = TagTree::parse(text);
    if !tree.has_tags() {
        return vec![text.to_string()];
    }
    let resolver = VarResolver::new(vars, evaluator);
    TagGenerator::new(&tree, payloads, &resolver, mode).collect()
}

/// First rendering of `text` with no payloads
pub fn render_first(text: &str, vars: &VarMap, evaluator: &dyn Evaluator) -> String {
    let tree = TagTree::parse(text);
    if !tree.has_tags() {
        return text.to_string();
    }
    let payloads = PayloadSet::new();
    let resolver = VarResolver::new(vars, evaluator);
    TagGenerator::new(&tree, &payloads, &resolver, AttackMode::Cartesian)
        .next()
        .unwrap_or_default()
}
