//! Ordered, typed variable store with memoized resolution

use crate::dsl::{Evaluator, VarMap};
use crate::fuzztag::{self, methods, Segment, TagTree};
use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

/// How a stored value is turned into its final form
#[derive(Debug, Clone, PartialEq)]
pub enum VarEntry {
    /// Used as is
    Raw(Value),
    /// Expanded through the tag engine; the first rendering is kept
    FuzzTag(String),
    /// Evaluated as an expression, tag-rendered where evaluation fails
    Expression(String),
}

impl VarEntry {
    fn source_text(&self) -> Value {
        match self {
            VarEntry::Raw(value) => value.clone(),
            VarEntry::FuzzTag(text) | VarEntry::Expression(text) => Value::String(text.clone()),
        }
    }
}

struct Memo {
    version: u64,
    base: VarMap,
    resolved: VarMap,
}

/// Variables of one template
///
/// Entries keep insertion order. [`VariableStore::to_map`] resolves them
/// against a base map and memoizes the result until an entry changes.
/// Entries that reference each other resolve to the other side's source
/// text instead of recursing.
pub struct VariableStore {
    entries: IndexMap<String, VarEntry>,
    version: u64,
    memo: Mutex<Option<Memo>>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for VariableStore {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            version: self.version,
            memo: Mutex::new(None),
        }
    }
}

impl std::fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableStore")
            .field("entries", &self.entries)
            .field("version", &self.version)
            .finish()
    }
}

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_\-]*").ok())
        .as_ref()
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            version: 0,
            memo: Mutex::new(None),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, entry: VarEntry) {
        self.entries.insert(name.into(), entry);
        self.version += 1;
    }

    /// Insert a value, classifying strings by the tags they contain
    pub fn auto_set(&mut self, name: impl Into<String>, value: Value) {
        let entry = match value {
            Value::String(text) => Self::classify(text),
            other => VarEntry::Raw(other),
        };
        self.set(name, entry);
    }

    fn classify(text: String) -> VarEntry {
        if !text.contains("{{") {
            return VarEntry::Raw(Value::String(text));
        }
        let tree = TagTree::parse(&text);
        if !tree.has_tags() {
            return VarEntry::Raw(Value::String(text));
        }
        let names = tree.tag_names();
        if names.len() == tree.tag_count() && names.iter().all(|name| methods::is_method(name)) {
            VarEntry::FuzzTag(text)
        } else {
            VarEntry::Expression(text)
        }
    }

    pub fn get(&self, name: &str) -> Option<&VarEntry> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<VarEntry> {
        let removed = self.entries.shift_remove(name);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Resolve every entry on top of `base`. Store entries shadow base values.
    pub fn to_map(&self, base: &VarMap, evaluator: &dyn Evaluator) -> VarMap {
        let mut memo = self.memo.lock();
        if let Some(cached) = memo.as_ref() {
            if cached.version == self.version && cached.base == *base {
                return cached.resolved.clone();
            }
        }

        let mut resolved = base.clone();
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        for name in self.entries.keys() {
            self.resolve(name, &mut resolved, &mut visiting, &mut done, evaluator);
        }

        *memo = Some(Memo {
            version: self.version,
            base: base.clone(),
            resolved: resolved.clone(),
        });
        resolved
    }

    fn resolve(
        &self,
        name: &str,
        resolved: &mut VarMap,
        visiting: &mut HashSet<String>,
        done: &mut HashSet<String>,
        evaluator: &dyn Evaluator,
    ) {
        if done.contains(name) || visiting.contains(name) {
            return;
        }
        let Some(entry) = self.entries.get(name) else {
            return;
        };
        visiting.insert(name.to_string());
        // A reference back to this entry while it resolves sees the source text
        resolved.insert(name.to_string(), entry.source_text());

        let value = match entry {
            VarEntry::Raw(value) => value.clone(),
            VarEntry::FuzzTag(text) | VarEntry::Expression(text) => {
                for dependency in self.references(text, name) {
                    self.resolve(&dependency, resolved, visiting, done, evaluator);
                }
                match entry {
                    VarEntry::FuzzTag(_) => {
                        Value::String(fuzztag::render_first(text, resolved, evaluator))
                    }
                    _ => evaluate_expression(text, resolved, evaluator),
                }
            }
        };

        resolved.insert(name.to_string(), value);
        visiting.remove(name);
        done.insert(name.to_string());
    }

    /// Store entries named inside `text`, other than `own`
    fn references(&self, text: &str, own: &str) -> Vec<String> {
        let Some(re) = identifier_regex() else {
            return Vec::new();
        };
        let mut out: Vec<String> = Vec::new();
        for found in re.find_iter(text) {
            let candidate = found.as_str();
            if candidate != own
                && self.entries.contains_key(candidate)
                && !out.iter().any(|seen| seen == candidate)
            {
                out.push(candidate.to_string());
            }
        }
        out
    }
}

/// Evaluate an expression entry. A lone `{{expr}}` keeps the typed result;
/// mixed text renders each tag and concatenates.
fn evaluate_expression(text: &str, vars: &VarMap, evaluator: &dyn Evaluator) -> Value {
    let tree = TagTree::parse(text);
    if !tree.has_tags() {
        return evaluator
            .evaluate(text, vars)
            .unwrap_or_else(|_| Value::String(text.to_string()));
    }

    let segments = tree.segments();
    if let [Segment::Tag(inner)] = segments.as_slice() {
        match evaluator.evaluate(inner, vars) {
            Ok(value) => return value,
            Err(err) => {
                debug!(expression = inner, error = %err, "falling back to tag rendering");
                return Value::String(fuzztag::render_first(text, vars, evaluator));
            }
        }
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(literal) => out.push_str(literal),
            Segment::Tag(inner) => match evaluator.evaluate(inner, vars) {
                Ok(value) => out.push_str(&crate::dsl::value_to_string(&value)),
                Err(_) => {
                    out.push_str(&fuzztag::render_first(&format!("{{{{{}}}}}", inner), vars, evaluator))
                }
            },
        }
    }
    Value::String(out)
}
