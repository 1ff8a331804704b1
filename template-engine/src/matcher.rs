//! Boolean matcher trees over scoped traffic

use crate::codec;
use crate::dsl::{compile_regex, VarMap};
use crate::fuzztag;
use crate::result::ExchangeRecord;
use crate::scope::{EvalContext, Scope};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    #[default]
    Or,
}

impl Condition {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("and") {
            Condition::And
        } else {
            Condition::Or
        }
    }

    fn combine(self, mut results: impl Iterator<Item = bool>) -> bool {
        match self {
            Condition::And => results.all(|r| r),
            Condition::Or => results.any(|r| r),
        }
    }
}

/// Decoding applied to word groups before comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupEncoding {
    #[default]
    Plain,
    Hex,
    Base64,
}

impl GroupEncoding {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hex" => GroupEncoding::Hex,
            "base64" => GroupEncoding::Base64,
            _ => GroupEncoding::Plain,
        }
    }

    fn decode(self, word: &str) -> Option<Vec<u8>> {
        match self {
            GroupEncoding::Plain => Some(codec::to_bytes(word)),
            GroupEncoding::Hex => codec::hex_decode(word),
            GroupEncoding::Base64 => codec::base64_decode(word),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatcherKind {
    Word {
        words: Vec<String>,
        encoding: GroupEncoding,
        case_insensitive: bool,
    },
    /// Hex-encoded byte sequences
    Binary { patterns: Vec<String> },
    Regex { patterns: Vec<String> },
    Status { codes: Vec<u16> },
    Size { sizes: Vec<usize> },
    Expression { expressions: Vec<String> },
}

/// A single predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherLeaf {
    /// Position of this leaf within its tree, used to memoize `id` lookups
    pub index: usize,
    pub kind: MatcherKind,
    pub scope: Scope,
    pub condition: Condition,
    pub negate: bool,
    /// 0 reads the exchange under evaluation, k reads the k-th exchange
    pub target: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Matcher {
    Leaf(MatcherLeaf),
    Group {
        condition: Condition,
        negate: bool,
        children: Vec<Matcher>,
    },
}

struct Scratch<'c> {
    current: Option<&'c ExchangeRecord>,
    vars: OnceCell<VarMap>,
}

impl Matcher {
    /// The fallback used when a sequence declares neither matchers nor extractors
    pub fn default_status() -> Self {
        Matcher::Leaf(MatcherLeaf {
            index: 0,
            kind: MatcherKind::Status { codes: vec![200] },
            scope: Scope::Status,
            condition: Condition::Or,
            negate: false,
            target: 0,
        })
    }

    /// Renumber leaves in depth-first order so memo keys are unique
    pub fn reindex(&mut self) {
        fn walk(matcher: &mut Matcher, next: &mut usize) {
            match matcher {
                Matcher::Leaf(leaf) => {
                    leaf.index = *next;
                    *next += 1;
                }
                Matcher::Group { children, .. } => {
                    children.iter_mut().for_each(|child| walk(child, next));
                }
            }
        }
        let mut next = 0;
        walk(self, &mut next);
    }

    pub fn leaves(&self) -> Vec<&MatcherLeaf> {
        fn walk<'m>(matcher: &'m Matcher, out: &mut Vec<&'m MatcherLeaf>) {
            match matcher {
                Matcher::Leaf(leaf) => out.push(leaf),
                Matcher::Group { children, .. } => children.iter().for_each(|c| walk(c, out)),
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }

    /// Whether any leaf reads OOB interaction data
    pub fn uses_oob(&self) -> bool {
        self.leaves().iter().any(|leaf| {
            leaf.scope.is_oob()
                || matches!(&leaf.kind, MatcherKind::Expression { expressions }
                    if expressions.iter().any(|e| e.contains("interactsh")))
        })
    }

    /// Evaluate against `current` (the exchange that triggered evaluation)
    pub fn execute(&self, ctx: &EvalContext<'_>, current: Option<&ExchangeRecord>) -> bool {
        let scratch = Scratch {
            current,
            vars: OnceCell::new(),
        };
        self.eval(ctx, &scratch)
    }

    fn eval(&self, ctx: &EvalContext<'_>, scratch: &Scratch<'_>) -> bool {
        match self {
            Matcher::Leaf(leaf) => leaf.eval(ctx, scratch),
            Matcher::Group {
                condition,
                negate,
                children,
            } => {
                let result = condition.combine(children.iter().map(|c| c.eval(ctx, scratch)));
                result != *negate
            }
        }
    }
}

impl MatcherLeaf {
    fn eval(&self, ctx: &EvalContext<'_>, scratch: &Scratch<'_>) -> bool {
        if self.target == 0 {
            return self.eval_uncached(ctx, scratch);
        }
        let key = (self.index, self.target);
        if let Some(hit) = ctx.memo.get(&key) {
            return *hit;
        }
        let result = self.eval_uncached(ctx, scratch);
        ctx.memo.insert(key, result);
        result
    }

    fn eval_uncached(&self, ctx: &EvalContext<'_>, scratch: &Scratch<'_>) -> bool {
        let exchange = ctx.select(self.target, scratch.current);
        if self.target != 0 && exchange.is_none() {
            debug!(target = self.target, "matcher references a missing exchange");
            return false;
        }

        let outcome = match &self.kind {
            MatcherKind::Expression { expressions } => {
                let addressed;
                let vars = if self.target == 0 {
                    scratch.vars.get_or_init(|| ctx.expression_vars(scratch.current))
                } else {
                    addressed = ctx.expression_vars(exchange);
                    &addressed
                };
                self.eval_expressions(expressions, ctx, vars)
            }
            kind => {
                let scope = match kind {
                    MatcherKind::Status { .. } => Scope::Status,
                    MatcherKind::Size { .. } => Scope::Body,
                    _ => self.scope,
                };
                // Nothing to read never matches, negated or not
                let Some(material) = ctx.material(scope, exchange) else {
                    return false;
                };
                match kind {
                    MatcherKind::Word {
                        words,
                        encoding,
                        case_insensitive,
                    } => Some(self.eval_words(words, *encoding, *case_insensitive, &material, ctx, scratch)),
                    MatcherKind::Binary { patterns } => {
                        let haystack = codec::to_bytes(&material);
                        Some(self.condition.combine(patterns.iter().map(|pattern| {
                            codec::hex_decode(pattern)
                                .map(|needle| contains_bytes(&haystack, &needle))
                                .unwrap_or(false)
                        })))
                    }
                    MatcherKind::Regex { patterns } => self.eval_regex(patterns, &material),
                    MatcherKind::Status { codes } => {
                        let status: u16 = material.trim().parse().unwrap_or(0);
                        Some(self.condition.combine(codes.iter().map(|code| *code == status)))
                    }
                    MatcherKind::Size { sizes } => {
                        let size = codec::to_bytes(&material).len();
                        Some(self.condition.combine(sizes.iter().map(|s| *s == size)))
                    }
                    MatcherKind::Expression { .. } => None,
                }
            }
        };

        match outcome {
            Some(result) => result != self.negate,
            None => false,
        }
    }

    fn eval_words(
        &self,
        words: &[String],
        encoding: GroupEncoding,
        case_insensitive: bool,
        material: &str,
        ctx: &EvalContext<'_>,
        scratch: &Scratch<'_>,
    ) -> bool {
        let haystack = if case_insensitive {
            material.to_lowercase()
        } else {
            material.to_string()
        };
        let haystack_bytes = codec::to_bytes(&haystack);
        self.condition.combine(words.iter().map(|word| {
            let word = if word.contains("{{") {
                let vars = scratch.vars.get_or_init(|| ctx.expression_vars(scratch.current));
                fuzztag::render_first(word, vars, ctx.evaluator)
            } else {
                word.clone()
            };
            let Some(needle) = encoding.decode(&word) else {
                warn!(word = %word, "word matcher value could not be decoded");
                return false;
            };
            let needle = if case_insensitive {
                codec::to_bytes(&codec::from_bytes(needle).to_lowercase())
            } else {
                needle
            };
            contains_bytes(&haystack_bytes, &needle)
        }))
    }

    /// `None` when a pattern fails to compile
    fn eval_regex(&self, patterns: &[String], material: &str) -> Option<bool> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match compile_regex(pattern) {
                Ok(re) => compiled.push(re),
                Err(err) => {
                    warn!(error = %err, "regex matcher disabled");
                    return None;
                }
            }
        }
        Some(self.condition.combine(compiled.iter().map(|re| re.is_match(material))))
    }

    fn eval_expressions(&self, expressions: &[String], ctx: &EvalContext<'_>, vars: &VarMap) -> Option<bool> {
        let mut results = Vec::with_capacity(expressions.len());
        for expression in expressions {
            match ctx.evaluator.evaluate_bool(expression, vars) {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(expression = %expression, error = %err, "expression matcher failed");
                    return None;
                }
            }
        }
        Some(self.condition.combine(results.into_iter()))
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
