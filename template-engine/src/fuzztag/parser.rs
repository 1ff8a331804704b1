//! `{{...}}` tag parsing
//!
//! The input is scanned once for both delimiters with an Aho-Corasick
//! automaton; a stack pairs opens with closes into a tree of nodes stored in
//! an arena so generators can refer to nodes by index.

use aho_corasick::AhoCorasick;
use regex::Regex;
use std::sync::OnceLock;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Index of a node inside a [`TagTree`]
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagNode {
    /// Literal text, rendered exactly once
    Text(String),
    /// A `{{...}}` tag
    Tag {
        /// Method name as written in the leading literal, when recognizable
        name: Option<String>,
        /// Synchronization label (`method::label`)
        label: Option<String>,
        /// Nodes between the delimiters
        children: Vec<NodeId>,
        /// Source text including the delimiters
        raw: String,
    },
}

/// A top-level piece of a parsed string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// Text between the outermost delimiters of a tag
    Tag(&'a str),
}

/// Parsed tag tree of one string
#[derive(Debug, Clone, Default)]
pub struct TagTree {
    pub(crate) nodes: Vec<TagNode>,
    pub(crate) roots: Vec<NodeId>,
}

/// A rendered tag split into its call parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCall<'a> {
    pub name: Option<&'a str>,
    pub label: Option<&'a str>,
    pub args: Option<&'a str>,
    /// Everything between the delimiters, after nested tags were rendered
    pub inner: &'a str,
}

struct Frame {
    open_at: usize,
    children: Vec<NodeId>,
}

fn delimiters() -> Option<&'static AhoCorasick> {
    static AUTOMATON: OnceLock<Option<AhoCorasick>> = OnceLock::new();
    AUTOMATON
        .get_or_init(|| AhoCorasick::new([OPEN, CLOSE]).ok())
        .as_ref()
}

fn call_regex() -> Option<&'static Regex> {
    static CALL: OnceLock<Option<Regex>> = OnceLock::new();
    CALL.get_or_init(|| {
        Regex::new(
            r"(?s)^\s*([A-Za-z_][\w\-\.]*(?::[A-Za-z_][\w\-\.]*)*)(?:::([\w\-]+))?\s*(?:\((.*)\))?\s*$",
        )
        .ok()
    })
    .as_ref()
}

fn head_regex() -> Option<&'static Regex> {
    static HEAD: OnceLock<Option<Regex>> = OnceLock::new();
    HEAD.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][\w\-\.]*(?::[A-Za-z_][\w\-\.]*)*)(?:::([\w\-]+))?\s*(?:\(|$)").ok()
    })
    .as_ref()
}

/// Split a rendered tag body into `name`, `label` and `args`
pub fn split_call(inner: &str) -> TagCall<'_> {
    match call_regex().and_then(|re| re.captures(inner)) {
        Some(caps) => TagCall {
            name: caps.get(1).map(|m| m.as_str()),
            label: caps.get(2).map(|m| m.as_str()),
            args: caps.get(3).map(|m| m.as_str()),
            inner,
        },
        None => TagCall {
            name: None,
            label: None,
            args: None,
            inner,
        },
    }
}

impl TagTree {
    /// Parse a string. Never fails: unbalanced delimiters stay literal text.
    pub fn parse(input: &str) -> Self {
        let mut tree = TagTree::default();
        let Some(automaton) = delimiters() else {
            let id = tree.push(TagNode::Text(input.to_string()));
            tree.roots.push(id);
            return tree;
        };

        let mut frames = vec![Frame {
            open_at: 0,
            children: Vec::new(),
        }];
        let mut cursor = 0;

        for found in automaton.find_iter(input) {
            if found.pattern().as_usize() == 0 {
                tree.push_text(&mut frames, &input[cursor..found.start()]);
                frames.push(Frame {
                    open_at: found.start(),
                    children: Vec::new(),
                });
                cursor = found.end();
                continue;
            }

            // A close with nothing open is plain text
            if frames.len() == 1 {
                continue;
            }
            tree.push_text(&mut frames, &input[cursor..found.start()]);
            cursor = found.end();

            let Some(frame) = frames.pop() else { break };
            let (name, label) = tree.head_of(&frame.children);
            let id = tree.push(TagNode::Tag {
                name,
                label,
                children: frame.children,
                raw: input[frame.open_at..found.end()].to_string(),
            });
            if let Some(parent) = frames.last_mut() {
                parent.children.push(id);
            }
        }
        tree.push_text(&mut frames, &input[cursor..]);

        // Unterminated tags degrade to their opening delimiter plus contents
        while frames.len() > 1 {
            let Some(frame) = frames.pop() else { break };
            let open = tree.push(TagNode::Text(OPEN.to_string()));
            if let Some(parent) = frames.last_mut() {
                parent.children.push(open);
                parent.children.extend(frame.children);
            }
        }

        tree.roots = frames.pop().map(|f| f.children).unwrap_or_default();
        tree
    }

    fn push(&mut self, node: TagNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn push_text(&mut self, frames: &mut [Frame], text: &str) {
        if text.is_empty() {
            return;
        }
        let id = self.push(TagNode::Text(text.to_string()));
        if let Some(frame) = frames.last_mut() {
            frame.children.push(id);
        }
    }

    fn head_of(&self, children: &[NodeId]) -> (Option<String>, Option<String>) {
        let Some(TagNode::Text(first)) = children.first().map(|id| &self.nodes[*id]) else {
            return (None, None);
        };
        match head_regex().and_then(|re| re.captures(first)) {
            Some(caps) => (
                caps.get(1).map(|m| m.as_str().to_string()),
                caps.get(2).map(|m| m.as_str().to_string()),
            ),
            None => (None, None),
        }
    }

    pub fn node(&self, id: NodeId) -> &TagNode {
        &self.nodes[id]
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the string contains at least one well-formed tag
    pub fn has_tags(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n, TagNode::Tag { .. }))
    }

    /// Names of every tag in the tree, nested ones included
    pub fn tag_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                TagNode::Tag { name: Some(name), .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of tag nodes at any depth
    pub fn tag_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, TagNode::Tag { .. }))
            .count()
    }

    /// Top-level pieces of the source string
    pub fn segments(&self) -> Vec<Segment<'_>> {
        self.roots
            .iter()
            .map(|id| match &self.nodes[*id] {
                TagNode::Text(text) => Segment::Text(text.as_str()),
                TagNode::Tag { raw, .. } => Segment::Tag(&raw[OPEN.len()..raw.len() - CLOSE.len()]),
            })
            .collect()
    }
}
