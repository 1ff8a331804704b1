//! Lazy enumeration of every rendering of a [`TagTree`]
//!
//! Each node behaves as a small generator (`reset` / `advance`). A list of
//! sibling nodes is stepped like a mixed-radix counter: the first node moves
//! fastest, an exhausted node is re-seeded and carries into the next one, and
//! the sequence ends once the last node runs out. Nodes that share a label
//! are stepped together; a member that runs out before the others renders as
//! an empty string until the whole group is exhausted.
//!
//! This inverts the usual right-most-first odometer, so `{{user}}-{{pass}}`
//! with `user=[admin,root]` and `pass=[1,2]` renders `admin-1`, `root-1`,
//! `admin-2`, `root-2`. See `test_cartesian_order`.

use super::parser::{split_call, NodeId, TagCall, TagNode, TagTree};
use super::{AttackMode, PayloadSet};
use std::collections::{HashMap, HashSet};

const SYNC_LABEL: &str = "__payload_sync__";

/// Produces the values of a tag that is not a payload reference
pub trait TagResolver {
    /// Return every value the tag expands to; an empty list renders as ""
    fn resolve(&self, call: &TagCall<'_>) -> Vec<String>;
}

impl<F> TagResolver for F
where
    F: Fn(&TagCall<'_>) -> Vec<String>,
{
    fn resolve(&self, call: &TagCall<'_>) -> Vec<String> {
        self(call)
    }
}

#[derive(Debug, Clone, Default)]
struct NodeState {
    current: String,
    values: Vec<String>,
    cursor: usize,
    started: bool,
    exhausted: bool,
}

/// Iterator over all renderings of one parsed string
pub struct TagGenerator<'a> {
    tree: &'a TagTree,
    payloads: &'a PayloadSet,
    resolver: &'a dyn TagResolver,
    states: Vec<NodeState>,
    groups: Vec<Option<Vec<NodeId>>>,
    started: bool,
    done: bool,
}

impl<'a> TagGenerator<'a> {
    pub fn new(
        tree: &'a TagTree,
        payloads: &'a PayloadSet,
        resolver: &'a dyn TagResolver,
        mode: AttackMode,
    ) -> Self {
        let mut generator = Self {
            tree,
            payloads,
            resolver,
            states: vec![NodeState::default(); tree.len()],
            groups: vec![None; tree.len()],
            started: false,
            done: false,
        };
        generator.build_groups(tree.roots(), mode);
        generator
    }

    /// Collect sibling groups for one sequence and recurse into tag bodies
    fn build_groups(&mut self, sequence: &[NodeId], mode: AttackMode) {
        let tree = self.tree;
        let mut by_label: HashMap<String, Vec<NodeId>> = HashMap::new();
        for &id in sequence {
            if let TagNode::Tag {
                name,
                label,
                children,
                ..
            } = tree.node(id)
            {
                if let Some(label) = self.effective_label(name.as_deref(), label.as_deref(), mode) {
                    by_label.entry(label).or_default().push(id);
                }
                self.build_groups(children, mode);
            }
        }
        for members in by_label.into_values() {
            if members.len() < 2 {
                continue;
            }
            for &id in &members {
                self.groups[id] = Some(members.clone());
            }
        }
    }

    fn effective_label(&self, name: Option<&str>, label: Option<&str>, mode: AttackMode) -> Option<String> {
        if let Some(label) = label {
            return Some(label.to_string());
        }
        let name = name?;
        if !self.payloads.contains_key(name) {
            return None;
        }
        // Repeated references to one payload always carry the same value
        Some(match mode {
            AttackMode::Sync => SYNC_LABEL.to_string(),
            AttackMode::Cartesian => format!("__payload_{}__", name),
        })
    }

    /// Restart the enumeration from the first rendering
    pub fn reset(&mut self) {
        for state in &mut self.states {
            *state = NodeState::default();
        }
        self.started = false;
        self.done = false;
    }

    fn reset_node(&mut self, id: NodeId) {
        self.states[id] = NodeState::default();
    }

    fn seed_sequence(&mut self, sequence: &[NodeId]) {
        for &id in sequence {
            self.reset_node(id);
            self.advance(id);
        }
    }

    fn step_sequence(&mut self, sequence: &[NodeId]) -> bool {
        let mut visited: HashSet<NodeId> = HashSet::new();
        for &id in sequence {
            if !visited.insert(id) {
                continue;
            }
            match self.groups[id].clone() {
                None => {
                    if self.advance(id) {
                        return true;
                    }
                    self.reset_node(id);
                    self.advance(id);
                }
                Some(members) => {
                    visited.extend(members.iter().copied());
                    let mut any = false;
                    for &member in &members {
                        if self.advance(member) {
                            any = true;
                        } else {
                            self.states[member].current.clear();
                        }
                    }
                    if any {
                        return true;
                    }
                    for &member in &members {
                        self.reset_node(member);
                        self.advance(member);
                    }
                }
            }
        }
        false
    }

    fn advance(&mut self, id: NodeId) -> bool {
        if self.states[id].exhausted {
            return false;
        }
        let tree = self.tree;
        match tree.node(id) {
            TagNode::Text(text) => {
                let state = &mut self.states[id];
                if state.started {
                    state.exhausted = true;
                    return false;
                }
                state.started = true;
                state.current = text.clone();
                true
            }
            TagNode::Tag { children, .. } => {
                if !self.states[id].started {
                    self.states[id].started = true;
                    self.seed_sequence(children);
                    self.load_values(id, children);
                    return true;
                }
                let state = &mut self.states[id];
                if state.cursor + 1 < state.values.len() {
                    state.cursor += 1;
                    state.current = state.values[state.cursor].clone();
                    return true;
                }
                if self.step_sequence(children) {
                    self.load_values(id, children);
                    return true;
                }
                self.states[id].exhausted = true;
                false
            }
        }
    }

    fn load_values(&mut self, id: NodeId, children: &[NodeId]) {
        let inner = self.render(children);
        let call = split_call(&inner);
        let mut values = match (call.name, call.args) {
            (Some(name), None) if self.payloads.contains_key(name) => {
                self.payloads.get(name).cloned().unwrap_or_default()
            }
            _ => self.resolver.resolve(&call),
        };
        if values.is_empty() {
            values.push(String::new());
        }
        let state = &mut self.states[id];
        state.current = values[0].clone();
        state.values = values;
        state.cursor = 0;
    }

    fn render(&self, sequence: &[NodeId]) -> String {
        sequence
            .iter()
            .map(|id| self.states[*id].current.as_str())
            .collect()
    }
}

impl Iterator for TagGenerator<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        let roots = self.tree.roots();
        if !self.started {
            self.started = true;
            self.seed_sequence(roots);
        } else if !self.step_sequence(roots) {
            self.done = true;
            return None;
        }
        Some(self.render(roots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars_resolver(call: &TagCall<'_>) -> Vec<String> {
        match call.name {
            Some("account") => vec!["account".to_string()],
            Some("pair") => vec!["x".to_string(), "y".to_string()],
            _ => vec![format!("{{{{{}}}}}", call.inner)],
        }
    }

    fn payloads() -> PayloadSet {
        let mut set = PayloadSet::new();
        set.insert(
            "username".to_string(),
            vec!["admin".to_string(), "root".to_string()],
        );
        set.insert(
            "password".to_string(),
            vec!["123456".to_string(), "000000".to_string()],
        );
        set
    }

    fn render_all(input: &str, payloads: &PayloadSet, mode: AttackMode) -> Vec<String> {
        let tree = TagTree::parse(input);
        TagGenerator::new(&tree, payloads, &vars_resolver, mode).collect()
    }

    #[test]
    fn test_cartesian_order() {
        let out = render_all(
            "{{account}}:{{username}}-{{password}}",
            &payloads(),
            AttackMode::Cartesian,
        );
        assert_eq!(
            out,
            vec![
                "account:admin-123456",
                "account:root-123456",
                "account:admin-000000",
                "account:root-000000"
            ]
        );
    }

    #[test]
    fn test_pitchfork_order() {
        let out = render_all(
            "{{account}}:{{username}}-{{password}}",
            &payloads(),
            AttackMode::Sync,
        );
        assert_eq!(out, vec!["account:admin-123456", "account:root-000000"]);
    }

    #[test]
    fn test_pitchfork_uneven_lists_pad_with_empty() {
        let mut set = payloads();
        set.insert(
            "username".to_string(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        );
        let out = render_all("{{username}}/{{password}}", &set, AttackMode::Sync);
        assert_eq!(out, vec!["a/123456", "b/000000", "c/"]);
    }

    #[test]
    fn test_plain_text_yields_once() {
        let set = PayloadSet::new();
        let tree = TagTree::parse("no tags here");
        let mut generator = TagGenerator::new(&tree, &set, &vars_resolver, AttackMode::Cartesian);
        assert_eq!(generator.next().as_deref(), Some("no tags here"));
        assert_eq!(generator.next(), None);
        assert_eq!(generator.next(), None);

        generator.reset();
        assert_eq!(generator.next().as_deref(), Some("no tags here"));
    }

    #[test]
    fn test_empty_input_yields_empty_string_once() {
        let out = render_all("", &PayloadSet::new(), AttackMode::Cartesian);
        assert_eq!(out, vec![String::new()]);
    }

    #[test]
    fn test_same_payload_twice_stays_consistent() {
        let out = render_all("{{username}}={{username}}", &payloads(), AttackMode::Cartesian);
        assert_eq!(out, vec!["admin=admin", "root=root"]);
    }

    #[test]
    fn test_multi_valued_resolver_and_nested_arguments() {
        let resolver = |call: &TagCall<'_>| -> Vec<String> {
            match (call.name, call.args) {
                (Some("pair"), _) => vec!["x".to_string(), "y".to_string()],
                (Some("wrap"), Some(args)) => vec![format!("[{}]", args)],
                _ => Vec::new(),
            }
        };
        let tree = TagTree::parse("{{wrap({{pair}})}}-{{pair}}");
        let set = PayloadSet::new();
        let out: Vec<String> =
            TagGenerator::new(&tree, &set, &resolver, AttackMode::Cartesian).collect();
        assert_eq!(out, vec!["[x]-x", "[y]-x", "[x]-y", "[y]-y"]);
    }

    #[test]
    fn test_explicit_labels_synchronize() {
        let resolver = |call: &TagCall<'_>| -> Vec<String> {
            match call.args {
                Some(args) => args.split('|').map(str::to_string).collect(),
                None => Vec::new(),
            }
        };
        let tree = TagTree::parse("{{list::g(1|2|3)}}{{list::g(a|b|c)}}");
        let set = PayloadSet::new();
        let out: Vec<String> =
            TagGenerator::new(&tree, &set, &resolver, AttackMode::Cartesian).collect();
        assert_eq!(out, vec!["1a", "2b", "3c"]);
    }
}
