//! Predicate-driven search over nested values whose schema is not known
//! ahead of time.
//!
//! The search is iterative (explicit stack) and tracks the identity of every
//! container it has expanded, so graph-shaped inputs with cycles terminate.
//! `serde_json::Value` is always a tree, but the same routine is used for
//! arena graphs in tests and anywhere else a `Structure` is implemented.

use serde_json::Value;
use std::{collections::HashSet, hash::Hash, marker::PhantomData};

/// A navigable nested structure.
pub trait Structure {
    type Node: Copy;
    type Identity: Eq + Hash;

    /// Identity of a container node; `None` for leaves.
    fn identity(&self, node: Self::Node) -> Option<Self::Identity>;

    /// Children in document order.
    fn children(&self, node: Self::Node) -> Vec<Self::Node>;
}

/// Depth-first pre-order search; returns the first node matching `predicate`.
pub fn find_in<S, P>(structure: &S, root: S::Node, mut predicate: P) -> Option<S::Node>
where
    S: Structure,
    P: FnMut(S::Node) -> bool,
{
    let mut visited = HashSet::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let identity = structure.identity(node);
        if let Some(id) = identity {
            if !visited.insert(id) {
                continue;
            }
        }
        if predicate(node) {
            return Some(node);
        }
        if structure.identity(node).is_some() {
            let children = structure.children(node);
            stack.extend(children.into_iter().rev());
        }
    }
    None
}

pub struct JsonTree<'a>(PhantomData<&'a Value>);

impl<'a> Structure for JsonTree<'a> {
    type Node = &'a Value;
    type Identity = usize;

    fn identity(&self, node: &'a Value) -> Option<usize> {
        match node {
            Value::Array(_) | Value::Object(_) => Some(node as *const Value as usize),
            _ => None,
        }
    }

    fn children(&self, node: &'a Value) -> Vec<&'a Value> {
        match node {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => map.values().collect(),
            _ => Vec::new(),
        }
    }
}

pub fn find<'a, P>(root: &'a Value, predicate: P) -> Option<&'a Value>
where
    P: FnMut(&'a Value) -> bool,
{
    find_in(&JsonTree(PhantomData), root, predicate)
}

/// First object entry (in pre-order) whose key and value satisfy `predicate`.
pub fn find_entry<'a, P>(root: &'a Value, mut predicate: P) -> Option<(&'a str, &'a Value)>
where
    P: FnMut(&str, &'a Value) -> bool,
{
    let mut found = None;
    find(root, |node| {
        if let Value::Object(map) = node {
            for (key, value) in map {
                if predicate(key, value) {
                    found = Some((key.as_str(), value));
                    return true;
                }
            }
        }
        false
    });
    found
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    SkipChildren,
    Stop,
}

/// Mutable pre-order walk over every object entry of `root`.
pub fn visit_entries_mut<V>(root: &mut Value, mut visitor: V)
where
    V: FnMut(&str, &mut Value) -> Visit,
{
    let mut stack: Vec<&mut Value> = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            Value::Object(map) => {
                let mut children = Vec::new();
                for (key, value) in map.iter_mut() {
                    match visitor(key, value) {
                        Visit::Stop => return,
                        Visit::SkipChildren => {}
                        Visit::Continue => children.push(value),
                    }
                }
                stack.extend(children.into_iter().rev());
            }
            Value::Array(items) => stack.extend(items.iter_mut().rev()),
            _ => {}
        }
    }
}

/// Integer carried either as a JSON number or a numeric string.
pub fn numeric_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                trimmed.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Non-empty string, or integer rendered as a string.
pub fn identifier_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => n.as_u64().map(|v| v.to_string()),
        _ => None,
    }
}
