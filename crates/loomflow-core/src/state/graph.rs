//! Computed-field dependency graph.
//!
//! Compiled once from a `state_schema`. Uses `petgraph` to model
//! `from` dependencies between computed fields; a DFS with a recursion stack
//! rejects direct, transitive and self cycles before any store exists, and a
//! topological sort fixes the evaluation order. A reverse index from source
//! keys to dependents limits recomputation to the affected subgraph.

use std::collections::{BTreeSet, HashMap};

use loomflow_types::workflow::StateSchema;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value, json};

use super::path::{Scope, StatePath};
use super::StateError;
use crate::expression::Evaluator;
use crate::suggest::closest_match;

/// One compiled computed field.
#[derive(Debug, Clone)]
pub struct ComputedField {
    pub name: String,
    pub sources: Vec<StatePath>,
    /// `from` was a list: bind `input` as an array.
    pub many: bool,
    pub transform: String,
}

impl ComputedField {
    /// Evaluate the transform with the sources bound as `input`.
    pub fn evaluate(
        &self,
        lookup: impl Fn(&StatePath) -> Option<Value>,
        evaluator: &dyn Evaluator,
    ) -> Result<Value, StateError> {
        let values: Vec<Value> = self
            .sources
            .iter()
            .map(|p| lookup(p).unwrap_or(Value::Null))
            .collect();
        let input = if self.many {
            Value::Array(values)
        } else {
            values.into_iter().next().unwrap_or(Value::Null)
        };
        evaluator
            .evaluate_json(&self.transform, &json!({ "input": input }))
            .map_err(|source| StateError::Computation {
                field: self.name.clone(),
                source,
            })
    }
}

/// Dependency key: a scope plus its first key, or the whole scope.
type SourceKey = (Scope, Option<String>);

#[derive(Debug, Clone, Default)]
pub struct ComputedGraph {
    /// Fields in topological order; a field's position is its rank.
    fields: Vec<ComputedField>,
    rank: HashMap<String, usize>,
    /// Source key -> ranks of fields that read it directly.
    dependents: HashMap<SourceKey, BTreeSet<usize>>,
}

impl ComputedGraph {
    /// Compile a schema, failing on unknown references or any cycle.
    pub fn compile(schema: &StateSchema) -> Result<Self, StateError> {
        let mut parsed: Vec<ComputedField> = Vec::with_capacity(schema.computed.len());
        for (name, def) in &schema.computed {
            let mut sources = Vec::new();
            for raw in def.from.paths() {
                let path = StatePath::parse(raw)?;
                if path.scope() == Scope::Computed {
                    let reference = path.root_key().unwrap_or_default();
                    if !schema.computed.contains_key(reference) {
                        return Err(StateError::UnknownDependency {
                            field: name.clone(),
                            reference: raw.to_string(),
                            suggestion: closest_match(
                                reference,
                                schema.computed.keys().map(String::as_str),
                            )
                            .map(|s| format!("computed.{s}")),
                        });
                    }
                }
                sources.push(path);
            }
            parsed.push(ComputedField {
                name: name.clone(),
                sources,
                many: def.from.is_many(),
                transform: def.transform.clone(),
            });
        }

        // Build directed graph: edge from dependency -> dependent
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<NodeIndex> = (0..parsed.len()).map(|i| graph.add_node(i)).collect();
        let by_name: HashMap<&str, usize> = parsed
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();
        for (i, field) in parsed.iter().enumerate() {
            for source in &field.sources {
                if source.scope() != Scope::Computed {
                    continue;
                }
                if let Some(&dep) = source.root_key().and_then(|k| by_name.get(k)) {
                    graph.update_edge(nodes[dep], nodes[i], ());
                }
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            let names = cycle.into_iter().map(|n| parsed[graph[n]].name.clone()).collect();
            return Err(StateError::CircularDependency { cycle: names });
        }

        let sorted = toposort(&graph, None).map_err(|cycle| StateError::CircularDependency {
            cycle: vec![parsed[graph[cycle.node_id()]].name.clone()],
        })?;

        let mut slots: Vec<Option<ComputedField>> = parsed.into_iter().map(Some).collect();
        let mut fields = Vec::with_capacity(slots.len());
        for node in sorted {
            if let Some(field) = slots[graph[node]].take() {
                fields.push(field);
            }
        }

        let rank: HashMap<String, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let mut dependents: HashMap<SourceKey, BTreeSet<usize>> = HashMap::new();
        for (i, field) in fields.iter().enumerate() {
            for source in &field.sources {
                let key = (source.scope(), source.root_key().map(str::to_string));
                dependents.entry(key).or_default().insert(i);
            }
        }

        tracing::debug!(fields = fields.len(), "compiled computed-field graph");
        Ok(Self {
            fields,
            rank,
            dependents,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in evaluation order.
    pub fn fields(&self) -> &[ComputedField] {
        &self.fields
    }

    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.rank.get(name).copied()
    }

    fn direct_dependents(&self, scope: Scope, key: Option<&str>, out: &mut BTreeSet<usize>) {
        if let Some(key) = key {
            if let Some(set) = self.dependents.get(&(scope, Some(key.to_string()))) {
                out.extend(set);
            }
        }
        if let Some(set) = self.dependents.get(&(scope, None)) {
            out.extend(set);
        }
    }

    /// Ranks of every field transitively affected by writes to `changed`,
    /// in evaluation order. Unaffected fields are never visited.
    pub fn affected_by<'a>(&self, changed: impl IntoIterator<Item = &'a StatePath>) -> Vec<usize> {
        let mut affected = BTreeSet::new();
        for path in changed {
            self.direct_dependents(path.scope(), path.root_key(), &mut affected);
        }
        let mut frontier: Vec<usize> = affected.iter().copied().collect();
        while let Some(i) = frontier.pop() {
            let mut next = BTreeSet::new();
            self.direct_dependents(Scope::Computed, Some(&self.fields[i].name), &mut next);
            for j in next {
                if affected.insert(j) {
                    frontier.push(j);
                }
            }
        }
        affected.into_iter().collect()
    }

    /// Evaluate every field from scratch in topological order.
    pub fn evaluate_all(
        &self,
        lookup: impl Fn(&StatePath, &Map<String, Value>) -> Option<Value>,
        evaluator: &dyn Evaluator,
    ) -> Result<Map<String, Value>, StateError> {
        let mut computed = Map::new();
        for field in &self.fields {
            let value = field.evaluate(|p| lookup(p, &computed), evaluator)?;
            computed.insert(field.name.clone(), value);
        }
        Ok(computed)
    }
}

/// DFS with a recursion stack. Returns the cycle as a node chain that starts
/// and ends on the same node.
fn find_cycle(graph: &DiGraph<usize, ()>) -> Option<Vec<NodeIndex>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    fn visit(
        graph: &DiGraph<usize, ()>,
        node: NodeIndex,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        marks[node.index()] = Mark::OnStack;
        stack.push(node);
        let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
        next.sort();
        for neighbor in next {
            match marks[neighbor.index()] {
                Mark::OnStack => {
                    let start = stack.iter().position(|n| *n == neighbor).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(neighbor);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(graph, neighbor, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node.index()] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack = Vec::new();
    for node in graph.node_indices() {
        if marks[node.index()] == Mark::Unvisited {
            if let Some(cycle) = visit(graph, node, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomflow_types::workflow::{ComputedFieldDef, FieldSource};

    fn schema(fields: &[(&str, &[&str], &str)]) -> StateSchema {
        let mut schema = StateSchema::default();
        for (name, from, transform) in fields {
            let from = if from.len() == 1 {
                FieldSource::Single(from[0].to_string())
            } else {
                FieldSource::Many(from.iter().map(|s| s.to_string()).collect())
            };
            schema.computed.insert(
                name.to_string(),
                ComputedFieldDef {
                    from,
                    transform: transform.to_string(),
                },
            );
        }
        schema
    }

    // -----------------------------------------------------------------------
    // Cycle detection
    // -----------------------------------------------------------------------

    #[test]
    fn test_self_reference_is_cycle() {
        let err = ComputedGraph::compile(&schema(&[("a", &["computed.a"], "input")])).unwrap_err();
        match err {
            StateError::CircularDependency { cycle } => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_direct_cycle() {
        let err = ComputedGraph::compile(&schema(&[
            ("a", &["computed.b"], "input"),
            ("b", &["computed.a"], "input"),
        ]))
        .unwrap_err();
        assert_eq!(err.code(), "CIRCULAR_DEPENDENCY");
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_transitive_cycle() {
        let err = ComputedGraph::compile(&schema(&[
            ("a", &["computed.c"], "input"),
            ("b", &["computed.a"], "input"),
            ("c", &["state.x", "computed.b"], "input[1]"),
        ]))
        .unwrap_err();
        match err {
            StateError::CircularDependency { cycle } => {
                assert_eq!(cycle.len(), 4);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_computed_reference() {
        let err = ComputedGraph::compile(&schema(&[
            ("total", &["state.x"], "input"),
            ("double", &["computed.totl"], "input * 2"),
        ]))
        .unwrap_err();
        match err {
            StateError::UnknownDependency { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("computed.total"));
            }
            other => panic!("expected unknown dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_source_scope() {
        let err = ComputedGraph::compile(&schema(&[("a", &["stat.x"], "input")])).unwrap_err();
        assert_eq!(err.code(), "INVALID_PATH");
    }

    // -----------------------------------------------------------------------
    // Ordering & affected set
    // -----------------------------------------------------------------------

    #[test]
    fn test_topological_order() {
        let graph = ComputedGraph::compile(&schema(&[
            ("a_total", &["computed.m_mid"], "input + 1"),
            ("m_mid", &["computed.z_base"], "input + 1"),
            ("z_base", &["state.x"], "input"),
        ]))
        .unwrap();
        let order: Vec<&str> = graph.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, vec!["z_base", "m_mid", "a_total"]);
    }

    #[test]
    fn test_affected_subgraph_only() {
        let graph = ComputedGraph::compile(&schema(&[
            ("doubled", &["state.value"], "input * 2"),
            ("quad", &["computed.doubled"], "input * 2"),
            ("other", &["state.unrelated"], "input"),
        ]))
        .unwrap();
        let changed = [StatePath::parse("state.value").unwrap()];
        let names: Vec<&str> = graph
            .affected_by(changed.iter())
            .into_iter()
            .map(|i| graph.fields()[i].name.as_str())
            .collect();
        assert_eq!(names, vec!["doubled", "quad"]);
    }

    #[test]
    fn test_nested_write_affects_root_key_dependents() {
        let graph =
            ComputedGraph::compile(&schema(&[("n", &["state.user.name"], "input")])).unwrap();
        let changed = [StatePath::parse("state.user").unwrap()];
        assert_eq!(graph.affected_by(changed.iter()), vec![0]);
    }

    #[test]
    fn test_whole_scope_source_always_affected() {
        let graph = ComputedGraph::compile(&schema(&[("all", &["state"], "input")])).unwrap();
        let changed = [StatePath::parse("state.anything").unwrap()];
        assert_eq!(graph.affected_by(changed.iter()), vec![0]);
    }
}
