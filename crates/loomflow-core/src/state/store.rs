//! Per-instance state store.
//!
//! Writers lock the top-level state keys they touch (sorted order, so
//! overlapping batches cannot deadlock), stage their operations on copies of
//! those keys, then commit and recompute affected computed fields under one
//! short write lock. Disjoint batches never wait on each other's staging, and
//! readers never observe a batch half-applied.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use loomflow_types::config::ConflictPolicy;
use loomflow_types::state::{StateSnapshot, UpdateKind, UpdateOperation, UpdateResult};
use loomflow_types::workflow::StateSchema;
use serde_json::{Map, Number, Value};

use super::graph::ComputedGraph;
use super::path::{Scope, StatePath};
use super::{StateError, json_type_name};
use crate::expression::Evaluator;

#[derive(Debug, Default)]
struct Tiers {
    raw: Map<String, Value>,
    state: Map<String, Value>,
    computed: Map<String, Value>,
    versions: HashMap<String, u64>,
}

impl Tiers {
    fn lookup(&self, path: &StatePath) -> Option<Value> {
        let tier = match path.scope() {
            Scope::Inputs => &self.raw,
            Scope::State => &self.state,
            Scope::Computed => &self.computed,
        };
        if path.segments().is_empty() {
            return Some(Value::Object(tier.clone()));
        }
        path.lookup(tier).cloned()
    }
}

#[derive(Debug)]
pub struct StateStore {
    graph: ComputedGraph,
    evaluator: Arc<dyn Evaluator>,
    policy: ConflictPolicy,
    tiers: RwLock<Tiers>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StateStore {
    /// Compile the schema and evaluate every computed field once.
    ///
    /// Fails (and no store exists) when the computed graph has a cycle or an
    /// unknown reference.
    pub fn new(
        schema: &StateSchema,
        inputs: Map<String, Value>,
        default_state: Map<String, Value>,
        evaluator: Arc<dyn Evaluator>,
        policy: ConflictPolicy,
    ) -> Result<Self, StateError> {
        let graph = ComputedGraph::compile(schema)?;
        let mut tiers = Tiers {
            raw: inputs,
            state: default_state,
            computed: Map::new(),
            versions: HashMap::new(),
        };
        tiers.computed = graph.evaluate_all(
            |path, computed| {
                if path.scope() == Scope::Computed {
                    if path.segments().is_empty() {
                        return Some(Value::Object(computed.clone()));
                    }
                    path.lookup(computed).cloned()
                } else {
                    tiers.lookup(path)
                }
            },
            evaluator.as_ref(),
        )?;
        Ok(Self {
            graph,
            evaluator,
            policy,
            tiers: RwLock::new(tiers),
            key_locks: DashMap::new(),
        })
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Consistent snapshot of all three tiers.
    pub fn read(&self) -> StateSnapshot {
        let tiers = self.tiers.read().expect("state lock poisoned");
        StateSnapshot {
            raw: tiers.raw.clone(),
            state: tiers.state.clone(),
            computed: tiers.computed.clone(),
        }
    }

    /// Value at one path, `None` when absent.
    pub fn get(&self, path: &str) -> Result<Option<Value>, StateError> {
        let path = StatePath::parse(path)?;
        let tiers = self.tiers.read().expect("state lock poisoned");
        Ok(tiers.lookup(&path))
    }

    /// Expression context (`state`, `inputs`, `raw`, `computed`) for the
    /// current snapshot.
    pub fn context(&self) -> Value {
        self.read().to_context()
    }

    /// Apply a batch atomically: every operation applies and every affected
    /// computed field is recomputed, or nothing changes.
    pub fn update(&self, ops: &[UpdateOperation]) -> Result<UpdateResult, StateError> {
        let parsed = ops
            .iter()
            .map(|op| {
                let path = StatePath::parse(&op.path)?;
                check_writable(&path)?;
                Ok((path, op))
            })
            .collect::<Result<Vec<_>, StateError>>()?;
        if parsed.is_empty() {
            return Ok(UpdateResult {
                success: true,
                ..UpdateResult::default()
            });
        }

        let keys: BTreeSet<String> = parsed
            .iter()
            .filter_map(|(p, _)| p.root_key().map(str::to_string))
            .collect();
        let locks: Vec<Arc<Mutex<()>>> = keys
            .iter()
            .map(|k| Arc::clone(self.key_locks.entry(k.clone()).or_default().value()))
            .collect();
        let _guards: Vec<_> = locks
            .iter()
            .map(|l| l.lock().expect("state key lock poisoned"))
            .collect();

        // Stage on copies of the touched keys only.
        let mut staged = {
            let tiers = self.tiers.read().expect("state lock poisoned");
            keys.iter()
                .filter_map(|k| tiers.state.get(k).map(|v| (k.clone(), v.clone())))
                .collect::<Map<String, Value>>()
        };
        for (path, op) in &parsed {
            apply_operation(&mut staged, path, op, self.policy)?;
        }

        let affected = self.graph.affected_by(parsed.iter().map(|(p, _)| p));

        let mut tiers = self.tiers.write().expect("state lock poisoned");
        let previous_state: Vec<(String, Option<Value>)> = keys
            .iter()
            .map(|k| (k.clone(), tiers.state.get(k).cloned()))
            .collect();
        for key in &keys {
            match staged.remove(key) {
                Some(value) => {
                    tiers.state.insert(key.clone(), value);
                }
                None => {
                    tiers.state.remove(key);
                }
            }
        }

        let mut previous_computed = Vec::with_capacity(affected.len());
        let mut recomputed = Vec::with_capacity(affected.len());
        for rank in &affected {
            let field = &self.graph.fields()[*rank];
            match field.evaluate(|p| tiers.lookup(p), self.evaluator.as_ref()) {
                Ok(value) => {
                    let old = tiers.computed.insert(field.name.clone(), value);
                    previous_computed.push((field.name.clone(), old));
                    recomputed.push(field.name.clone());
                }
                Err(err) => {
                    rollback(&mut tiers, previous_state, previous_computed);
                    return Err(err);
                }
            }
        }

        let mut versions = BTreeMap::new();
        for key in &keys {
            let version = tiers.versions.entry(key.clone()).or_insert(0);
            *version += 1;
            versions.insert(key.clone(), *version);
        }

        let mut state_updates = BTreeMap::new();
        for (path, _) in &parsed {
            if let Some(value) = tiers.lookup(path) {
                state_updates.insert(path.to_string(), value);
            }
        }
        for name in &recomputed {
            if let Some(value) = tiers.computed.get(name) {
                state_updates.insert(format!("computed.{name}"), value.clone());
            }
        }
        drop(tiers);

        tracing::debug!(
            applied = parsed.len(),
            recomputed = recomputed.len(),
            "state batch committed"
        );
        Ok(UpdateResult {
            success: true,
            applied: parsed.len(),
            recomputed,
            state_updates,
            versions,
        })
    }
}

fn check_writable(path: &StatePath) -> Result<(), StateError> {
    match path.scope() {
        Scope::State if path.root_key().is_some() => Ok(()),
        Scope::State => Err(StateError::invalid_path(
            path.to_string(),
            "writes must name a key below 'state'",
        )),
        Scope::Computed => Err(StateError::invalid_path(
            path.to_string(),
            "computed fields are derived and cannot be written",
        )),
        Scope::Inputs => Err(StateError::invalid_path(
            path.to_string(),
            "inputs are immutable after start",
        )),
    }
}

fn rollback(
    tiers: &mut Tiers,
    previous_state: Vec<(String, Option<Value>)>,
    previous_computed: Vec<(String, Option<Value>)>,
) {
    for (key, old) in previous_state {
        match old {
            Some(value) => tiers.state.insert(key, value),
            None => tiers.state.remove(&key),
        };
    }
    for (name, old) in previous_computed.into_iter().rev() {
        match old {
            Some(value) => tiers.computed.insert(name, value),
            None => tiers.computed.remove(&name),
        };
    }
}

pub(crate) fn apply_operation(
    staged: &mut Map<String, Value>,
    path: &StatePath,
    op: &UpdateOperation,
    policy: ConflictPolicy,
) -> Result<(), StateError> {
    let slot = path.slot(staged)?;
    match op.operation {
        UpdateKind::Set => match policy {
            ConflictPolicy::LastWriterWins => *slot = op.value.clone(),
            ConflictPolicy::Merge => merge_into(slot, &op.value),
        },
        UpdateKind::Merge => merge_into(slot, &op.value),
        UpdateKind::Append => match slot {
            Value::Null => *slot = Value::Array(vec![op.value.clone()]),
            Value::Array(items) => items.push(op.value.clone()),
            other => {
                return Err(StateError::TypeMismatch {
                    path: path.to_string(),
                    operation: "append".to_string(),
                    expected: "array",
                    found: json_type_name(other).to_string(),
                });
            }
        },
        UpdateKind::Increment => {
            let by = match &op.value {
                Value::Null => 1.0,
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                other => {
                    return Err(StateError::TypeMismatch {
                        path: path.to_string(),
                        operation: "increment by".to_string(),
                        expected: "number",
                        found: json_type_name(other).to_string(),
                    });
                }
            };
            let current = match slot {
                Value::Null => 0.0,
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                other => {
                    return Err(StateError::TypeMismatch {
                        path: path.to_string(),
                        operation: "increment".to_string(),
                        expected: "number",
                        found: json_type_name(other).to_string(),
                    });
                }
            };
            *slot = json_number(current + by);
        }
    }
    Ok(())
}

/// Deep-merge objects, concatenate arrays, otherwise replace.
fn merge_into(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(new)) => {
            for (k, v) in new {
                merge_into(existing.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (Value::Array(existing), Value::Array(new)) => existing.extend(new.iter().cloned()),
        (target, incoming) => *target = incoming.clone(),
    }
}

fn json_number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{BasicEvaluator, ExpressionEngine};
    use loomflow_types::workflow::{ComputedFieldDef, FieldSource};
    use serde_json::json;

    fn schema(fields: &[(&str, FieldSource, &str)]) -> StateSchema {
        let mut schema = StateSchema::default();
        for (name, from, transform) in fields {
            schema.computed.insert(
                name.to_string(),
                ComputedFieldDef {
                    from: from.clone(),
                    transform: transform.to_string(),
                },
            );
        }
        schema
    }

    fn single(path: &str) -> FieldSource {
        FieldSource::Single(path.to_string())
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn store(schema: &StateSchema, state: Value) -> StateStore {
        StateStore::new(
            schema,
            obj(json!({"limit": 10})),
            obj(state),
            Arc::new(ExpressionEngine::new()),
            ConflictPolicy::LastWriterWins,
        )
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn test_cyclic_schema_never_constructs() {
        let cyclic = schema(&[
            ("a", single("computed.b"), "input"),
            ("b", single("computed.a"), "input"),
        ]);
        let result = StateStore::new(
            &cyclic,
            Map::new(),
            Map::new(),
            Arc::new(ExpressionEngine::new()),
            ConflictPolicy::LastWriterWins,
        );
        assert!(matches!(result, Err(StateError::CircularDependency { .. })));
    }

    #[test]
    fn test_initial_computed_evaluation() {
        let s = store(
            &schema(&[
                ("doubled", single("state.value"), "input * 2"),
                (
                    "capped",
                    FieldSource::Many(vec!["computed.doubled".into(), "inputs.limit".into()]),
                    "input[0] > input[1] ? input[1] : input[0]",
                ),
            ]),
            json!({"value": 3}),
        );
        let snap = s.read();
        assert_eq!(snap.computed["doubled"], json!(6));
        assert_eq!(snap.computed["capped"], json!(6));
        assert_eq!(snap.raw["limit"], json!(10));
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    #[test]
    fn test_doubled_example() {
        let s = store(
            &schema(&[
                ("doubled", single("state.value"), "input * 2"),
                ("other", single("state.unrelated"), "input + 1"),
            ]),
            json!({"value": 0, "unrelated": 1}),
        );
        let result = s.update(&[UpdateOperation::set("state.value", json!(5))]).unwrap();
        assert_eq!(s.read().computed["doubled"], json!(10));
        assert_eq!(result.recomputed, vec!["doubled".to_string()]);

        let result = s.update(&[UpdateOperation::set("state.value", json!(7))]).unwrap();
        assert_eq!(s.read().computed["doubled"], json!(14));
        assert_eq!(result.recomputed, vec!["doubled".to_string()]);
        assert_eq!(s.read().computed["other"], json!(2));
    }

    #[test]
    fn test_append_and_increment() {
        let s = store(&StateSchema::default(), json!({"list": [1]}));
        s.update(&[
            UpdateOperation::append("state.list", json!(2)),
            UpdateOperation::append("state.fresh", json!("a")),
            UpdateOperation::increment("state.count", Value::Null),
            UpdateOperation::increment("state.count", 4),
        ])
        .unwrap();
        let snap = s.read();
        assert_eq!(snap.state["list"], json!([1, 2]));
        assert_eq!(snap.state["fresh"], json!(["a"]));
        assert_eq!(snap.state["count"], json!(5));
    }

    #[test]
    fn test_computed_write_aborts_whole_batch() {
        let s = store(
            &schema(&[("doubled", single("state.value"), "input * 2")]),
            json!({"value": 1}),
        );
        let err = s
            .update(&[
                UpdateOperation::set("state.value", json!(100)),
                UpdateOperation::set("computed.doubled", json!(3)),
            ])
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PATH");
        let snap = s.read();
        assert_eq!(snap.state["value"], json!(1));
        assert_eq!(snap.computed["doubled"], json!(2));
    }

    #[test]
    fn test_inputs_are_read_only() {
        let s = store(&StateSchema::default(), json!({}));
        let err = s
            .update(&[UpdateOperation::set("inputs.limit", json!(1))])
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn test_type_mismatch_rolls_back_earlier_ops() {
        let s = store(&StateSchema::default(), json!({"a": 1, "name": "x"}));
        let err = s
            .update(&[
                UpdateOperation::set("state.a", json!(2)),
                UpdateOperation::increment("state.name", 1),
            ])
            .unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");
        assert_eq!(s.read().state["a"], json!(1));
    }

    #[test]
    fn test_failed_recompute_rolls_back() {
        let s = store(
            &schema(&[("upper", single("state.name"), "input.toUpperCase()")]),
            json!({"name": "a", "other": 0}),
        );
        assert_eq!(s.read().computed["upper"], json!("A"));

        let err = s
            .update(&[
                UpdateOperation::set("state.other", json!(1)),
                UpdateOperation::set("state.name", json!(5)),
            ])
            .unwrap_err();
        assert_eq!(err.code(), "COMPUTED_FIELD_FAILED");
        let snap = s.read();
        assert_eq!(snap.state["name"], json!("a"));
        assert_eq!(snap.state["other"], json!(0));
        assert_eq!(snap.computed["upper"], json!("A"));
    }

    #[test]
    fn test_basic_evaluator_rejects_methods_at_construction() {
        let s = StateStore::new(
            &schema(&[("upper", single("state.name"), "input.toUpperCase()")]),
            Map::new(),
            obj(json!({"name": "a"})),
            Arc::new(BasicEvaluator::new()),
            ConflictPolicy::LastWriterWins,
        );
        assert!(matches!(s, Err(StateError::Computation { .. })));
    }

    #[test]
    fn test_update_then_read_matches_fresh_evaluation() {
        let sch = schema(&[
            ("sum", FieldSource::Many(vec!["state.a".into(), "state.b".into()]), "input[0] + input[1]"),
            ("label", single("computed.sum"), "'sum=' + input"),
        ]);
        let s = store(&sch, json!({"a": 1, "b": 2}));
        s.update(&[
            UpdateOperation::set("state.a", json!(10)),
            UpdateOperation::set("state.b", json!(5)),
        ])
        .unwrap();
        let snap = s.read();
        let fresh = store(&sch, Value::Object(snap.state.clone()));
        assert_eq!(snap.computed, fresh.read().computed);
        assert_eq!(snap.computed["label"], json!("sum=15"));
    }

    #[test]
    fn test_versions_and_state_updates_reported() {
        let s = store(
            &schema(&[("doubled", single("state.value"), "input * 2")]),
            json!({"value": 1}),
        );
        s.update(&[UpdateOperation::set("state.value", json!(2))]).unwrap();
        let result = s.update(&[UpdateOperation::set("state.value", json!(3))]).unwrap();
        assert_eq!(result.versions["value"], 2);
        assert_eq!(result.state_updates["state.value"], json!(3));
        assert_eq!(result.state_updates["computed.doubled"], json!(6));
    }

    #[test]
    fn test_get_path() {
        let s = store(&StateSchema::default(), json!({"user": {"name": "ada"}}));
        assert_eq!(s.get("state.user.name").unwrap(), Some(json!("ada")));
        assert_eq!(s.get("state.user.age").unwrap(), None);
        assert!(s.get("nope.x").is_err());
    }

    // -----------------------------------------------------------------------
    // Conflict policy & concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn test_merge_policy_deep_merges() {
        let s = StateStore::new(
            &StateSchema::default(),
            Map::new(),
            obj(json!({"profile": {"a": 1, "tags": ["x"]}})),
            Arc::new(ExpressionEngine::new()),
            ConflictPolicy::Merge,
        )
        .unwrap();
        s.update(&[UpdateOperation::set(
            "state.profile",
            json!({"b": 2, "tags": ["y"]}),
        )])
        .unwrap();
        assert_eq!(
            s.read().state["profile"],
            json!({"a": 1, "b": 2, "tags": ["x", "y"]})
        );
    }

    #[test]
    fn test_last_writer_wins_replaces() {
        let s = store(&StateSchema::default(), json!({"profile": {"a": 1}}));
        s.update(&[UpdateOperation::set("state.profile", json!({"b": 2}))])
            .unwrap();
        assert_eq!(s.read().state["profile"], json!({"b": 2}));
    }

    #[test]
    fn test_concurrent_disjoint_writers() {
        let s = Arc::new(store(
            &schema(&[(
                "total",
                FieldSource::Many(vec!["state.left".into(), "state.right".into()]),
                "input[0] + input[1]",
            )]),
            json!({"left": 0, "right": 0}),
        ));
        let handles: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|key| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        s.update(&[UpdateOperation::increment(format!("state.{key}"), 1)])
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = s.read();
        assert_eq!(snap.state["left"], json!(100));
        assert_eq!(snap.state["right"], json!(100));
        assert_eq!(snap.computed["total"], json!(200));
    }

    #[test]
    fn test_concurrent_same_path_appends_are_not_lost() {
        let s = Arc::new(store(&StateSchema::default(), json!({"log": []})));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        s.update(&[UpdateOperation::append("state.log", json!(t * 100 + i))])
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.read().state["log"].as_array().unwrap().len(), 100);
    }
}
