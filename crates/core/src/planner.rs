//! Diffs declared resources against the last-applied snapshot and orders the
//! resulting actions.

use petgraph::graph::DiGraph;
use serde_json::Value as Json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;

use crate::graph::{stable_toposort, ResourceGraph};
use crate::model::{Attributes, Reference, ResolvedAttributes, ResourceId, ResourceSpec, Value};
use crate::state::{StateSnapshot, VersionId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("no valid action order: cycle between {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Cycle(Vec<ResourceId>),
    #[error("{from} references {reference}, but {} has no such attribute or output", .reference.resource)]
    UnknownField { from: ResourceId, reference: Reference },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind { Create, Update, Delete, NoOp }

/// Planned value of an attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    Known(Json),
    /// Depends on an output that only exists after apply.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDiff {
    pub name: String,
    pub before: Option<Json>,
    /// `None` when the attribute is no longer declared.
    pub after: Option<Planned>,
    pub forces_replacement: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanAction {
    pub id: ResourceId,
    pub kind: ActionKind,
    pub diffs: Vec<AttributeDiff>,
    /// One half of a delete-then-create pair.
    pub replace: bool,
    /// What to send to the provider; unknown references are still `Ref`s.
    pub attributes: Attributes,
    pub dependencies: Vec<ResourceId>,
    pub blocked_on: Vec<Reference>,
    /// Indices of actions in the same plan that must finish first.
    pub after: Vec<usize>,
    pub risk: Option<String>,
}

impl PlanAction {
    fn new(id: ResourceId, kind: ActionKind) -> Self {
        Self {
            id,
            kind,
            diffs: Vec::new(),
            replace: false,
            attributes: Attributes::new(),
            dependencies: Vec::new(),
            blocked_on: Vec::new(),
            after: Vec::new(),
            risk: None,
        }
    }

    pub fn is_change(&self) -> bool { self.kind != ActionKind::NoOp }
}

/// Decides whether a replacement is dangerous enough to need explicit consent,
/// e.g. because the resource's name is globally unique.
pub trait RiskPolicy: Send + Sync {
    fn replacement_risk(&self, spec: &ResourceSpec, diffs: &[AttributeDiff]) -> Option<String>;
}

/// Treats every replacement as routine.
pub struct NoRisk;

impl RiskPolicy for NoRisk {
    fn replacement_risk(&self, _spec: &ResourceSpec, _diffs: &[AttributeDiff]) -> Option<String> { None }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Snapshot version this plan was computed against.
    pub base_version: Option<VersionId>,
    pub actions: Vec<PlanAction>,
}

impl Plan {
    pub fn has_changes(&self) -> bool { self.actions.iter().any(PlanAction::is_change) }

    pub fn high_risk(&self) -> impl Iterator<Item = &PlanAction> {
        self.actions.iter().filter(|a| a.risk.is_some() && a.kind == ActionKind::Create)
    }

    /// (to add, to change, to destroy)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.actions.iter().fold((0, 0, 0), |(a, c, d), act| match act.kind {
            ActionKind::Create => (a + 1, c, d),
            ActionKind::Update => (a, c + 1, d),
            ActionKind::Delete => (a, c, d + 1),
            ActionKind::NoOp => (a, c, d),
        })
    }

    pub fn kinds(&self) -> Vec<(String, ActionKind)> {
        self.actions.iter().map(|a| (a.id.to_string(), a.kind)).collect()
    }
}

fn show(v: &Option<Json>) -> String {
    v.as_ref().map(ToString::to_string).unwrap_or_else(|| "null".to_string())
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for action in &self.actions {
            let marker = match (action.kind, action.replace) {
                (ActionKind::Delete, true) | (ActionKind::NoOp, _) => continue,
                (ActionKind::Create, true) => "-/+",
                (ActionKind::Create, false) => "  +",
                (ActionKind::Update, _) => "  ~",
                (ActionKind::Delete, false) => "  -",
            };
            write!(f, "{marker} {}", action.id)?;
            if let Some(reason) = &action.risk {
                write!(f, "  [HIGH RISK: {reason}]")?;
            }
            writeln!(f)?;
            for d in &action.diffs {
                let after = match &d.after {
                    Some(Planned::Known(v)) => v.to_string(),
                    Some(Planned::Unknown) => "(known after apply)".to_string(),
                    None => "null".to_string(),
                };
                let note = if d.forces_replacement { " # forces replacement" } else { "" };
                writeln!(f, "      {}: {} -> {}{}", d.name, show(&d.before), after, note)?;
            }
        }
        let (add, change, destroy) = self.counts();
        write!(f, "Plan: {add} to add, {change} to change, {destroy} to destroy.")
    }
}

/// Computes the ordered action list that moves `snapshot` to `graph`.
pub fn plan(graph: &ResourceGraph, snapshot: &StateSnapshot, risk: &dyn RiskPolicy) -> Result<Plan, PlanError> {
    let mut actions: Vec<PlanAction> = Vec::new();
    let mut final_action: HashMap<ResourceId, usize> = HashMap::new();
    let mut delete_action: HashMap<ResourceId, usize> = HashMap::new();

    for id in snapshot.resources.keys().filter(|id| !graph.contains(id)) {
        delete_action.insert(id.clone(), actions.len());
        let mut del = PlanAction::new(id.clone(), ActionKind::Delete);
        del.dependencies = snapshot.resources[id].dependencies.clone();
        actions.push(del);
    }

    // Declared values that are already known, declared values that wait on
    // an apply, and resources whose outputs only exist after they are
    // (re)created.
    let mut known: HashMap<ResourceId, ResolvedAttributes> = HashMap::new();
    let mut unknown: HashMap<ResourceId, HashSet<String>> = HashMap::new();
    let mut pending: HashSet<ResourceId> = HashSet::new();

    for spec in graph.ordered() {
        let lookup = |r: &Reference| -> Option<Json> {
            if let Some(v) = known.get(&r.resource).and_then(|m| m.get(&r.field)) {
                return Some(v.clone());
            }
            if pending.contains(&r.resource) || unknown.get(&r.resource).is_some_and(|f| f.contains(&r.field)) {
                return None;
            }
            snapshot.resolve(r)
        };
        let attributes: Attributes = spec.attributes.iter().map(|(k, v)| (k.clone(), v.substitute(&lookup))).collect();
        let resolved: ResolvedAttributes = attributes
            .iter()
            .filter_map(|(k, v)| v.resolve(&|_| None).ok().map(|j| (k.clone(), j)))
            .collect();
        let blocked_on: Vec<Reference> = {
            let set: BTreeSet<&Reference> = attributes.values().flat_map(Value::references).collect();
            set.into_iter().cloned().collect()
        };
        // Anything still unresolved must be waiting on an apply; otherwise
        // the field does not exist and never will.
        if let Some(r) = blocked_on
            .iter()
            .find(|r| !pending.contains(&r.resource) && !unknown.get(&r.resource).is_some_and(|f| f.contains(&r.field)))
        {
            return Err(PlanError::UnknownField { from: spec.id.clone(), reference: r.clone() });
        }
        let dependencies: Vec<ResourceId> = graph.dependencies(&spec.id).into_iter().cloned().collect();

        let mut action = PlanAction::new(spec.id.clone(), ActionKind::NoOp);
        action.dependencies = dependencies;
        action.blocked_on = blocked_on;
        action.attributes = attributes.clone();

        match snapshot.get(&spec.id) {
            None => {
                action.kind = ActionKind::Create;
                action.diffs = attributes
                    .iter()
                    .map(|(k, _)| AttributeDiff {
                        name: k.clone(),
                        before: None,
                        after: Some(planned(&resolved, k)),
                        forces_replacement: false,
                    })
                    .collect();
                pending.insert(spec.id.clone());
            }
            Some(current) => {
                let keys: BTreeSet<&String> = attributes.keys().chain(current.attributes.keys()).collect();
                for key in keys {
                    let before = current.attributes.get(key).cloned();
                    let after = attributes.get(key).map(|_| planned(&resolved, key));
                    let changed = match &after {
                        Some(Planned::Known(v)) => before.as_ref() != Some(v),
                        Some(Planned::Unknown) => true,
                        None => before.is_some(),
                    };
                    if changed {
                        action.diffs.push(AttributeDiff {
                            name: key.clone(),
                            before,
                            after,
                            forces_replacement: spec.immutable.contains(key),
                        });
                    }
                }
                if action.diffs.iter().any(|d| d.forces_replacement) {
                    action.kind = ActionKind::Create;
                    action.replace = true;
                    action.risk = risk.replacement_risk(spec, &action.diffs);
                    pending.insert(spec.id.clone());

                    let mut del = PlanAction::new(spec.id.clone(), ActionKind::Delete);
                    del.replace = true;
                    del.risk = action.risk.clone();
                    del.dependencies = current.dependencies.clone();
                    del.diffs = action.diffs.clone();
                    delete_action.insert(spec.id.clone(), actions.len());
                    actions.push(del);
                } else if !action.diffs.is_empty() {
                    action.kind = ActionKind::Update;
                }
            }
        }

        let waiting: HashSet<String> = attributes.keys().filter(|k| !resolved.contains_key(*k)).cloned().collect();
        if !waiting.is_empty() {
            unknown.insert(spec.id.clone(), waiting);
        }
        known.insert(spec.id.clone(), resolved);
        final_action.insert(spec.id.clone(), actions.len());
        actions.push(action);
    }

    let mut edges: Vec<(usize, usize)> = Vec::new();
    for (ix, action) in actions.iter().enumerate() {
        match (action.kind, action.replace) {
            (ActionKind::Delete, _) => {
                // Anything that was built on top of this resource goes first.
                for (other, state) in &snapshot.resources {
                    if other == &action.id || !state.dependencies.contains(&action.id) {
                        continue;
                    }
                    if let Some(&d) = delete_action.get(other) {
                        edges.push((d, ix));
                    } else if !action.replace {
                        if let Some(&f) = final_action.get(other) {
                            edges.push((f, ix));
                        }
                    }
                }
            }
            (_, replace) => {
                for dep in &action.dependencies {
                    if let Some(&f) = final_action.get(dep) {
                        edges.push((f, ix));
                    }
                }
                if replace {
                    edges.push((delete_action[&action.id], ix));
                }
            }
        }
    }

    let mut g: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<_> = (0..actions.len()).map(|i| g.add_node(i)).collect();
    for &(a, b) in &edges {
        g.update_edge(nodes[a], nodes[b], ());
    }
    let order = stable_toposort(&g).map_err(|members| {
        let ids: BTreeSet<ResourceId> = members.into_iter().map(|i| actions[i].id.clone()).collect();
        PlanError::Cycle(ids.into_iter().collect())
    })?;

    let mut position = vec![0; actions.len()];
    for (pos, &natural) in order.iter().enumerate() {
        position[natural] = pos;
    }
    for &(a, b) in &edges {
        let after = &mut actions[b].after;
        if !after.contains(&position[a]) {
            after.push(position[a]);
        }
    }
    let mut slots: Vec<Option<PlanAction>> = actions.into_iter().map(Some).collect();
    let mut ordered: Vec<PlanAction> = order.iter().filter_map(|&i| slots[i].take()).collect();
    for a in &mut ordered {
        a.after.sort_unstable();
    }

    Ok(Plan { base_version: snapshot.version, actions: ordered })
}

fn planned(resolved: &ResolvedAttributes, key: &str) -> Planned {
    resolved.get(key).map_or(Planned::Unknown, |j| Planned::Known(j.clone()))
}
