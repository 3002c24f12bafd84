//! Runs a plan against a provider with a bounded worker pool.
//!
//! Actions start once everything in their `after` list has finished. A
//! failure only stops the actions that (transitively) wait on it; unrelated
//! branches keep going.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::model::{Reference, ResolvedAttributes, ResourceId};
use crate::planner::{ActionKind, Plan, PlanAction};
use crate::provider::ProviderClient;
use crate::state::{ResourceState, StateSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub parallelism: usize,
    pub action_timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self { Self { parallelism: 4, action_timeout: Duration::from_secs(300) } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BlockedBy(ResourceId),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    NoOp,
    Failed { cause: String },
    TimedOut,
    Skipped(SkipReason),
}

impl Outcome {
    /// Higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            Outcome::NoOp => 0,
            Outcome::Applied => 1,
            Outcome::Skipped(_) => 2,
            Outcome::Failed { .. } | Outcome::TimedOut => 3,
        }
    }

    fn blocks_dependents(&self) -> bool { self.severity() >= 2 }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Applied => f.write_str("applied"),
            Outcome::NoOp => f.write_str("no changes"),
            Outcome::Failed { cause } => write!(f, "failed: {cause}"),
            Outcome::TimedOut => f.write_str("timed out"),
            Outcome::Skipped(SkipReason::BlockedBy(id)) => write!(f, "skipped (blocked by {id})"),
            Outcome::Skipped(SkipReason::Cancelled) => f.write_str("skipped (cancelled)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionReport {
    pub id: ResourceId,
    pub kind: ActionKind,
    pub replace: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub actions: Vec<ActionReport>,
    /// Starting snapshot with every successful action merged in.
    pub snapshot: StateSnapshot,
    /// Whether any provider side effect landed.
    pub changed: bool,
}

impl ApplyReport {
    pub fn worst(&self) -> Outcome {
        self.actions.iter().map(|a| a.outcome.clone()).max_by_key(Outcome::severity).unwrap_or(Outcome::NoOp)
    }

    /// Outcome of the last action for `id` (the create half of a replace).
    pub fn outcome_of(&self, id: &str) -> Option<&Outcome> {
        self.actions.iter().rev().find(|a| a.id.to_string() == id).map(|a| &a.outcome)
    }

    pub fn is_success(&self) -> bool { self.worst().severity() <= 1 }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for a in &self.actions {
            let kind = match (a.kind, a.replace) {
                (ActionKind::Create, true) => "replace (create)",
                (ActionKind::Delete, true) => "replace (delete)",
                (ActionKind::Create, false) => "create",
                (ActionKind::Update, _) => "update",
                (ActionKind::Delete, false) => "delete",
                (ActionKind::NoOp, _) => "-",
            };
            writeln!(f, "  {:<40} {:<18} {}", a.id.to_string(), kind, a.outcome)?;
        }
        Ok(())
    }
}

enum Effect {
    Created { provider_id: String, computed: ResolvedAttributes, attributes: ResolvedAttributes },
    Updated { computed: ResolvedAttributes, attributes: ResolvedAttributes },
    Deleted,
}

enum Call {
    Create(ResolvedAttributes),
    Update(String, ResolvedAttributes),
    Delete(String),
}

async fn run_call(provider: Arc<dyn ProviderClient>, type_name: String, call: Call) -> anyhow::Result<Effect> {
    match call {
        Call::Create(attributes) => {
            let created = provider.create(&type_name, &attributes).await?;
            Ok(Effect::Created { provider_id: created.provider_id, computed: created.computed, attributes })
        }
        Call::Update(provider_id, attributes) => {
            let computed = provider.update(&type_name, &provider_id, &attributes).await?;
            Ok(Effect::Updated { computed, attributes })
        }
        Call::Delete(provider_id) => {
            provider.delete(&type_name, &provider_id).await?;
            Ok(Effect::Deleted)
        }
    }
}

/// Works out the provider call for `action`, with references resolved
/// against everything applied so far. `Ok(None)` means nothing to call.
fn prepare(action: &PlanAction, snapshot: &StateSnapshot) -> Result<Option<Call>, String> {
    let resolve = || -> Result<ResolvedAttributes, String> {
        action
            .attributes
            .iter()
            .map(|(k, v)| {
                v.resolve(&|r: &Reference| snapshot.resolve(r)).map(|j| (k.clone(), j)).map_err(|unknown| {
                    let names: Vec<String> = unknown.iter().map(ToString::to_string).collect();
                    format!("unresolved references at apply time: {}", names.join(", "))
                })
            })
            .collect()
    };
    let current = snapshot.get(&action.id).map(|s| s.provider_id.clone());
    match (action.kind, current) {
        (ActionKind::NoOp, _) => Ok(None),
        (ActionKind::Create, _) => Ok(Some(Call::Create(resolve()?))),
        (ActionKind::Update, Some(pid)) => Ok(Some(Call::Update(pid, resolve()?))),
        (ActionKind::Update, None) => Err(format!("{} is missing from state", action.id)),
        (ActionKind::Delete, Some(pid)) => Ok(Some(Call::Delete(pid))),
        (ActionKind::Delete, None) => Ok(None),
    }
}

fn merge(snapshot: &mut StateSnapshot, action: &PlanAction, effect: Effect) {
    match effect {
        Effect::Created { provider_id, computed, attributes } => {
            snapshot.resources.insert(
                action.id.clone(),
                ResourceState { provider_id, attributes, computed, dependencies: action.dependencies.clone() },
            );
        }
        Effect::Updated { computed, attributes } => {
            if let Some(entry) = snapshot.resources.get_mut(&action.id) {
                entry.attributes = attributes;
                entry.computed.extend(computed);
                entry.dependencies = action.dependencies.clone();
            }
        }
        Effect::Deleted => {
            snapshot.resources.remove(&action.id);
        }
    }
}

/// Applies `plan` on top of `base`. Never returns early: every action gets
/// an outcome and the merged snapshot is always handed back for saving.
pub async fn execute(
    plan: &Plan,
    base: StateSnapshot,
    provider: Arc<dyn ProviderClient>,
    opts: &ExecuteOptions,
    mut cancel: watch::Receiver<bool>,
) -> ApplyReport {
    let n = plan.actions.len();
    let parallelism = opts.parallelism.max(1);
    let mut outcomes: Vec<Option<Outcome>> = vec![None; n];
    let mut started = vec![false; n];
    let mut snapshot = base;
    let mut changed = false;
    let mut cancelled = *cancel.borrow();
    let mut cancel_open = true;
    let mut running: JoinSet<(usize, Result<Effect, Outcome>)> = JoinSet::new();

    loop {
        // `after` always points at earlier actions, so one pass in plan order
        // settles everything that can be settled right now.
        for i in 0..n {
            if outcomes[i].is_some() || started[i] {
                continue;
            }
            let action = &plan.actions[i];
            if let Some(&blocker) = action.after.iter().find(|&&p| outcomes[p].as_ref().is_some_and(Outcome::blocks_dependents)) {
                if action.kind != ActionKind::NoOp {
                    tracing::warn!(resource = %action.id, blocked_by = %plan.actions[blocker].id, "skipping action");
                    outcomes[i] = Some(Outcome::Skipped(SkipReason::BlockedBy(plan.actions[blocker].id.clone())));
                    continue;
                }
            }
            if !action.after.iter().all(|&p| outcomes[p].is_some()) {
                continue;
            }
            if action.kind == ActionKind::NoOp {
                outcomes[i] = Some(Outcome::NoOp);
                continue;
            }
            if cancelled || running.len() >= parallelism {
                continue;
            }
            match prepare(action, &snapshot) {
                Err(cause) => outcomes[i] = Some(Outcome::Failed { cause }),
                Ok(None) => outcomes[i] = Some(Outcome::Applied),
                Ok(Some(call)) => {
                    started[i] = true;
                    let provider = provider.clone();
                    let type_name = action.id.type_name.clone();
                    let timeout = opts.action_timeout;
                    let span = tracing::info_span!("action", resource = %action.id, kind = ?action.kind, replace = action.replace);
                    tracing::debug!(parent: &span, "starting");
                    running.spawn(
                        async move {
                            let res = match tokio::time::timeout(timeout, run_call(provider, type_name, call)).await {
                                Ok(Ok(effect)) => Ok(effect),
                                Ok(Err(e)) => Err(Outcome::Failed { cause: format!("{e:#}") }),
                                Err(_) => Err(Outcome::TimedOut),
                            };
                            (i, res)
                        }
                        .instrument(span),
                    );
                }
            }
        }

        if running.is_empty() {
            break;
        }

        tokio::select! {
            joined = running.join_next() => match joined {
                Some(Ok((i, Ok(effect)))) => {
                    let action = &plan.actions[i];
                    tracing::info!(resource = %action.id, kind = ?action.kind, "applied");
                    merge(&mut snapshot, action, effect);
                    changed = true;
                    outcomes[i] = Some(Outcome::Applied);
                }
                Some(Ok((i, Err(outcome)))) => {
                    tracing::warn!(resource = %plan.actions[i].id, outcome = %outcome, "action did not complete");
                    outcomes[i] = Some(outcome);
                }
                Some(Err(e)) => tracing::error!(error = %e, "action task aborted"),
                None => {}
            },
            res = cancel.changed(), if cancel_open && !cancelled => match res {
                Ok(()) if *cancel.borrow() => {
                    tracing::warn!(in_flight = running.len(), "apply cancelled; waiting for started actions");
                    cancelled = true;
                }
                Ok(()) => {}
                Err(_) => cancel_open = false,
            },
        }
    }

    let mut actions = Vec::with_capacity(n);
    for i in 0..n {
        let outcome = match outcomes[i].take() {
            Some(o) => o,
            None if started[i] => Outcome::Failed { cause: "worker task aborted".to_string() },
            None => {
                let blocker = plan.actions[i]
                    .after
                    .iter()
                    .find(|&&p| actions.get(p).is_some_and(|r: &ActionReport| r.outcome.blocks_dependents()));
                match blocker {
                    Some(&p) => Outcome::Skipped(SkipReason::BlockedBy(plan.actions[p].id.clone())),
                    None => Outcome::Skipped(SkipReason::Cancelled),
                }
            }
        };
        let a = &plan.actions[i];
        actions.push(ActionReport { id: a.id.clone(), kind: a.kind, replace: a.replace, outcome });
    }

    ApplyReport { actions, snapshot, changed }
}
