//! One reconciliation run: lock, load, plan, execute, save, unlock.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::executor::{execute, ApplyReport, ExecuteOptions};
use crate::graph::{GraphError, ResourceGraph};
use crate::lock::{log_forced_release, LockError, LockInfo, LockManager, LockToken};
use crate::planner::{plan, Plan, PlanError, RiskPolicy};
use crate::provider::ProviderClient;
use crate::refresh::refresh;
use crate::retry::RetryPolicy;
use crate::state::{StateKey, StateSnapshot, StateStore, StoreError, VersionId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("refresh failed: {0:#}")]
    Refresh(anyhow::Error),
    #[error("plan replaces high-risk resources ({}); re-run with high-risk replacements allowed to proceed", .0.join(", "))]
    HighRisk(Vec<String>),
    #[error("lock id {given} does not match the lock held on '{key}' ({held})")]
    LockIdMismatch { key: StateKey, given: String, held: String },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Recorded on the lock, e.g. `user@host`.
    pub holder: String,
    pub refresh: bool,
    pub allow_high_risk: bool,
    pub execute: ExecuteOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { holder: "rekon".to_string(), refresh: false, allow_high_risk: false, execute: ExecuteOptions::default() }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub plan: Plan,
    pub report: ApplyReport,
    /// Version written, if anything changed.
    pub saved: Option<VersionId>,
}

pub struct Reconciler {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockManager>,
    provider: Arc<dyn ProviderClient>,
    risk: Arc<dyn RiskPolicy>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<dyn LockManager>,
        provider: Arc<dyn ProviderClient>,
        risk: Arc<dyn RiskPolicy>,
    ) -> Self {
        Self { store, locks, provider, risk, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Computes the plan under a `plan` lock. Nothing is written.
    pub async fn plan(&self, key: &StateKey, graph: &ResourceGraph, opts: &RunOptions) -> Result<Plan, EngineError> {
        let token = self.locks.acquire(key, &opts.holder, "plan").await?;
        let res = self.plan_locked(key, graph, opts).await.map(|(p, _, _)| p);
        self.finish(&token, res).await
    }

    /// Plans and applies under an `apply` lock. Per-resource failures are in
    /// the report; an `Err` means the run could not start or could not save.
    pub async fn apply(
        &self,
        key: &StateKey,
        graph: &ResourceGraph,
        opts: &RunOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<ApplyOutcome, EngineError> {
        let token = self.locks.acquire(key, &opts.holder, "apply").await?;
        tracing::info!(key = %key, holder = %opts.holder, "lock acquired");
        let res = self.apply_locked(key, &token, graph, opts, cancel).await;
        self.finish(&token, res).await
    }

    async fn apply_locked(
        &self,
        key: &StateKey,
        token: &LockToken,
        graph: &ResourceGraph,
        opts: &RunOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<ApplyOutcome, EngineError> {
        let (plan, snapshot, drifted) = self.plan_locked(key, graph, opts).await?;

        let risky: Vec<String> = plan.high_risk().map(|a| a.id.to_string()).collect();
        if !risky.is_empty() && !opts.allow_high_risk {
            return Err(EngineError::HighRisk(risky));
        }

        let (add, change, destroy) = plan.counts();
        tracing::info!(key = %key, add, change, destroy, "applying plan");
        let report = execute(&plan, snapshot, self.provider.clone(), &opts.execute, cancel).await;

        // Refresh findings are worth keeping even when no action ran.
        let saved = if report.changed || drifted {
            let version = self
                .retry
                .run("save", || self.store.save(key, token, plan.base_version, &report.snapshot))
                .await?;
            tracing::info!(key = %key, version = %version, "state saved");
            Some(version)
        } else {
            None
        };
        Ok(ApplyOutcome { plan, report, saved })
    }

    /// Also reports whether refresh changed the loaded snapshot.
    async fn plan_locked(
        &self,
        key: &StateKey,
        graph: &ResourceGraph,
        opts: &RunOptions,
    ) -> Result<(Plan, StateSnapshot, bool), EngineError> {
        let mut snapshot = self.load_or_empty(key).await?;
        let mut drifted = false;
        if opts.refresh {
            let refreshed = refresh(&snapshot, self.provider.as_ref()).await.map_err(EngineError::Refresh)?;
            drifted = refreshed.resources != snapshot.resources;
            snapshot.resources = refreshed.resources;
        }
        let plan = plan(graph, &snapshot, self.risk.as_ref())?;
        Ok((plan, snapshot, drifted))
    }

    async fn load_or_empty(&self, key: &StateKey) -> Result<StateSnapshot, EngineError> {
        match self.retry.run("load", || self.store.load(key)).await {
            Ok(s) => Ok(s),
            Err(StoreError::NotFound(_)) => {
                tracing::info!(key = %key, "no prior state, starting empty");
                Ok(StateSnapshot::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lock whatever happened; a release failure only wins when
    /// the run itself succeeded.
    async fn finish<T>(&self, token: &LockToken, res: Result<T, EngineError>) -> Result<T, EngineError> {
        match self.locks.release(token).await {
            Ok(()) => res,
            Err(e) => {
                tracing::warn!(key = %token.key, error = %e, "failed to release lock");
                match res {
                    Ok(_) => Err(e.into()),
                    Err(run) => Err(run),
                }
            }
        }
    }

    /// Removes the lock on `key` after checking it is the one the operator
    /// meant.
    pub async fn force_unlock(&self, key: &StateKey, lock_id: &str) -> Result<LockInfo, EngineError> {
        let held = match self.locks.current(key).await? {
            Some(held) => held,
            None => {
                log_forced_release(key, None);
                return Err(EngineError::LockIdMismatch { key: key.clone(), given: lock_id.to_string(), held: "<none>".into() });
            }
        };
        if held.id != lock_id {
            return Err(EngineError::LockIdMismatch { key: key.clone(), given: lock_id.to_string(), held: held.id });
        }
        self.locks.force_release(key).await?;
        Ok(held)
    }

    pub async fn current_lock(&self, key: &StateKey) -> Result<Option<LockInfo>, EngineError> {
        Ok(self.locks.current(key).await?)
    }

    pub async fn versions(&self, key: &StateKey) -> Result<Vec<VersionId>, EngineError> {
        Ok(self.retry.run("list_versions", || self.store.list_versions(key)).await?)
    }

    pub async fn snapshot(&self, key: &StateKey, version: Option<VersionId>) -> Result<StateSnapshot, EngineError> {
        let res = match version {
            Some(v) => self.retry.run("load_version", || self.store.load_version(key, v)).await,
            None => self.retry.run("load", || self.store.load(key)).await,
        };
        Ok(res?)
    }
}
