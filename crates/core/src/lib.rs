//! Reconciliation core: turns declared resources into an ordered plan and
//! applies it against a provider under a state lock.

pub mod engine;
pub mod executor;
pub mod graph;
pub mod lock;
pub mod memory;
pub mod model;
pub mod planner;
pub mod provider;
pub mod refresh;
pub mod retry;
pub mod state;

pub use engine::{ApplyOutcome, EngineError, Reconciler, RunOptions};
pub use executor::{execute, ActionReport, ApplyReport, ExecuteOptions, Outcome, SkipReason};
pub use graph::{GraphError, ResourceGraph};
pub use lock::{LockError, LockInfo, LockManager, LockToken};
pub use memory::MemoryBackend;
pub use model::{Attributes, Declaration, Reference, ResolvedAttributes, ResourceId, ResourceSpec, Value};
pub use planner::{plan, ActionKind, AttributeDiff, NoRisk, Plan, PlanAction, PlanError, Planned, RiskPolicy};
pub use provider::{Created, MemoryProvider, ProviderClient};
pub use retry::RetryPolicy;
pub use state::{ResourceState, StateKey, StateSnapshot, StateStore, StoreError, VersionId};
