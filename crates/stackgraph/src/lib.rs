//! # Stackgraph
//!
//! Dependency-ordered provisioning of cloud resources.
//!
//! A stack is declared as a set of resource nodes whose properties may refer
//! to outputs of other nodes. This crate turns that declaration into a DAG,
//! diffs it against the persisted state of the last run, and executes the
//! resulting plan with bounded parallelism, rolling back on failure.
//!
//! ## Core Concepts
//!
//! - **ResourceNode**: A declared resource: kind, property bag, dependencies
//! - **ResourceGraph**: The validated, acyclic arena of nodes
//! - **ExecutionPlan**: Create/update/delete/no-op operations grouped in waves
//! - **StateStore**: Durable record of what was applied, written per operation
//! - **Executor**: Runs a plan against a [`Provider`] and reports every outcome
//!
//! ## Example
//!
//! ```ignore
//! use stackgraph::{
//!     ExecuteOptions, FileStateStore, NoProgress, PlanOptions, ResourceGraph,
//!     ResourceKind, ResourceNode, StateStore, execute, plan,
//! };
//!
//! let graph = ResourceGraph::build(vec![
//!     ResourceNode::builder("vpc", ResourceKind::Network)
//!         .prop("cidr", "10.0.0.0/16")
//!         .build()?,
//!     ResourceNode::builder("cluster", ResourceKind::Cluster)
//!         .prop("name", "prod")
//!         .prop("version", "1.29")
//!         .reference("network", "vpc", "id")
//!         .build()?,
//! ])?;
//!
//! let mut store = FileStateStore::open(".keel/prod")?;
//! let records = store.load()?;
//! let plan = plan(&graph, &records, &PlanOptions::default())?;
//!
//! let report = execute(
//!     &plan, &graph, &records, &my_provider, &mut store,
//!     &ExecuteOptions::default(), &mut NoProgress,
//! )?;
//! assert!(report.is_success());
//! ```
//!
//! ## Provider Traits
//!
//! The crate uses traits for dependency injection:
//!
//! - [`Provider`]: Creates, updates, deletes and looks up cloud resources
//! - [`StateStore`]: Persists resource records
//! - [`ProgressCallback`]: Receives progress updates
//!
//! This allows the crate to be used without hard dependencies on a
//! specific cloud SDK, storage backend or UI framework.

pub mod error;
pub mod executor;
pub mod graph;
pub mod node;
pub mod outputs;
pub mod plan;
pub mod policy;
pub mod provider;
pub mod report;
pub mod retry;
pub mod schema;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use error::{Error, Result};
pub use executor::{DEFAULT_MAX_CONCURRENCY, ExecuteOptions, execute};
pub use graph::ResourceGraph;
pub use node::{NodeBuilder, ResourceNode};
pub use outputs::{OutputResolver, ResolveError};
pub use plan::{
    ChangeReason, ExecutionPlan, OpKey, PlanAction, PlanOperation, PlanOptions, PlanSummary,
    ReplacePolicy, plan, plan_destroy,
};
pub use policy::{Effect, PolicySet, PolicyStatement};
pub use provider::{
    CancelToken, ErrorCategory, NoProgress, ProgressCallback, Provider, ProviderError, Realized,
};
pub use report::{
    ExecuteSummary, ExecutionReport, FailureCause, OpOutcome, OpReport, RollbackEntry,
    RollbackOutcome, RootCause, RunStatus,
};
pub use retry::RetryConfig;
pub use state::{
    FileStateStore, MemoryStateStore, RecordSet, RecordStatus, ResourceRecord, StateLock,
    StateStore,
};
pub use types::{DeferredRef, Outputs, Properties, ResourceKind, Value};
