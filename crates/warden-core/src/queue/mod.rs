//! Remediation queue: run model, persistence and the drain worker.

pub mod drain;
pub mod run;
pub mod store;

pub use drain::{drain_queue, DrainContext, DrainSummary};
pub use run::{
    ActionSnapshot, ApprovalMeta, ApprovalStatus, CanaryMeta, ExecuteRunPayload, QueueRuntimeMeta,
    QueuedRun, RollbackMeta, RunOutput, RunState,
};
pub use store::{PruneSummary, RedbStore, RunFilter, Store};
