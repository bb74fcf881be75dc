//! Build graph core for Gantry: scalar expression evaluation, the graph data
//! model, the script interpreter, and the reduction/export algorithms.
//!
//! Graph construction is single-threaded and deterministic: one top-to-bottom
//! pass over the script, no suspension points. `select`/`skip_triggers`
//! mutate the graph in place; `export`/`write_preprocessed`/`print` are pure
//! read-only projections.

pub mod export;
pub mod expr;
pub mod graph;
pub mod interpreter;
pub mod lockfile;
pub mod scope;
pub mod task;
pub mod trigger;

pub use export::{
    ExportedBadge, ExportedGroup, ExportedNode, ExportedNotify, ExportedPlan, ExportedReport,
};
pub use expr::{evaluate, evaluate_condition};
pub use graph::{
    Agent, AgentId, Aggregate, Badge, Graph, GraphDiagnostic, GraphOption, Node, NodeId,
    NodeOutput, OutputId, Report,
};
pub use interpreter::GraphScriptInterpreter;
pub use lockfile::{acquire, LockGuard, LockInfo};
pub use scope::ScopeStack;
pub use task::{
    JobContext, ParamKind, Task, TaskArgs, TaskDescriptor, TaskParameter, TaskRegistry,
    TempStorage,
};
pub use trigger::{ManualTrigger, TriggerArena, TriggerId};
