pub mod agent;
pub mod branch;
pub mod cancel;
pub mod context;
pub mod engine;
pub mod executors;
pub mod resolver;
pub mod scheduler;
pub mod text;

#[cfg(test)]
mod testing;

pub use agent::ToolAgent;
pub use cancel::RunRegistry;
pub use context::{ExecutionContext, Trace};
pub use engine::{Engine, ExecuteRequest, GraphSource, RunOutcome, RunStats};
pub use executors::{Collaborators, HandlerRegistry, NodeHandler, NodeOutput};
pub use scheduler::Scheduler;
