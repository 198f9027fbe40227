pub mod config;
pub mod error;
pub mod graph;
pub mod trace;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result, RunFailure};
pub use graph::{Edge, Graph, Node, NodeKind};
pub use trace::{Diagnostic, StepRecord, StepStatus};
pub use types::*;
