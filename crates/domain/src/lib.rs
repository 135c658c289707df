pub mod entities;
pub mod messaging;
pub mod progress;
pub mod registry;
pub mod repositories;
pub mod stage_graph;
pub mod transitions;

pub use entities::*;
pub use mediaflow_errors::{PipelineError, PipelineResult};
pub use messaging::*;
pub use progress::{aggregate, CurrentStage, ItemSnapshot, OverallStatus, StageProgress};
pub use registry::{TaskRegistry, TransitionListener};
pub use repositories::*;
pub use stage_graph::{StageGraph, StageWeight};
