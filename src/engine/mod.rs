pub mod dag;
pub mod orchestrator;
pub mod template;
pub mod validate;

pub use dag::{execute_dag, DagOptions, StepExecutor};
pub use orchestrator::{Orchestrator, TaskOutcome, TaskRequest};
pub use template::resolve_template;
pub use validate::{topological_order, validate_plan};
