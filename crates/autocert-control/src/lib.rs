//! Certificate lifecycle control: the renewal orchestrator and the serial
//! scheduler that drives it.
pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::{
    CleanupFailure, Clock, OrchestrationError, OrchestratorConfig, RenewalFailure,
    RenewalOrchestrator, RenewalOutcome, Stage, SystemClock,
};
pub use scheduler::{DomainJob, RenewalJob, Scheduler, SchedulerConfig, SchedulerState};
