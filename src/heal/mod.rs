pub mod circuit_breaker;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;

pub use orchestrator::HealingOrchestrator;
pub use scheduler::Scheduler;
