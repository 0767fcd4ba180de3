pub mod messages;
pub mod scheduler;

pub use scheduler::SchedulerHandle;
