pub mod consistency;
pub mod helpers;
pub mod orchestrator;
pub mod preflight;
pub mod runner;

pub use orchestrator::{MailboxStatus, MailboxSummary, Orchestrator, RunReport};
pub use preflight::PreflightResult;
pub use runner::{MailboxRunner, RunOutcome, RunnerStatus};
