//! vmci: boot a VM from a known-good baseline, provision it, drive real
//! workflows inside it, validate their outputs and publish a new versioned
//! bundle.
//!
//! The entry point is [`orchestrator::Orchestrator`]; everything else is a
//! component it sequences.

pub mod artifacts;
pub mod config;
pub mod guest;
pub mod harness_client;
pub mod logging;
pub mod logs;
pub mod orchestrator;
pub mod pipeline;
pub mod provision;
pub mod report;
pub mod util;
pub mod vmm;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use config::PipelineConfig;
pub use orchestrator::{Orchestrator, RunRequest};
pub use report::RunReport;
pub use vmci_shared::{VmciError, VmciResult};
