//! Shared types for the vmci pipeline and the guest-side validation harness.
//!
//! Everything needed to evaluate one operation lives here so that the host
//! orchestrator and `vmci-harness` inside the guest reach identical verdicts:
//!
//! - [`operation`]: operation kinds, identities, command templates
//! - [`record`]: execution records, assertion outcomes, the harness result record
//! - [`expected`]: expected results and normalization rules
//! - [`normalize`] / [`compare`]: pure normalization and comparison

pub mod compare;
pub mod errors;
pub mod expected;
pub mod normalize;
pub mod operation;
pub mod record;

pub use compare::{Comparator, evaluate};
pub use errors::{VmciError, VmciResult};
pub use expected::{ExpectedBody, ExpectedResult, ExpectedSet, NormalizationRule, RuleKind};
pub use operation::{Identity, OperationKind, render_template, shell_quote};
pub use record::{AssertionOutcome, ExecutionRecord, FieldDiff, HarnessVerdict, ResultRecord};
