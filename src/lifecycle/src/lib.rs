//! The requirement-fulfillment lifecycle engine.
//!
//! Around a suite and each of its tests, the engine resolves declared
//! requirements, runs the registered fulfillers of the matching scope in
//! registration order, exposes the provisioned state through a scoped
//! [`context::TestContext`], and tears everything down in exact reverse
//! order once the scope ends, whatever its outcome.

pub mod engine;
pub mod registry;
pub mod report;
pub mod resolution;
pub mod suite;

pub use engine::{Engine, InfrastructureError, SuiteRun};
pub use registry::{FulfillerRegistration, FulfillerRegistry};
pub use report::{SuiteReport, TeardownFailure, TestOutcome, TestReport, TestVerdict};
pub use resolution::{ResolutionError, resolve_suite, resolve_test};
pub use suite::{SuiteDescriptor, TestDescriptor};
