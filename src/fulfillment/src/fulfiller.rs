//! The fulfiller contract.

use thiserror::Error;

use context::StateHandle;

use crate::requirement::RequirementSet;
use crate::table::ProvisioningError;

/// Scope at which a fulfiller participates in the lifecycle, declared when it
/// is registered with the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FulfillerScope {
    /// Fulfilled once before any test in the suite runs, cleaned up once
    /// after all tests completed.
    SuiteLevel,
    /// Fulfilled before each test, cleaned up after it.
    TestLevel,
}

/// How the scope a fulfiller provisioned for ended. Fulfillers may use this
/// to decide whether to discard or keep artifacts, for example preserving
/// diagnostic data when the test failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Context(#[from] context::ContextError),

    #[error("fulfillment failed: {0}")]
    Failed(String),

    #[error("fulfiller panicked: {0}")]
    Panicked(String),
}

impl FulfillmentError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A fulfiller failed while tearing provisioned state down. Cleanup errors
/// never abort remaining teardown work; the engine collects them and surfaces
/// them once in the scope's report.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CleanupError {
    message: String,
}

impl CleanupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<anyhow::Error> for CleanupError {
    fn from(err: anyhow::Error) -> Self {
        Self { message: format!("{err:#}") }
    }
}

impl From<ProvisioningError> for CleanupError {
    fn from(err: ProvisioningError) -> Self {
        Self { message: err.to_string() }
    }
}

/// Turns a set of requirements into provisioned state, and tears that state
/// down when the scope ends.
///
/// Fulfiller instances are constructed per scope activation by the factory
/// they were registered with, which receives the scope's context. The engine
/// calls `fulfill` at most once per activation, and `cleanup` exactly once
/// for every activation whose `fulfill` returned, whatever the test outcome.
/// `cleanup` is never called when `fulfill` was not attempted.
pub trait Fulfiller: Send {
    /// Provision state for the requirements this fulfiller recognizes.
    ///
    /// Must be a function of the requirement set plus dependencies captured
    /// at construction. Requirements of unrecognized types are ignored; a set
    /// containing none of interest yields `Ok` with no states.
    fn fulfill(&mut self, requirements: &RequirementSet)
    -> Result<Vec<StateHandle>, FulfillmentError>;

    /// Tear down whatever `fulfill` provisioned. Must be safe to call when
    /// `fulfill` returned no states, in which case it is a no-op.
    fn cleanup(&mut self, status: TestStatus) -> Result<(), CleanupError>;
}
