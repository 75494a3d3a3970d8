//! Results reported back to the host test runner.

use serde::Serialize;

/// What a test body reports back to the engine.
#[derive(Debug)]
pub enum TestVerdict {
    Passed,
    Failed(String),
    /// The body declined to run, for example because an assumption about the
    /// environment did not hold. Fulfilled state is still torn down, with
    /// `TestStatus::Skipped`.
    Skipped(String),
}

impl TestVerdict {
    pub fn from_result(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::Passed,
            Err(err) => Self::Failed(format!("{err:#}")),
        }
    }
}

/// Outcome of one test as seen by the host runner. `InfrastructureFailure`
/// means required state could not be provisioned and the body never ran; it
/// is deliberately distinct from `Failed`, which is a real test failure.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed { message: String },
    Skipped { reason: String },
    InfrastructureFailure { message: String },
}

impl TestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(self, Self::InfrastructureFailure { .. })
    }
}

/// A failure that happened while tearing a scope down: a fulfiller cleanup
/// or a close callback. Teardown failures never fail the test; they are
/// collected and reported alongside its outcome.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TeardownFailure {
    /// The fulfiller that failed, or `"close callback"`.
    pub stage: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TestReport {
    pub name: String,
    pub outcome: TestOutcome,
    pub teardown_failures: Vec<TeardownFailure>,
}

impl TestReport {
    pub fn is_passed(&self) -> bool {
        self.outcome.is_passed()
    }
}

/// Aggregated result of a whole suite run, including suite-scope teardown
/// failures. Serializable so host runners can emit it as JSON.
#[derive(Clone, Debug, Serialize)]
pub struct SuiteReport {
    pub suite: String,
    pub tests: Vec<TestReport>,
    pub teardown_failures: Vec<TeardownFailure>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.count(TestOutcome::is_passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TestOutcome::is_failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Skipped { .. }))
    }

    pub fn infrastructure_failures(&self) -> usize {
        self.count(TestOutcome::is_infrastructure_failure)
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0 && self.infrastructure_failures() == 0
    }

    fn count(&self, predicate: impl Fn(&TestOutcome) -> bool) -> usize {
        self.tests.iter().filter(|test| predicate(&test.outcome)).count()
    }
}
