//! The lifecycle engine state machine.
//!
//! Phases run in a fixed order: suite fulfillment, then the tests (each with
//! its own fulfillment, body and cleanup phases), then suite cleanup.
//! [`Engine::start_suite`] consumes the engine and yields a [`SuiteRun`] only
//! once every suite-level fulfiller finished, so no test can observe a
//! partially fulfilled suite scope. [`SuiteRun::finish`] consumes the run and
//! performs suite teardown exactly once.
//!
//! Fulfillment order is registration order; cleanup order is the exact
//! reverse, restricted to the fulfillers whose `fulfill` actually returned.
//! Cleanup and close-callback failures never abort remaining teardown; they
//! are collected into the scope's report.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use config::Configuration;
use context::{ContextError, StateHandle, TestContext};
use fulfillment::{Fulfiller, FulfillerScope, FulfillmentError, TestStatus};

use crate::registry::FulfillerRegistry;
use crate::report::{SuiteReport, TeardownFailure, TestOutcome, TestReport, TestVerdict};
use crate::resolution::{ResolutionError, resolve_suite, resolve_test};
use crate::suite::SuiteDescriptor;

/// The suite could not be brought up or a test's required state could not be
/// provisioned. Distinct from a test failure: the affected tests never ran.
#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("suite fulfillment failed in {fulfiller}: {source}")]
    SuiteFulfillment {
        fulfiller: String,
        #[source]
        source: FulfillmentError,
        /// Failures hit while unwinding the already fulfilled part of the
        /// suite scope.
        teardown_failures: Vec<TeardownFailure>,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// A fulfiller that completed its `fulfill`, retained for cleanup.
struct Fulfilled {
    name: String,
    fulfiller: Box<dyn Fulfiller>,
}

/// Entry point: registered fulfillers plus configuration, ready to bring a
/// suite up.
pub struct Engine {
    registry: FulfillerRegistry,
    configuration: Configuration,
}

impl Engine {
    pub fn new(registry: FulfillerRegistry, configuration: Configuration) -> Self {
        Self { registry, configuration }
    }

    /// Bring the suite scope up: resolve the union of all tests'
    /// requirements, run every suite-level fulfiller in registration order
    /// and seal the suite context.
    ///
    /// Failure here is fatal to the suite. Already fulfilled suite
    /// fulfillers are cleaned up in reverse order and the suite context is
    /// closed before the error propagates; no test runs.
    pub fn start_suite(self, suite: SuiteDescriptor) -> Result<SuiteRun, InfrastructureError> {
        log::info!("suite {}: fulfilling suite scope", suite.name());

        let context = TestContext::root("suite");
        // The configuration is itself a context dependency, so fulfillers
        // and tests resolve it instead of reaching for globals.
        context.register(self.configuration.clone())?;

        let requirements = match resolve_suite(&suite, &self.configuration) {
            Ok(requirements) => requirements,
            Err(err) => {
                close_context(&context);
                return Err(err.into());
            }
        };

        let mut fulfilled: Vec<Fulfilled> = Vec::new();
        for registration in self.registry.entries_for(FulfillerScope::SuiteLevel) {
            log::debug!("suite {}: fulfilling {}", suite.name(), registration.name());
            let mut fulfiller = registration.construct(&context);
            match run_fulfill(fulfiller.as_mut(), &requirements) {
                Ok(states) => {
                    fulfilled.push(Fulfilled {
                        name: registration.name().to_string(),
                        fulfiller,
                    });
                    if let Err(err) = merge_states(&context, states) {
                        log::error!(
                            "suite {}: merging states of {} failed: {err}",
                            suite.name(),
                            registration.name()
                        );
                        let mut teardown_failures =
                            cleanup_fulfilled(&mut fulfilled, TestStatus::Failed);
                        teardown_failures.extend(close_context(&context));
                        return Err(InfrastructureError::SuiteFulfillment {
                            fulfiller: registration.name().to_string(),
                            source: err.into(),
                            teardown_failures,
                        });
                    }
                }
                Err(source) => {
                    log::error!(
                        "suite {}: fulfiller {} failed: {source}",
                        suite.name(),
                        registration.name()
                    );
                    let mut teardown_failures =
                        cleanup_fulfilled(&mut fulfilled, TestStatus::Failed);
                    teardown_failures.extend(close_context(&context));
                    return Err(InfrastructureError::SuiteFulfillment {
                        fulfiller: registration.name().to_string(),
                        source,
                        teardown_failures,
                    });
                }
            }
        }

        context.seal();
        log::info!(
            "suite {}: ready, {} suite fulfiller(s) active",
            suite.name(),
            fulfilled.len()
        );

        Ok(SuiteRun {
            registry: self.registry,
            configuration: self.configuration,
            suite,
            context,
            fulfilled: Mutex::new(fulfilled),
            reports: Mutex::new(Vec::new()),
            any_failed: AtomicBool::new(false),
        })
    }
}

/// An active suite scope. Tests run against it, possibly concurrently from
/// several worker threads; the suite context is shared read-only below them.
pub struct SuiteRun {
    registry: FulfillerRegistry,
    configuration: Configuration,
    suite: SuiteDescriptor,
    context: Arc<TestContext>,
    fulfilled: Mutex<Vec<Fulfilled>>,
    reports: Mutex<Vec<TestReport>>,
    any_failed: AtomicBool,
}

impl SuiteRun {
    pub fn suite(&self) -> &SuiteDescriptor {
        &self.suite
    }

    pub fn context(&self) -> &Arc<TestContext> {
        &self.context
    }

    /// Run one declared test: fulfill its requirements, execute the body,
    /// tear down in reverse. The report is also retained for the suite
    /// report returned by [`SuiteRun::finish`].
    ///
    /// A panicking body counts as a failure. When fulfillment fails the body
    /// never runs and the outcome is an infrastructure failure instead of a
    /// test failure.
    pub fn run_test<F>(&self, name: &str, body: F) -> TestReport
    where
        F: FnOnce(&TestContext) -> TestVerdict,
    {
        let report = self.execute_test(name, body);
        if report.outcome.is_failed() || report.outcome.is_infrastructure_failure() {
            self.any_failed.store(true, Ordering::Release);
        }
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        report
    }

    /// Record a test the host runner decided not to run at all. No
    /// fulfillment happens, so no cleanup will either.
    pub fn skip_test(&self, name: &str, reason: impl Into<String>) -> TestReport {
        let reason = reason.into();
        log::info!("test {name}: skipped ({reason})");
        let report = TestReport {
            name: name.to_string(),
            outcome: TestOutcome::Skipped { reason },
            teardown_failures: Vec::new(),
        };
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        report
    }

    fn execute_test<F>(&self, name: &str, body: F) -> TestReport
    where
        F: FnOnce(&TestContext) -> TestVerdict,
    {
        let Some(test) = self.suite.test(name) else {
            return TestReport {
                name: name.to_string(),
                outcome: TestOutcome::InfrastructureFailure {
                    message: format!("test {name} is not declared in suite {}", self.suite.name()),
                },
                teardown_failures: Vec::new(),
            };
        };

        let context = self.context.child("test");

        log::info!("test {name}: fulfilling test scope");
        let requirements = match resolve_test(&self.suite, test, &self.configuration) {
            Ok(requirements) => requirements,
            Err(err) => {
                log::error!("test {name}: requirement resolution failed: {err}");
                return TestReport {
                    name: name.to_string(),
                    outcome: TestOutcome::InfrastructureFailure { message: err.to_string() },
                    teardown_failures: close_context(&context),
                };
            }
        };

        let mut fulfilled: Vec<Fulfilled> = Vec::new();
        for registration in self.registry.entries_for(FulfillerScope::TestLevel) {
            log::debug!("test {name}: fulfilling {}", registration.name());
            let mut fulfiller = registration.construct(&context);
            let failed = match run_fulfill(fulfiller.as_mut(), &requirements) {
                Ok(states) => {
                    fulfilled.push(Fulfilled {
                        name: registration.name().to_string(),
                        fulfiller,
                    });
                    merge_states(&context, states).err().map(FulfillmentError::from)
                }
                Err(source) => Some(source),
            };

            if let Some(source) = failed {
                log::error!("test {name}: fulfiller {} failed: {source}", registration.name());
                let mut teardown_failures = cleanup_fulfilled(&mut fulfilled, TestStatus::Failed);
                teardown_failures.extend(close_context(&context));
                return TestReport {
                    name: name.to_string(),
                    outcome: TestOutcome::InfrastructureFailure {
                        message: format!(
                            "fulfillment failed in {}: {source}",
                            registration.name()
                        ),
                    },
                    teardown_failures,
                };
            }
        }

        context.seal();

        log::info!("test {name}: running");
        let verdict = match catch_unwind(AssertUnwindSafe(|| body(&context))) {
            Ok(verdict) => verdict,
            Err(panic) => TestVerdict::Failed(format!("test body panicked: {}", panic_message(panic))),
        };

        let (status, outcome) = match verdict {
            TestVerdict::Passed => (TestStatus::Passed, TestOutcome::Passed),
            TestVerdict::Failed(message) => {
                log::warn!("test {name}: failed: {message}");
                (TestStatus::Failed, TestOutcome::Failed { message })
            }
            TestVerdict::Skipped(reason) => {
                log::info!("test {name}: skipped by its body ({reason})");
                (TestStatus::Skipped, TestOutcome::Skipped { reason })
            }
        };

        log::debug!("test {name}: cleaning up test scope");
        let mut teardown_failures = cleanup_fulfilled(&mut fulfilled, status);
        teardown_failures.extend(close_context(&context));

        TestReport { name: name.to_string(), outcome, teardown_failures }
    }

    /// Tear the suite scope down: cleanup of fulfilled suite fulfillers in
    /// reverse order, then the suite context's close callbacks, then the
    /// aggregated suite report.
    pub fn finish(self) -> SuiteReport {
        log::info!("suite {}: cleaning up suite scope", self.suite.name());

        let status = if self.any_failed.load(Ordering::Acquire) {
            TestStatus::Failed
        } else {
            TestStatus::Passed
        };

        let mut fulfilled = self.fulfilled.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut teardown_failures = cleanup_fulfilled(&mut fulfilled, status);
        teardown_failures.extend(close_context(&self.context));

        let tests = self.reports.into_inner().unwrap_or_else(PoisonError::into_inner);
        let report = SuiteReport { suite: self.suite.name().to_string(), tests, teardown_failures };
        log::info!(
            "suite {}: {} passed, {} failed, {} skipped, {} infrastructure failure(s)",
            report.suite,
            report.passed(),
            report.failed(),
            report.skipped(),
            report.infrastructure_failures()
        );
        report
    }
}

fn run_fulfill(
    fulfiller: &mut dyn Fulfiller,
    requirements: &fulfillment::RequirementSet,
) -> Result<Vec<StateHandle>, FulfillmentError> {
    match catch_unwind(AssertUnwindSafe(|| fulfiller.fulfill(requirements))) {
        Ok(result) => result,
        Err(panic) => Err(FulfillmentError::Panicked(panic_message(panic))),
    }
}

fn merge_states(context: &TestContext, states: Vec<StateHandle>) -> Result<(), ContextError> {
    for state in states {
        context.register_state(state)?;
    }
    Ok(())
}

/// Cleanup in exact reverse fulfillment order, collecting failures instead
/// of aborting on them.
fn cleanup_fulfilled(fulfilled: &mut Vec<Fulfilled>, status: TestStatus) -> Vec<TeardownFailure> {
    let mut failures = Vec::new();
    for mut entry in fulfilled.drain(..).rev() {
        log::debug!("cleaning up {}", entry.name);
        if let Err(err) = entry.fulfiller.cleanup(status) {
            log::error!("cleanup of {} failed: {err}", entry.name);
            failures.push(TeardownFailure { stage: entry.name, message: err.to_string() });
        }
    }
    failures
}

fn close_context(context: &TestContext) -> Vec<TeardownFailure> {
    match context.close() {
        Ok(()) => Vec::new(),
        Err(err) => err
            .failures()
            .iter()
            .map(|failure| TeardownFailure {
                stage: "close callback".to_string(),
                message: format!("{failure:#}"),
            })
            .collect(),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::TestDescriptor;
    use fulfillment::{CleanupError, RequirementSet};

    struct Probe {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_fulfill: bool,
    }

    impl Probe {
        fn push(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}.{event}", self.label));
        }
    }

    impl Fulfiller for Probe {
        fn fulfill(
            &mut self,
            _requirements: &RequirementSet,
        ) -> Result<Vec<StateHandle>, FulfillmentError> {
            self.push("fulfill");
            if self.fail_fulfill {
                return Err(FulfillmentError::failed("broker unreachable"));
            }
            Ok(Vec::new())
        }

        fn cleanup(&mut self, _status: TestStatus) -> Result<(), CleanupError> {
            self.push("cleanup");
            Ok(())
        }
    }

    fn probe_registry(
        log: &Arc<Mutex<Vec<String>>>,
        entries: &[(&'static str, FulfillerScope, bool)],
    ) -> FulfillerRegistry {
        let mut registry = FulfillerRegistry::new();
        for (label, scope, fail_fulfill) in entries.iter().copied() {
            let log = log.clone();
            registry.register(label, scope, move |_context| Probe {
                label,
                log: log.clone(),
                fail_fulfill,
            });
        }
        registry
    }

    fn one_test_suite() -> SuiteDescriptor {
        SuiteDescriptor::new("demo").with_test(TestDescriptor::new("works"))
    }

    #[test]
    fn test_cleanup_reverses_fulfillment_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = probe_registry(
            &log,
            &[
                ("x", FulfillerScope::TestLevel, false),
                ("y", FulfillerScope::TestLevel, false),
                ("z", FulfillerScope::TestLevel, false),
            ],
        );

        let run = Engine::new(registry, Configuration::empty())
            .start_suite(one_test_suite())
            .unwrap();
        run.run_test("works", |_context| TestVerdict::Passed);
        run.finish();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "x.fulfill", "y.fulfill", "z.fulfill",
                "z.cleanup", "y.cleanup", "x.cleanup",
            ]
        );
    }

    #[test]
    fn test_suite_fulfillment_failure_is_fatal_and_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = probe_registry(
            &log,
            &[
                ("a", FulfillerScope::SuiteLevel, false),
                ("b", FulfillerScope::SuiteLevel, true),
            ],
        );

        let err = Engine::new(registry, Configuration::empty())
            .start_suite(one_test_suite())
            .err()
            .unwrap();

        assert!(matches!(err, InfrastructureError::SuiteFulfillment { ref fulfiller, .. } if fulfiller == "b"));
        assert_eq!(*log.lock().unwrap(), vec!["a.fulfill", "b.fulfill", "a.cleanup"]);
    }

    #[test]
    fn test_undeclared_test_is_an_infrastructure_failure() {
        let run = Engine::new(FulfillerRegistry::new(), Configuration::empty())
            .start_suite(one_test_suite())
            .unwrap();

        let report = run.run_test("missing", |_context| TestVerdict::Passed);
        assert!(report.outcome.is_infrastructure_failure());
        assert!(!run.finish().all_passed());
    }

    #[test]
    fn test_panicking_body_counts_as_failure() {
        let run = Engine::new(FulfillerRegistry::new(), Configuration::empty())
            .start_suite(one_test_suite())
            .unwrap();

        let report = run.run_test("works", |_context| panic!("assertion blew up"));
        assert!(matches!(
            report.outcome,
            TestOutcome::Failed { ref message } if message.contains("assertion blew up")
        ));
        run.finish();
    }

    #[test]
    fn test_configuration_is_resolvable_from_the_context() {
        let configuration = Configuration::from_toml_str("[kafka]\nbroker = \"localhost:9092\"").unwrap();
        let run = Engine::new(FulfillerRegistry::new(), configuration)
            .start_suite(one_test_suite())
            .unwrap();

        let report = run.run_test("works", |context| {
            let configuration = match context.resolve::<Configuration>() {
                Ok(configuration) => configuration,
                Err(err) => return TestVerdict::Failed(err.to_string()),
            };
            match configuration.get_string("kafka.broker").as_deref() {
                Some("localhost:9092") => TestVerdict::Passed,
                other => TestVerdict::Failed(format!("unexpected broker {other:?}")),
            }
        });
        assert!(report.is_passed());
        run.finish();
    }

    #[test]
    fn test_skip_test_records_without_fulfilling() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = probe_registry(&log, &[("x", FulfillerScope::TestLevel, false)]);

        let run = Engine::new(registry, Configuration::empty())
            .start_suite(one_test_suite())
            .unwrap();
        run.skip_test("works", "requires a live cluster");
        let report = run.finish();

        assert_eq!(report.skipped(), 1);
        assert!(log.lock().unwrap().is_empty());
    }
}
