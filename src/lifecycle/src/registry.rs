//! Explicit fulfiller registration.
//!
//! Fulfillers are registered up front as (scope, factory) pairs. The
//! registration order is the fulfillment order; cleanup runs in exact
//! reverse. Factories construct a fresh fulfiller per scope activation and
//! receive the activation's context to capture dependencies from.

use std::sync::Arc;

use context::TestContext;
use fulfillment::{Fulfiller, FulfillerScope};

type FulfillerFactory = Box<dyn Fn(&Arc<TestContext>) -> Box<dyn Fulfiller> + Send + Sync>;

pub struct FulfillerRegistration {
    name: String,
    scope: FulfillerScope,
    factory: FulfillerFactory,
}

impl FulfillerRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> FulfillerScope {
        self.scope
    }

    pub(crate) fn construct(&self, context: &Arc<TestContext>) -> Box<dyn Fulfiller> {
        (self.factory)(context)
    }
}

#[derive(Default)]
pub struct FulfillerRegistry {
    entries: Vec<FulfillerRegistration>,
}

impl FulfillerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fulfiller under an explicit scope. `name` identifies it in
    /// logs and teardown failure reports.
    pub fn register<F, T>(&mut self, name: impl Into<String>, scope: FulfillerScope, factory: F)
    where
        F: Fn(&Arc<TestContext>) -> T + Send + Sync + 'static,
        T: Fulfiller + 'static,
    {
        self.entries.push(FulfillerRegistration {
            name: name.into(),
            scope,
            factory: Box::new(move |context| Box::new(factory(context))),
        });
    }

    pub(crate) fn entries_for(
        &self,
        scope: FulfillerScope,
    ) -> impl Iterator<Item = &FulfillerRegistration> {
        self.entries.iter().filter(move |entry| entry.scope == scope)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context::StateHandle;
    use fulfillment::{CleanupError, FulfillmentError, RequirementSet, TestStatus};

    struct Noop;

    impl Fulfiller for Noop {
        fn fulfill(
            &mut self,
            _requirements: &RequirementSet,
        ) -> Result<Vec<StateHandle>, FulfillmentError> {
            Ok(Vec::new())
        }

        fn cleanup(&mut self, _status: TestStatus) -> Result<(), CleanupError> {
            Ok(())
        }
    }

    #[test]
    fn test_entries_keep_registration_order_per_scope() {
        let mut registry = FulfillerRegistry::new();
        registry.register("suite-a", FulfillerScope::SuiteLevel, |_| Noop);
        registry.register("test-b", FulfillerScope::TestLevel, |_| Noop);
        registry.register("suite-c", FulfillerScope::SuiteLevel, |_| Noop);

        let suite: Vec<&str> = registry
            .entries_for(FulfillerScope::SuiteLevel)
            .map(FulfillerRegistration::name)
            .collect();
        assert_eq!(suite, vec!["suite-a", "suite-c"]);

        let test: Vec<&str> = registry
            .entries_for(FulfillerScope::TestLevel)
            .map(FulfillerRegistration::name)
            .collect();
        assert_eq!(test, vec!["test-b"]);
    }
}
