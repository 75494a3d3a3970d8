//! Declarative suite and test descriptors.
//!
//! Tests are enumerated as plain data resolved once at startup, typically
//! from a table mapping test names to their requirement providers. There is
//! no runtime discovery: what is declared here is exactly what runs.

use std::fmt;
use std::sync::Arc;

use fulfillment::RequirementsProvider;

/// One test method: a name plus its method-level requirement declarations.
pub struct TestDescriptor {
    name: String,
    providers: Vec<Arc<dyn RequirementsProvider>>,
}

impl TestDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), providers: Vec::new() }
    }

    pub fn with_provider(mut self, provider: Arc<dyn RequirementsProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn providers(&self) -> &[Arc<dyn RequirementsProvider>] {
        &self.providers
    }
}

impl fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("name", &self.name)
            .field("providers", &self.providers.len())
            .finish()
    }
}

/// A suite: class-level requirement declarations shared by every test, plus
/// the tests themselves in declaration order.
pub struct SuiteDescriptor {
    name: String,
    providers: Vec<Arc<dyn RequirementsProvider>>,
    tests: Vec<TestDescriptor>,
}

impl SuiteDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), providers: Vec::new(), tests: Vec::new() }
    }

    /// Add a class-level provider applying to every test in the suite.
    pub fn with_provider(mut self, provider: Arc<dyn RequirementsProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_test(mut self, test: TestDescriptor) -> Self {
        self.tests.push(test);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn providers(&self) -> &[Arc<dyn RequirementsProvider>] {
        &self.providers
    }

    pub fn tests(&self) -> &[TestDescriptor] {
        &self.tests
    }

    pub fn test(&self, name: &str) -> Option<&TestDescriptor> {
        self.tests.iter().find(|test| test.name() == name)
    }
}

impl fmt::Debug for SuiteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteDescriptor")
            .field("name", &self.name)
            .field("providers", &self.providers.len())
            .field("tests", &self.tests)
            .finish()
    }
}
