//! Requirement resolution.
//!
//! Computes the effective requirement set for a test from its class-level
//! (suite) and method-level (test) declarations. Method-level declarations
//! win when both levels bind the same resource; two distinct requirements
//! binding one resource at the same level are a conflict and fail fast,
//! before any fulfiller runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use config::Configuration;
use fulfillment::{Requirement, RequirementSet, RequirementsProvider};

use crate::suite::{SuiteDescriptor, TestDescriptor};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("conflicting {level} level requirements for {key} declared for {test}")]
    Conflict {
        level: &'static str,
        test: String,
        key: String,
    },
}

/// The effective requirement set for one test: class-level declarations,
/// overridden per conflict key by method-level ones, then both unioned.
pub fn resolve_test(
    suite: &SuiteDescriptor,
    test: &TestDescriptor,
    configuration: &Configuration,
) -> Result<RequirementSet, ResolutionError> {
    let class_level = merge_level(suite.providers(), configuration, "class", test.name())?;
    let method_level = merge_level(test.providers(), configuration, "method", test.name())?;

    let method_keys: HashSet<String> = method_level
        .iter()
        .filter_map(|requirement| requirement.conflict_key())
        .collect();

    let mut effective = RequirementSet::new();
    for requirement in class_level.iter() {
        if let Some(key) = requirement.conflict_key() {
            if method_keys.contains(&key) {
                log::debug!("{}: method level declaration overrides {key}", test.name());
                continue;
            }
        }
        effective.insert(requirement.clone());
    }
    effective.extend(&method_level);

    log::debug!("{}: resolved {} requirement(s)", test.name(), effective.len());
    Ok(effective)
}

/// The union of every test's effective set. Suite-level fulfillers receive
/// this full union and select the requirements they recognize; equal
/// requirements from different tests deduplicate, distinct ones binding the
/// same resource from different tests co-exist.
pub fn resolve_suite(
    suite: &SuiteDescriptor,
    configuration: &Configuration,
) -> Result<RequirementSet, ResolutionError> {
    let mut union = merge_level(suite.providers(), configuration, "class", suite.name())?;
    for test in suite.tests() {
        union.extend(&resolve_test(suite, test, configuration)?);
    }
    Ok(union)
}

fn merge_level(
    providers: &[Arc<dyn RequirementsProvider>],
    configuration: &Configuration,
    level: &'static str,
    owner: &str,
) -> Result<RequirementSet, ResolutionError> {
    let mut merged = RequirementSet::new();
    let mut claimed: HashMap<String, Arc<dyn Requirement>> = HashMap::new();

    for provider in providers {
        for requirement in provider.requirements(configuration).iter() {
            if let Some(key) = requirement.conflict_key() {
                if let Some(existing) = claimed.get(&key) {
                    if !existing.eq_requirement(requirement.as_ref()) {
                        return Err(ResolutionError::Conflict {
                            level,
                            test: owner.to_string(),
                            key,
                        });
                    }
                }
                claimed.insert(key, requirement.clone());
            }
            merged.insert(requirement.clone());
        }
    }
    Ok(merged)
}
