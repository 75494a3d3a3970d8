//! End-to-end walkthrough: declare a suite whose tests need tables, run it
//! against the in-memory table manager and print the suite report as JSON.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example suite_demo
//! ```

use std::sync::Arc;

use config::Configuration;
use fulfillment::table::{
    ImmutableTableRequirement, InlineDataSource, MemoryTableManager, RelationalTableDefinition,
    TableDefinition, TableFulfiller, TableManagerRegistry, TablesState,
};
use fulfillment::{FulfillerScope, RequirementSet, RequirementsProvider};
use lifecycle::{Engine, FulfillerRegistry, SuiteDescriptor, TestDescriptor, TestVerdict};

fn region_definition() -> Arc<dyn TableDefinition> {
    Arc::new(RelationalTableDefinition::new(
        "region",
        vec!["r_regionkey".to_string(), "r_name".to_string()],
        Arc::new(InlineDataSource::new(vec![
            vec!["0".to_string(), "AFRICA".to_string()],
            vec!["1".to_string(), "AMERICA".to_string()],
            vec!["2".to_string(), "ASIA".to_string()],
        ])),
    ))
}

struct NeedsRegionTable;

impl RequirementsProvider for NeedsRegionTable {
    fn requirements(&self, _configuration: &Configuration) -> RequirementSet {
        RequirementSet::of(ImmutableTableRequirement::new(region_definition()))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let manager = Arc::new(MemoryTableManager::new("presto"));
    let mut managers = TableManagerRegistry::new();
    managers.register(manager.clone());
    let managers = Arc::new(managers);

    let mut registry = FulfillerRegistry::new();
    registry.register("tables", FulfillerScope::TestLevel, move |_context| {
        TableFulfiller::new(managers.clone())
    });

    let suite = SuiteDescriptor::new("demo")
        .with_provider(Arc::new(NeedsRegionTable))
        .with_test(TestDescriptor::new("region_is_loaded"))
        .with_test(TestDescriptor::new("row_count_matches"));

    let run = Engine::new(registry, Configuration::empty()).start_suite(suite)?;

    run.run_test("region_is_loaded", |context| match context.resolve::<TablesState>() {
        Ok(tables) if tables.table("region").is_some() => TestVerdict::Passed,
        Ok(_) => TestVerdict::Failed("region missing from state".to_string()),
        Err(err) => TestVerdict::Failed(err.to_string()),
    });

    let probe = manager.clone();
    run.run_test("row_count_matches", move |_context| {
        match probe.row_count("region") {
            Some(3) => TestVerdict::Passed,
            other => TestVerdict::Failed(format!("expected 3 rows, found {other:?}")),
        }
    });

    let report = run.finish();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
