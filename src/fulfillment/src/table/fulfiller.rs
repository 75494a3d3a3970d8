//! Fulfiller dispatching table requirements to registered managers.

use std::sync::Arc;

use context::{State, StateHandle};

use crate::fulfiller::{CleanupError, Fulfiller, FulfillmentError, TestStatus};
use crate::requirement::RequirementSet;
use crate::table::{
    ImmutableTableRequirement, MutableTableRequirement, ProvisioningError, TableHandle,
    TableInstance, TableManager, TableManagerRegistry, TableName,
};

/// Tables provisioned for the current scope, resolvable from the context by
/// the requested table name.
#[derive(Debug)]
pub struct TablesState {
    tables: Vec<TableInstance>,
}

impl TablesState {
    pub fn new(tables: Vec<TableInstance>) -> Self {
        Self { tables }
    }

    /// Look up a provisioned table by the name the test requested.
    pub fn table(&self, name: &str) -> Option<&TableInstance> {
        self.tables.iter().find(|instance| instance.name().name() == name)
    }

    /// The name a requested table actually got in its database.
    pub fn name_in_database(&self, name: &str) -> Option<&str> {
        self.table(name).map(|instance| instance.name().name_in_database())
    }

    pub fn tables(&self) -> &[TableInstance] {
        &self.tables
    }
}

impl State for TablesState {}

/// Provisions immutable and mutable tables for the requirements it
/// recognizes, dispatching each to the manager registered for its target
/// database. Mutable tables are dropped on cleanup; immutable tables are
/// left in place for reuse.
pub struct TableFulfiller {
    registry: Arc<TableManagerRegistry>,
    mutable_tables: Vec<TableName>,
}

impl TableFulfiller {
    pub fn new(registry: Arc<TableManagerRegistry>) -> Self {
        Self { registry, mutable_tables: Vec::new() }
    }

    fn manager_for(&self, handle: &TableHandle) -> Result<Arc<dyn TableManager>, ProvisioningError> {
        match handle.database() {
            Some(database) => self.registry.manager_for(database),
            None => self.registry.default_manager(),
        }
    }
}

impl Fulfiller for TableFulfiller {
    fn fulfill(
        &mut self,
        requirements: &RequirementSet,
    ) -> Result<Vec<StateHandle>, FulfillmentError> {
        let mut instances = Vec::new();

        for requirement in requirements.filter_type::<ImmutableTableRequirement>() {
            let manager = self.manager_for(requirement.handle())?;
            let instance = manager.create_immutable(requirement.definition(), requirement.handle())?;
            log::debug!("fulfilled immutable table {}", instance.name());
            instances.push(instance);
        }

        for requirement in requirements.filter_type::<MutableTableRequirement>() {
            let manager = self.manager_for(requirement.handle())?;
            let instance = manager.create_mutable(
                requirement.definition(),
                requirement.state(),
                requirement.handle(),
            )?;
            log::debug!("fulfilled mutable table {}", instance.name());
            self.mutable_tables.push(instance.name().clone());
            instances.push(instance);
        }

        if instances.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![StateHandle::new(TablesState::new(instances))])
    }

    fn cleanup(&mut self, _status: TestStatus) -> Result<(), CleanupError> {
        let mut failures = Vec::new();

        let names: Vec<_> = self.mutable_tables.drain(..).collect();
        for name in names.into_iter().rev() {
            let dropped = self
                .manager_for(&TableHandle::named(name.name()).in_database(name.database()))
                .and_then(|manager| manager.drop_table(&name));
            if let Err(err) = dropped {
                log::error!("failed to drop mutable table {name}: {err}");
                failures.push(format!("{name}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError::new(format!(
                "failed to drop mutable table(s): {}",
                failures.join("; ")
            )))
        }
    }
}
