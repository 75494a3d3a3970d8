//! Table provisioning contracts.
//!
//! External data systems (SQL engines, Kafka topics exposed as tables, HDFS
//! backed warehouses) are reached exclusively through the [`TableManager`]
//! trait. The engine itself never touches these systems: the
//! [`TableFulfiller`](fulfiller::TableFulfiller) dispatches table
//! requirements to the manager registered for the target database and treats
//! any manager error as a fulfillment failure.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;

use crate::requirement::Requirement;

pub mod fulfiller;
pub mod memory;

pub use fulfiller::{TableFulfiller, TablesState};
pub use memory::MemoryTableManager;

/// Where a requirement wants a table, as declared by the test. Unset parts
/// fall back to the manager's defaults.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableHandle {
    database: Option<String>,
    schema: Option<String>,
    name: String,
}

impl TableHandle {
    pub fn named(name: impl Into<String>) -> Self {
        Self { database: None, schema: None, name: name.into() }
    }

    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Dotted database.schema.name form, omitting unset parts.
    pub fn qualified_name(&self) -> String {
        let mut parts = Vec::new();
        if let Some(database) = &self.database {
            parts.push(database.as_str());
        }
        if let Some(schema) = &self.schema {
            parts.push(schema.as_str());
        }
        parts.push(&self.name);
        parts.join(".")
    }
}

impl fmt::Display for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// The resolved identity of a created table. `name` is what the test asked
/// for; `name_in_database` is what the manager actually created, which for
/// mutable tables carries a uniquifying suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableName {
    database: String,
    schema: Option<String>,
    name: String,
    name_in_database: String,
}

impl TableName {
    pub fn new(
        database: impl Into<String>,
        schema: Option<String>,
        name: impl Into<String>,
        name_in_database: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema,
            name: name.into(),
            name_in_database: name_in_database.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_in_database(&self) -> &str {
        &self.name_in_database
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name_in_database)
    }
}

/// A provisioned table, handed back to tests through [`TablesState`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableInstance {
    name: TableName,
}

impl TableInstance {
    pub fn new(name: TableName) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }
}

/// Description of a table's shape and contents. Managers downcast to the
/// definition types they support.
pub trait TableDefinition: fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Supplies table rows as textual column values; managers convert them to
/// their native representation on load.
pub trait RelationalDataSource: fmt::Debug + Send + Sync {
    fn rows(&self) -> Box<dyn Iterator<Item = Vec<String>> + '_>;
}

/// A fixed, in-code data source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InlineDataSource {
    rows: Vec<Vec<String>>,
}

impl InlineDataSource {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }
}

impl RelationalDataSource for InlineDataSource {
    fn rows(&self) -> Box<dyn Iterator<Item = Vec<String>> + '_> {
        Box::new(self.rows.iter().cloned())
    }
}

/// A column-and-rows table definition backed by a [`RelationalDataSource`].
#[derive(Clone, Debug)]
pub struct RelationalTableDefinition {
    name: String,
    columns: Vec<String>,
    data: Arc<dyn RelationalDataSource>,
}

impl RelationalTableDefinition {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<String>,
        data: Arc<dyn RelationalDataSource>,
    ) -> Self {
        Self { name: name.into(), columns, data }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn data(&self) -> &Arc<dyn RelationalDataSource> {
        &self.data
    }
}

impl TableDefinition for RelationalTableDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Progression of a mutable table at fulfillment time. `Prepared` reserves a
/// unique name without creating anything, `Created` creates the table empty,
/// `Loaded` creates it and loads the definition's data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutableTableState {
    Prepared,
    Created,
    Loaded,
}

/// Requires a shared, read-only table to exist with the definition's
/// contents. Immutable tables are created once and left in place on cleanup
/// so later scopes can reuse them.
#[derive(Clone, Debug)]
pub struct ImmutableTableRequirement {
    definition: Arc<dyn TableDefinition>,
    handle: TableHandle,
}

impl ImmutableTableRequirement {
    pub fn new(definition: Arc<dyn TableDefinition>) -> Self {
        let handle = TableHandle::named(definition.name());
        Self { definition, handle }
    }

    pub fn with_handle(definition: Arc<dyn TableDefinition>, handle: TableHandle) -> Self {
        Self { definition, handle }
    }

    pub fn definition(&self) -> &dyn TableDefinition {
        self.definition.as_ref()
    }

    pub fn handle(&self) -> &TableHandle {
        &self.handle
    }
}

// Definitions are identified by the table name they describe.
impl PartialEq for ImmutableTableRequirement {
    fn eq(&self, other: &Self) -> bool {
        self.definition.name() == other.definition.name() && self.handle == other.handle
    }
}

impl Hash for ImmutableTableRequirement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.definition.name().hash(state);
        self.handle.hash(state);
    }
}

impl Requirement for ImmutableTableRequirement {
    crate::impl_requirement_eq!(ImmutableTableRequirement);

    fn conflict_key(&self) -> Option<String> {
        Some(format!("table:{}", self.handle.qualified_name()))
    }
}

/// Requires a private, writable table. Mutable tables get a uniquified name
/// per activation and are dropped on cleanup.
#[derive(Clone, Debug)]
pub struct MutableTableRequirement {
    definition: Arc<dyn TableDefinition>,
    handle: TableHandle,
    state: MutableTableState,
}

impl MutableTableRequirement {
    pub fn new(definition: Arc<dyn TableDefinition>, state: MutableTableState) -> Self {
        let handle = TableHandle::named(definition.name());
        Self { definition, handle, state }
    }

    pub fn with_handle(
        definition: Arc<dyn TableDefinition>,
        state: MutableTableState,
        handle: TableHandle,
    ) -> Self {
        Self { definition, handle, state }
    }

    pub fn definition(&self) -> &dyn TableDefinition {
        self.definition.as_ref()
    }

    pub fn handle(&self) -> &TableHandle {
        &self.handle
    }

    pub fn state(&self) -> MutableTableState {
        self.state
    }
}

impl PartialEq for MutableTableRequirement {
    fn eq(&self, other: &Self) -> bool {
        self.definition.name() == other.definition.name()
            && self.handle == other.handle
            && self.state == other.state
    }
}

impl Hash for MutableTableRequirement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.definition.name().hash(state);
        self.handle.hash(state);
        self.state.hash(state);
    }
}

impl Requirement for MutableTableRequirement {
    crate::impl_requirement_eq!(MutableTableRequirement);

    fn conflict_key(&self) -> Option<String> {
        Some(format!("table:{}", self.handle.qualified_name()))
    }
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("table {0} already exists")]
    AlreadyExists(String),

    #[error("table {0} does not exist")]
    NotFound(String),

    #[error("no table manager registered for database {0}")]
    NoManager(String),

    #[error("{operation} is not supported by the {manager} table manager")]
    Unsupported { manager: String, operation: &'static str },

    #[error("table provisioning failed: {0}")]
    Backend(String),
}

/// Provisions tables in one external database. Implementations wrap the
/// system's native client; errors surface as fulfillment failures.
pub trait TableManager: Send + Sync {
    /// The database this manager serves, matched against
    /// [`TableHandle::database`].
    fn database_name(&self) -> &str;

    fn create_immutable(
        &self,
        definition: &dyn TableDefinition,
        handle: &TableHandle,
    ) -> Result<TableInstance, ProvisioningError>;

    fn create_mutable(
        &self,
        definition: &dyn TableDefinition,
        state: MutableTableState,
        handle: &TableHandle,
    ) -> Result<TableInstance, ProvisioningError>;

    fn drop_table(&self, name: &TableName) -> Result<(), ProvisioningError>;

    /// Drop mutable tables left behind by earlier, aborted runs.
    fn drop_stale_mutable_tables(&self) -> Result<(), ProvisioningError> {
        Ok(())
    }
}

/// Table managers in registration order, keyed by database name. The first
/// registered manager serves requirements whose handle names no database.
#[derive(Default)]
pub struct TableManagerRegistry {
    managers: Vec<Arc<dyn TableManager>>,
}

impl TableManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manager: Arc<dyn TableManager>) {
        self.managers.push(manager);
    }

    pub fn manager_for(&self, database: &str) -> Result<Arc<dyn TableManager>, ProvisioningError> {
        self.managers
            .iter()
            .find(|manager| manager.database_name() == database)
            .cloned()
            .ok_or_else(|| ProvisioningError::NoManager(database.to_string()))
    }

    pub fn default_manager(&self) -> Result<Arc<dyn TableManager>, ProvisioningError> {
        self.managers
            .first()
            .cloned()
            .ok_or_else(|| ProvisioningError::NoManager("<default>".to_string()))
    }

    pub fn managers(&self) -> impl Iterator<Item = &Arc<dyn TableManager>> {
        self.managers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirement::RequirementSet;

    fn nation() -> Arc<dyn TableDefinition> {
        Arc::new(RelationalTableDefinition::new(
            "nation",
            vec!["n_nationkey".to_string(), "n_name".to_string()],
            Arc::new(InlineDataSource::new(vec![vec!["0".to_string(), "ALGERIA".to_string()]])),
        ))
    }

    #[test]
    fn test_handle_qualified_name() {
        let handle = TableHandle::named("nation").in_database("presto").in_schema("tpch");
        assert_eq!(handle.qualified_name(), "presto.tpch.nation");
        assert_eq!(TableHandle::named("nation").qualified_name(), "nation");
    }

    #[test]
    fn test_table_requirements_compare_by_content() {
        let a = ImmutableTableRequirement::new(nation());
        let b = ImmutableTableRequirement::new(nation());
        assert_eq!(a, b);

        let mut set = RequirementSet::new();
        assert!(set.insert_value(a));
        assert!(!set.insert_value(b));
    }

    #[test]
    fn test_conflict_key_names_the_target_table() {
        let requirement = ImmutableTableRequirement::with_handle(
            nation(),
            TableHandle::named("nation").in_database("presto"),
        );
        assert_eq!(requirement.conflict_key(), Some("table:presto.nation".to_string()));

        let mutable = MutableTableRequirement::new(nation(), MutableTableState::Loaded);
        assert_eq!(mutable.conflict_key(), Some("table:nation".to_string()));
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = TableManagerRegistry::new();
        registry.register(Arc::new(MemoryTableManager::new("presto")));
        registry.register(Arc::new(MemoryTableManager::new("hive")));

        assert_eq!(registry.manager_for("hive").unwrap().database_name(), "hive");
        assert_eq!(registry.default_manager().unwrap().database_name(), "presto");
        assert!(matches!(
            registry.manager_for("cassandra"),
            Err(ProvisioningError::NoManager(_))
        ));
    }
}
