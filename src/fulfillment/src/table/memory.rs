//! In-memory table manager.
//!
//! Serves as the reference [`TableManager`] implementation and as the backend
//! for engine tests that need table provisioning without external systems.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use super::{
    MutableTableState, ProvisioningError, RelationalTableDefinition, TableDefinition, TableHandle,
    TableInstance, TableManager, TableName,
};

#[derive(Debug, Clone)]
struct StoredTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    mutable: bool,
}

/// Tables held in process memory, keyed by their name in the database.
#[derive(Debug)]
pub struct MemoryTableManager {
    database: String,
    tables: Mutex<HashMap<String, StoredTable>>,
}

impl MemoryTableManager {
    pub fn new(database: impl Into<String>) -> Self {
        Self { database: database.into(), tables: Mutex::new(HashMap::new()) }
    }

    fn relational<'a>(
        &self,
        definition: &'a dyn TableDefinition,
    ) -> Result<&'a RelationalTableDefinition, ProvisioningError> {
        definition
            .as_any()
            .downcast_ref::<RelationalTableDefinition>()
            .ok_or_else(|| {
                ProvisioningError::Backend(format!(
                    "memory table manager cannot create {definition:?}"
                ))
            })
    }

    fn table_name(&self, handle: &TableHandle, name_in_database: String) -> TableName {
        TableName::new(
            handle.database().unwrap_or(&self.database),
            handle.schema().map(str::to_owned),
            handle.name(),
            name_in_database,
        )
    }

    /// Number of rows currently loaded, if the table exists.
    pub fn row_count(&self, name_in_database: &str) -> Option<usize> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name_in_database)
            .map(|table| table.rows.len())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl TableManager for MemoryTableManager {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn create_immutable(
        &self,
        definition: &dyn TableDefinition,
        handle: &TableHandle,
    ) -> Result<TableInstance, ProvisioningError> {
        let relational = self.relational(definition)?;
        let name_in_database = handle.name().to_string();

        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        // Recreate from scratch so reruns observe exactly the definition's data.
        if tables.remove(&name_in_database).is_some() {
            log::debug!("dropped stale table {name_in_database} before recreating it");
        }
        tables.insert(
            name_in_database.clone(),
            StoredTable {
                columns: relational.columns().to_vec(),
                rows: relational.data().rows().collect(),
                mutable: false,
            },
        );
        log::info!("created immutable table {name_in_database} in {}", self.database);

        Ok(TableInstance::new(self.table_name(handle, name_in_database)))
    }

    fn create_mutable(
        &self,
        definition: &dyn TableDefinition,
        state: MutableTableState,
        handle: &TableHandle,
    ) -> Result<TableInstance, ProvisioningError> {
        let relational = self.relational(definition)?;
        let name_in_database = format!("{}_{}", handle.name(), Uuid::new_v4().simple());

        if state != MutableTableState::Prepared {
            let rows = match state {
                MutableTableState::Loaded => relational.data().rows().collect(),
                _ => Vec::new(),
            };
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            if tables.contains_key(&name_in_database) {
                return Err(ProvisioningError::AlreadyExists(name_in_database));
            }
            tables.insert(
                name_in_database.clone(),
                StoredTable { columns: relational.columns().to_vec(), rows, mutable: true },
            );
        }
        log::info!(
            "prepared mutable table {name_in_database} in {} ({state:?})",
            self.database
        );

        Ok(TableInstance::new(self.table_name(handle, name_in_database)))
    }

    fn drop_table(&self, name: &TableName) -> Result<(), ProvisioningError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        match tables.remove(name.name_in_database()) {
            Some(_) => {
                log::info!("dropped table {} from {}", name.name_in_database(), self.database);
                Ok(())
            }
            None => Err(ProvisioningError::NotFound(name.name_in_database().to_string())),
        }
    }

    fn drop_stale_mutable_tables(&self) -> Result<(), ProvisioningError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.retain(|name, table| {
            if table.mutable {
                log::info!("dropped stale mutable table {name} from {}", self.database);
            }
            !table.mutable
        });
        Ok(())
    }
}
