//! redb table definitions for the Tabula store.

use redb::TableDefinition;

/// Table rows keyed by the row's store key.
pub const ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");
