//! redb table definitions for the Flotilla state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types).

use redb::TableDefinition;

/// In-flight deployment plans keyed by plan id.
pub const PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");

/// The declarative group tree; a single row under [`GROUP_ROOT_KEY`].
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Key of the root group row in [`GROUPS`].
pub const GROUP_ROOT_KEY: &str = "root";
