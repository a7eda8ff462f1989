//! redb table definitions for the embedded backend.
//!
//! Keys are normalized registry paths. A path may appear in `VALUES` or in
//! `DIRECTORIES`, never in both.

use redb::TableDefinition;

/// Value keys and their raw bytes.
pub const VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("values");

/// Explicit directory markers.
pub const DIRECTORIES: TableDefinition<&str, ()> = TableDefinition::new("directories");

/// Expiry deadline (unix millis) of TTL-bearing value keys.
pub const EXPIRES: TableDefinition<&str, u64> = TableDefinition::new("expires");
