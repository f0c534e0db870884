//! Schema definitions and migration runner for SurrealDB.
//!
//! Documents live in a single SCHEMAFULL `document` table keyed by the
//! locator text. The document body is stored as a flexible object next
//! to the index columns that list queries filter and order on.

use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use tracing::info;

use crate::error::DbError;

// -----------------------------------------------------------------------
// Migration tracking
// -----------------------------------------------------------------------

const MIGRATION_TABLE_DDL: &str = "\
DEFINE TABLE IF NOT EXISTS _migration SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS version ON TABLE _migration TYPE int;
DEFINE FIELD IF NOT EXISTS name ON TABLE _migration TYPE string;
DEFINE FIELD IF NOT EXISTS applied_at ON TABLE _migration TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX IF NOT EXISTS idx_migration_version ON TABLE _migration \
    COLUMNS version UNIQUE;
";

#[derive(Debug, SurrealValue)]
struct MigrationRecord {
    version: u32,
    #[allow(dead_code)]
    name: String,
}

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "document_store",
    sql: SCHEMA_V1,
}];

// -----------------------------------------------------------------------
// Schema v1
// -----------------------------------------------------------------------

const SCHEMA_V1: &str = "\
-- =======================================================================
-- Documents (partitioned by namespace and resource kind)
-- =======================================================================
DEFINE TABLE document SCHEMAFULL;
DEFINE FIELD ns_kind ON TABLE document TYPE string;
DEFINE FIELD ns_id ON TABLE document TYPE string;
DEFINE FIELD resource_kind ON TABLE document TYPE string;
DEFINE FIELD resource_id ON TABLE document TYPE string;
DEFINE FIELD kind ON TABLE document TYPE string \
    ASSERT $value IN ['cert-policy', 'certificate', 'cert-rule-issuer', \
    'cert-rule-ms-entra-client-cred', 'agent-instance', 'agent-config'];
DEFINE FIELD etag ON TABLE document TYPE string;
DEFINE FIELD updated ON TABLE document TYPE datetime;
DEFINE FIELD deleted ON TABLE document TYPE option<datetime>;
DEFINE FIELD updated_by ON TABLE document TYPE string;
DEFINE FIELD status ON TABLE document TYPE option<string> \
    ASSERT $value = NONE OR $value IN ['pending', 'issued', 'error'];
DEFINE FIELD policy ON TABLE document TYPE option<string>;
DEFINE FIELD iat ON TABLE document TYPE option<datetime>;
DEFINE FIELD body ON TABLE document TYPE object FLEXIBLE;
DEFINE INDEX idx_document_partition ON TABLE document \
    COLUMNS ns_kind, ns_id, resource_kind;
DEFINE INDEX idx_document_policy_status ON TABLE document \
    COLUMNS policy, status;
";

// -----------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------

/// Run all pending migrations against the given SurrealDB client.
///
/// Creates a `_migration` tracking table on first run, then applies
/// each migration whose version exceeds the current maximum.
pub async fn run_migrations<C: Connection>(db: &Surreal<C>) -> Result<(), DbError> {
    db.query(MIGRATION_TABLE_DDL)
        .await?
        .check()
        .map_err(|e| DbError::Migration(e.to_string()))?;

    let mut result = db
        .query("SELECT * FROM _migration ORDER BY version DESC LIMIT 1")
        .await?;
    let records: Vec<MigrationRecord> = result.take(0)?;
    let current_version = records.first().map(|m| m.version).unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version > current_version {
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            db.query(migration.sql).await?.check().map_err(|e| {
                DbError::Migration(format!(
                    "Migration v{} '{}' failed: {}",
                    migration.version, migration.name, e,
                ))
            })?;

            db.query(
                "CREATE _migration SET version = $version, \
                 name = $name",
            )
            .bind(("version", migration.version))
            .bind(("name", migration.name))
            .await?
            .check()
            .map_err(|e| {
                DbError::Migration(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e,
                ))
            })?;

            info!(version = migration.version, "Migration applied");
        }
    }

    Ok(())
}

/// Returns the raw schema DDL for version 1.
pub fn schema_v1() -> &'static str {
    SCHEMA_V1
}
