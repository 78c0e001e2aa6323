use rusqlite::{Connection, Transaction};
use thiserror::Error;

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database schema version {found} is newer than supported version {supported}")]
    TooNew { found: i32, supported: i32 },
    #[error("migration to version {version} failed: {source}")]
    Step {
        version: i32,
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

/// Bring the schema up to [`CURRENT_SCHEMA_VERSION`] in one transaction,
/// tracking progress in `PRAGMA user_version`.
pub fn run_migrations(conn: &mut Connection) -> Result<(), MigrationError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(MigrationError::TooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        apply(&tx, next).map_err(|source| MigrationError::Step { version: next, source })?;
        tracing::debug!(version = next, "applied schema migration");
        version = next;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

fn apply(tx: &Transaction<'_>, version: i32) -> Result<(), rusqlite::Error> {
    match version {
        1 => tx.execute_batch(include_str!("schemas/schema_v1.sql")),
        2 => tx.execute_batch(include_str!("schemas/schema_v2.sql")),
        _ => Ok(()),
    }
}
