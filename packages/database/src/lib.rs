#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Database connection, sessions, migrations, and the bulk upsert writer.
//!
//! Uses `switchy_database` for query execution and `switchy_schema` for
//! embedded SQL migrations. `PostGIS` spatial queries elsewhere in the
//! workspace go through `query_raw_params()`; everything written back goes
//! through [`writer::commit_records`], which owns conflict handling.

pub mod db;
pub mod probe;
pub mod session;
pub mod writer;

pub use db::DbPool;

use include_dir::{Dir, include_dir};
use switchy_database::Database;
use switchy_schema::discovery::embedded::EmbeddedMigrationSource;
use switchy_schema::runner::MigrationRunner;

/// Embedded SQL migrations from the `migrations/` directory.
static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/../../migrations");

/// Maximum number of parameters `PostgreSQL` allows per statement.
pub const PG_MAX_PARAMS: usize = 65_535;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Database query error.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] switchy_schema::MigrationError),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// The connectivity probe could not reach its check URL, so the
    /// session was refused before any statement ran.
    #[error("Connectivity check failed for {url}: {source}")]
    Offline {
        /// URL the probe attempted.
        url: String,
        /// Underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },
}

/// Runs all pending database migrations.
///
/// # Errors
///
/// Returns [`DbError`] if any migration fails to apply.
pub async fn run_migrations(db: &dyn Database) -> Result<(), DbError> {
    let source = EmbeddedMigrationSource::new(&MIGRATIONS_DIR);
    let runner = MigrationRunner::new(Box::new(source));
    runner.run(db).await?;
    log::info!("Database migrations completed successfully");
    Ok(())
}
