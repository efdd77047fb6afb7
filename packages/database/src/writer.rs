//! Idempotent bulk writes with explicit conflict policies.
//!
//! Everything the pipeline persists goes through [`commit_records`]: the
//! feature statements (query-derived), road/detector matches and experiment
//! bookkeeping (materialized rows). The conflict policy is explicit at
//! every call site: [`OnConflict::Overwrite`] refreshes non-key columns
//! from the incoming row, [`OnConflict::Ignore`] keeps stored rows
//! untouched. Re-running a batch converges instead of erroring or
//! duplicating.

use std::fmt::Write as _;

use airmap_database_models::TableSpec;
use switchy_database::{Database, DatabaseValue};

use crate::{DbError, PG_MAX_PARAMS};

/// How an insert resolves rows that collide with an existing natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Refresh every non-key column from the incoming row.
    Overwrite,
    /// Keep the stored row untouched.
    Ignore,
}

/// Rows to commit: materialized values, or a query the server evaluates in
/// place.
pub enum RecordSource {
    /// Materialized rows, each aligned with the target table's column list.
    Rows(Vec<Vec<DatabaseValue>>),
    /// A `SELECT` producing rows aligned with the target table's column list.
    ///
    /// The select must not yield two rows with the same natural key:
    /// `ON CONFLICT` refuses to touch the same row twice within one
    /// statement, and a query-derived commit has no per-row fallback.
    Query {
        /// The select statement, without the insert prefix.
        sql: String,
        /// Bind parameters for the select.
        params: Vec<DatabaseValue>,
    },
}

/// Inserts records into `table` under the given conflict policy, returning
/// the number of rows written.
///
/// Materialized rows are chunked to stay under `PostgreSQL`'s bind-parameter
/// limit. If a bulk chunk fails with a uniqueness violation while
/// overwriting (typically a batch carrying the same natural key twice),
/// the chunk is retried row by row so the last row with a given key wins.
/// Any other integrity error propagates unchanged.
///
/// # Errors
///
/// Returns [`DbError`] if a statement fails for any reason other than the
/// recoverable uniqueness case above, or if a row's length does not match
/// the table's column count.
pub async fn commit_records(
    db: &dyn Database,
    source: RecordSource,
    table: &TableSpec,
    on_conflict: OnConflict,
) -> Result<u64, DbError> {
    match source {
        RecordSource::Rows(rows) => commit_rows(db, &rows, table, on_conflict).await,
        RecordSource::Query { sql, params } => {
            let statement = build_select_insert(table, &sql, on_conflict);
            Ok(db.exec_raw_params(&statement, &params).await?)
        }
    }
}

async fn commit_rows(
    db: &dyn Database,
    rows: &[Vec<DatabaseValue>],
    table: &TableSpec,
    on_conflict: OnConflict,
) -> Result<u64, DbError> {
    if rows.is_empty() {
        return Ok(0);
    }

    for row in rows {
        if row.len() != table.columns.len() {
            return Err(DbError::Conversion {
                message: format!(
                    "row has {} values but {} has {} columns",
                    row.len(),
                    table.name,
                    table.columns.len()
                ),
            });
        }
    }

    let chunk_size = PG_MAX_PARAMS / table.params_per_row();
    let mut total = 0u64;

    for chunk in rows.chunks(chunk_size) {
        match insert_chunk(db, chunk, table, on_conflict).await {
            Ok(written) => total += written,
            Err(err) if on_conflict == OnConflict::Overwrite && is_unique_violation(&err) => {
                log::warn!(
                    "bulk insert into {} hit a uniqueness conflict ({err}); retrying {} rows individually",
                    table.name,
                    chunk.len()
                );
                total += upsert_rows_individually(db, chunk, table).await?;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(total)
}

async fn insert_chunk(
    db: &dyn Database,
    chunk: &[Vec<DatabaseValue>],
    table: &TableSpec,
    on_conflict: OnConflict,
) -> Result<u64, DbError> {
    let sql = build_values_insert(table, chunk.len(), on_conflict);
    let params: Vec<DatabaseValue> = chunk.iter().flatten().cloned().collect();
    Ok(db.exec_raw_params(&sql, &params).await?)
}

/// Retries a collided chunk one row at a time. Within the chunk, the last
/// row carrying a given key wins.
async fn upsert_rows_individually(
    db: &dyn Database,
    chunk: &[Vec<DatabaseValue>],
    table: &TableSpec,
) -> Result<u64, DbError> {
    let sql = build_values_insert(table, 1, OnConflict::Overwrite);
    let mut total = 0u64;

    for row in chunk {
        total += db.exec_raw_params(&sql, row).await?;
    }

    Ok(total)
}

fn build_values_insert(table: &TableSpec, n_rows: usize, on_conflict: OnConflict) -> String {
    let mut sql = insert_prefix(table);
    sql.push_str(" VALUES ");

    let mut idx = 1usize;
    for row in 0..n_rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (i, column) in table.columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            write!(sql, "${idx}").unwrap();
            if let Some(cast) = column.cast {
                write!(sql, "::{cast}").unwrap();
            }
            idx += 1;
        }
        sql.push(')');
    }

    sql.push_str(&conflict_clause(table, on_conflict));
    sql
}

fn build_select_insert(table: &TableSpec, select_sql: &str, on_conflict: OnConflict) -> String {
    format!(
        "{} {}{}",
        insert_prefix(table),
        select_sql,
        conflict_clause(table, on_conflict)
    )
}

fn insert_prefix(table: &TableSpec) -> String {
    let columns: Vec<&str> = table.columns.iter().map(|column| column.name).collect();
    format!("INSERT INTO {} ({})", table.name, columns.join(", "))
}

fn conflict_clause(table: &TableSpec, on_conflict: OnConflict) -> String {
    let keys = table.key_columns.join(", ");
    match on_conflict {
        OnConflict::Ignore => format!(" ON CONFLICT ({keys}) DO NOTHING"),
        OnConflict::Overwrite => {
            let assignments: Vec<String> = table
                .non_key_columns()
                .map(|name| format!("{name} = EXCLUDED.{name}"))
                .collect();
            if assignments.is_empty() {
                // Every column is part of the key; nothing to refresh.
                return format!(" ON CONFLICT ({keys}) DO NOTHING");
            }
            format!(
                " ON CONFLICT ({keys}) DO UPDATE SET {}",
                assignments.join(", ")
            )
        }
    }
}

fn is_unique_violation(err: &DbError) -> bool {
    let message = err.to_string();
    message.contains("duplicate key value violates unique constraint")
        || message.contains("cannot affect row a second time")
}

#[cfg(test)]
mod tests {
    use airmap_database_models::{ColumnDef, tables};

    use super::*;

    #[test]
    fn overwrite_refreshes_every_non_key_column() {
        let clause = conflict_clause(&tables::STATIC_FEATURE, OnConflict::Overwrite);
        assert_eq!(
            clause,
            " ON CONFLICT (point_id, feature_name) DO UPDATE SET \
             feature_source = EXCLUDED.feature_source, \
             value_1000 = EXCLUDED.value_1000, \
             value_500 = EXCLUDED.value_500, \
             value_200 = EXCLUDED.value_200, \
             value_100 = EXCLUDED.value_100, \
             value_10 = EXCLUDED.value_10"
        );
    }

    #[test]
    fn ignore_keeps_stored_rows() {
        assert_eq!(
            conflict_clause(&tables::SCOOT_ROAD_MATCH, OnConflict::Ignore),
            " ON CONFLICT (road_toid, detector_n) DO NOTHING"
        );
    }

    #[test]
    fn all_key_table_overwrite_degrades_to_ignore() {
        let spec = TableSpec {
            name: "membership",
            columns: &[
                ColumnDef {
                    name: "left_id",
                    cast: None,
                },
                ColumnDef {
                    name: "right_id",
                    cast: None,
                },
            ],
            key_columns: &["left_id", "right_id"],
        };
        assert_eq!(
            conflict_clause(&spec, OnConflict::Overwrite),
            " ON CONFLICT (left_id, right_id) DO NOTHING"
        );
    }

    #[test]
    fn values_insert_casts_typed_columns() {
        let sql = build_values_insert(&tables::MODEL, 2, OnConflict::Ignore);
        assert_eq!(
            sql,
            "INSERT INTO air_quality_model (model_name, param_id, model_params) \
             VALUES ($1, $2, $3::jsonb), ($4, $5, $6::jsonb) \
             ON CONFLICT (model_name, param_id) DO NOTHING"
        );
    }

    #[test]
    fn select_insert_appends_conflict_clause() {
        let sql = build_select_insert(
            &tables::SCOOT_ROAD_MATCH,
            "SELECT road_toid, detector_n, distance_m, weight FROM staging",
            OnConflict::Overwrite,
        );
        assert!(sql.starts_with(
            "INSERT INTO scoot_road_match (road_toid, detector_n, distance_m, weight) SELECT"
        ));
        assert!(sql.ends_with(
            "ON CONFLICT (road_toid, detector_n) DO UPDATE SET \
             distance_m = EXCLUDED.distance_m, weight = EXCLUDED.weight"
        ));
    }

    #[test]
    fn chunking_respects_param_limit() {
        let chunk = PG_MAX_PARAMS / tables::DYNAMIC_FEATURE.params_per_row();
        assert_eq!(chunk, 7281);
        assert!(chunk * tables::DYNAMIC_FEATURE.params_per_row() <= PG_MAX_PARAMS);
    }

    #[test]
    fn unique_violation_signatures_are_recognized() {
        let collision = DbError::Conversion {
            message: "duplicate key value violates unique constraint \"static_feature_pkey\""
                .to_string(),
        };
        assert!(is_unique_violation(&collision));

        let in_batch = DbError::Conversion {
            message: "ON CONFLICT DO UPDATE command cannot affect row a second time".to_string(),
        };
        assert!(is_unique_violation(&in_batch));

        let not_null = DbError::Conversion {
            message: "null value in column \"weight\" violates not-null constraint".to_string(),
        };
        assert!(!is_unique_violation(&not_null));
    }
}
