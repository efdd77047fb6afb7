//! Availability of stored feature rows.
//!
//! Feature extraction is expensive, so runs first ask which (point, feature)
//! combinations already have rows and compute only the gaps. Static
//! availability is a per-point check; dynamic availability expands to the
//! full (point, hour, feature) grid of a time window and reports every
//! expected combination, present or not.

use std::fmt::Write as _;

use airmap_database_models::{
    DynamicAvailability, InvalidWindowError, PointAvailability, TimeWindow,
};
use airmap_feature_models::{DynamicFeatureName, Source, StaticFeatureName};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};
use uuid::Uuid;

use crate::{FeatureError, sql};

#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    #[error("Invalid timestamp '{value}': {source}. Expected YYYY-MM-DD, YYYY-MM-DDTHH:MM:SS, or RFC 3339")]
    Parse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("Mixed timezone-aware and naive timestamps: '{start}', '{end}'")]
    MixedOffsets { start: String, end: String },
    #[error(transparent)]
    Window(#[from] InvalidWindowError),
}

enum ParsedTimestamp {
    Aware(DateTime<Utc>),
    Naive(NaiveDateTime),
}

fn parse_timestamp(value: &str) -> Result<ParsedTimestamp, TimestampError> {
    if let Ok(aware) = DateTime::parse_from_rfc3339(value) {
        return Ok(ParsedTimestamp::Aware(aware.with_timezone(&Utc)));
    }
    // Try full datetime, then date-only at midnight
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(ParsedTimestamp::Naive(naive));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|date| ParsedTimestamp::Naive(date.and_hms_opt(0, 0, 0).unwrap_or_default()))
        .map_err(|source| TimestampError::Parse {
            value: value.to_string(),
            source,
        })
}

/// Parses a pair of timestamp strings into a half-open UTC window.
///
/// Naive timestamps are read as UTC. Both endpoints must be of the same
/// kind: mixing an offset-carrying timestamp with a naive one is rejected
/// rather than silently reinterpreted.
///
/// # Errors
///
/// * If either string is not a recognised timestamp
/// * If one endpoint carries an offset and the other does not
/// * If the start is not strictly before the end
pub fn parse_time_range(start: &str, end: &str) -> Result<TimeWindow, TimestampError> {
    let (start_utc, end_utc) = match (parse_timestamp(start)?, parse_timestamp(end)?) {
        (ParsedTimestamp::Aware(s), ParsedTimestamp::Aware(e)) => (s, e),
        (ParsedTimestamp::Naive(s), ParsedTimestamp::Naive(e)) => (
            DateTime::from_naive_utc_and_offset(s, Utc),
            DateTime::from_naive_utc_and_offset(e, Utc),
        ),
        _ => {
            return Err(TimestampError::MixedOffsets {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
    };

    Ok(TimeWindow::new(start_utc, end_utc)?)
}

fn static_availability_sql(source_count: usize, missing_only: bool) -> String {
    let mut sql = String::from(
        "SELECT ip.id::text AS point_id,
                (sf.point_id IS NOT NULL) AS has_data
         FROM interest_point ip
         LEFT JOIN static_feature sf
             ON sf.point_id = ip.id
             AND sf.feature_name = $1",
    );

    write!(
        sql,
        " WHERE ip.source IN ({})",
        sql::placeholder_list(2, source_count, None)
    )
    .unwrap();

    if missing_only {
        sql.push_str(" AND sf.point_id IS NULL");
    }

    sql.push_str(" ORDER BY ip.id");

    sql
}

/// The expected (point, hour, feature) grid of a window, left-joined onto
/// the rows actually stored. Parameters are the feature names, then the
/// window start and end, then the point sources.
fn dynamic_expected_cte(feature_count: usize, source_count: usize) -> String {
    let start_idx = feature_count + 1;
    let end_idx = feature_count + 2;
    let features = sql::placeholder_list(1, feature_count, None);
    let sources = sql::placeholder_list(feature_count + 3, source_count, None);

    let mut feature_rows = String::new();
    for offset in 0..feature_count {
        if offset > 0 {
            feature_rows.push_str(", ");
        }
        write!(feature_rows, "(${})", offset + 1).unwrap();
    }

    format!(
        "WITH expected AS (
             SELECT ip.id AS point_id,
                    f.feature_name,
                    h.measurement_start_utc
             FROM interest_point ip
             CROSS JOIN (VALUES {feature_rows}) AS f (feature_name)
             CROSS JOIN generate_series(
                 ${start_idx},
                 ${end_idx} - INTERVAL '1 hour',
                 INTERVAL '1 hour'
             ) AS h (measurement_start_utc)
             WHERE ip.source IN ({sources})
         ),
         stored AS (
             SELECT point_id, measurement_start_utc, feature_name
             FROM dynamic_feature
             WHERE feature_name IN ({features})
               AND measurement_start_utc >= ${start_idx}
               AND measurement_start_utc < ${end_idx}
         )"
    )
}

fn dynamic_availability_sql(
    feature_count: usize,
    source_count: usize,
    missing_only: bool,
) -> String {
    let mut sql = dynamic_expected_cte(feature_count, source_count);

    sql.push_str(
        "
         SELECT e.point_id::text AS point_id,
                e.measurement_start_utc,
                e.feature_name,
                (s.point_id IS NOT NULL) AS has_data
         FROM expected e
         LEFT JOIN stored s
             ON s.point_id = e.point_id
             AND s.measurement_start_utc = e.measurement_start_utc
             AND s.feature_name = e.feature_name",
    );

    if missing_only {
        sql.push_str(" WHERE s.point_id IS NULL");
    }

    sql.push_str(" ORDER BY e.point_id, e.measurement_start_utc, e.feature_name");

    sql
}

fn dynamic_ids_sql(feature_count: usize, source_count: usize, missing_only: bool) -> String {
    let mut sql = dynamic_expected_cte(feature_count, source_count);

    sql.push_str(
        "
         SELECT DISTINCT e.point_id::text AS point_id
         FROM expected e
         LEFT JOIN stored s
             ON s.point_id = e.point_id
             AND s.measurement_start_utc = e.measurement_start_utc
             AND s.feature_name = e.feature_name",
    );

    if missing_only {
        sql.push_str(" WHERE s.point_id IS NULL");
    }

    sql.push_str(" ORDER BY point_id");

    sql
}

fn dynamic_params(
    features: &[DynamicFeatureName],
    sources: &[Source],
    window: TimeWindow,
) -> Vec<DatabaseValue> {
    let mut params = Vec::with_capacity(features.len() + sources.len() + 2);

    for feature in features {
        params.push(DatabaseValue::String(feature.to_string()));
    }

    params.push(DatabaseValue::DateTime(window.start.naive_utc()));
    params.push(DatabaseValue::DateTime(window.end.naive_utc()));

    for source in sources {
        params.push(DatabaseValue::String(source.to_string()));
    }

    params
}

fn parse_point_id(value: &str) -> Result<Uuid, FeatureError> {
    Uuid::parse_str(value).map_err(|e| FeatureError::Conversion {
        message: format!("Invalid point id '{value}': {e}"),
    })
}

/// Reports, for every candidate interest point, whether a row of the given
/// static feature is stored. With `missing_only` the stored points are
/// filtered out and every returned entry has `has_data == false`.
///
/// Returns no rows when `sources` is empty: no sources means no candidates.
///
/// # Errors
///
/// Returns [`FeatureError`] if the query fails or a row cannot be parsed.
pub async fn static_feature_availability(
    db: &dyn Database,
    feature_name: StaticFeatureName,
    sources: &[Source],
    missing_only: bool,
) -> Result<Vec<PointAvailability>, FeatureError> {
    if sources.is_empty() {
        return Ok(vec![]);
    }

    let sql = static_availability_sql(sources.len(), missing_only);

    let mut params = Vec::with_capacity(sources.len() + 1);
    params.push(DatabaseValue::String(feature_name.to_string()));
    for source in sources {
        params.push(DatabaseValue::String(source.to_string()));
    }

    let rows = db.query_raw_params(&sql, &params).await?;

    let mut availability = Vec::with_capacity(rows.len());

    for row in &rows {
        let point_id: String = row.to_value("point_id").map_err(|e| FeatureError::Conversion {
            message: format!("Failed to parse point id: {e}"),
        })?;

        availability.push(PointAvailability {
            point_id: parse_point_id(&point_id)?,
            has_data: row.to_value("has_data").unwrap_or(false),
        });
    }

    Ok(availability)
}

/// Interest points that need a static feature computed. With `missing_only`
/// this is the set of points without a stored row; otherwise it is every
/// candidate point.
///
/// # Errors
///
/// Returns [`FeatureError`] if the query fails or a row cannot be parsed.
pub async fn static_point_ids(
    db: &dyn Database,
    feature_name: StaticFeatureName,
    sources: &[Source],
    missing_only: bool,
) -> Result<Vec<Uuid>, FeatureError> {
    let rows = static_feature_availability(db, feature_name, sources, missing_only).await?;

    Ok(rows.into_iter().map(|row| row.point_id).collect())
}

/// Reports, for every expected (point, hour, feature) combination of the
/// window, whether a dynamic feature row is stored. With `missing_only`
/// only the absent combinations are returned.
///
/// Returns no rows when `feature_names` or `sources` is empty.
///
/// # Errors
///
/// Returns [`FeatureError`] if the query fails or a row cannot be parsed.
pub async fn dynamic_feature_availability(
    db: &dyn Database,
    feature_names: &[DynamicFeatureName],
    sources: &[Source],
    window: TimeWindow,
    missing_only: bool,
) -> Result<Vec<DynamicAvailability>, FeatureError> {
    if feature_names.is_empty() || sources.is_empty() {
        return Ok(vec![]);
    }

    let sql = dynamic_availability_sql(feature_names.len(), sources.len(), missing_only);
    let params = dynamic_params(feature_names, sources, window);

    let rows = db.query_raw_params(&sql, &params).await?;

    let mut availability = Vec::with_capacity(rows.len());

    for row in &rows {
        let point_id: String = row.to_value("point_id").map_err(|e| FeatureError::Conversion {
            message: format!("Failed to parse point id: {e}"),
        })?;

        let measured_naive: NaiveDateTime =
            row.to_value("measurement_start_utc")
                .map_err(|e| FeatureError::Conversion {
                    message: format!("Failed to parse measurement time: {e}"),
                })?;

        let feature_name: String =
            row.to_value("feature_name")
                .map_err(|e| FeatureError::Conversion {
                    message: format!("Failed to parse feature name: {e}"),
                })?;
        let feature_name =
            feature_name
                .parse::<DynamicFeatureName>()
                .map_err(|e| FeatureError::Conversion {
                    message: format!("Unknown dynamic feature '{feature_name}': {e}"),
                })?;

        availability.push(DynamicAvailability {
            point_id: parse_point_id(&point_id)?,
            measurement_start_utc: DateTime::from_naive_utc_and_offset(measured_naive, Utc),
            feature_name,
            has_data: row.to_value("has_data").unwrap_or(false),
        });
    }

    Ok(availability)
}

/// Interest points with at least one absent (hour, feature) combination in
/// the window, or every candidate point when `missing_only` is false.
///
/// # Errors
///
/// Returns [`FeatureError`] if the query fails or a row cannot be parsed.
pub async fn dynamic_point_ids(
    db: &dyn Database,
    feature_names: &[DynamicFeatureName],
    sources: &[Source],
    window: TimeWindow,
    missing_only: bool,
) -> Result<Vec<Uuid>, FeatureError> {
    if feature_names.is_empty() || sources.is_empty() {
        return Ok(vec![]);
    }

    let sql = dynamic_ids_sql(feature_names.len(), sources.len(), missing_only);
    let params = dynamic_params(feature_names, sources, window);

    let rows = db.query_raw_params(&sql, &params).await?;

    let mut point_ids = Vec::with_capacity(rows.len());

    for row in &rows {
        let point_id: String = row.to_value("point_id").map_err(|e| FeatureError::Conversion {
            message: format!("Failed to parse point id: {e}"),
        })?;

        point_ids.push(parse_point_id(&point_id)?);
    }

    Ok(point_ids)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;
    use crate::sql::max_placeholder;

    #[test]
    fn static_sql_filters_sources_and_optionally_missing() {
        let sql = static_availability_sql(2, false);
        assert!(sql.contains("LEFT JOIN static_feature sf"));
        assert!(sql.contains("sf.feature_name = $1"));
        assert!(sql.contains("ip.source IN ($2, $3)"));
        assert!(!sql.contains("sf.point_id IS NULL"));
        assert_eq!(max_placeholder(&sql), 3);

        let missing = static_availability_sql(2, true);
        assert!(missing.contains("AND sf.point_id IS NULL"));
    }

    #[test]
    fn dynamic_sql_expands_the_expected_grid() {
        let sql = dynamic_availability_sql(2, 3, false);
        assert!(sql.contains("CROSS JOIN (VALUES ($1), ($2)) AS f (feature_name)"));
        assert!(sql.contains("generate_series("));
        assert!(sql.contains("$4 - INTERVAL '1 hour'"));
        assert!(sql.contains(") AS h (measurement_start_utc)"));
        assert!(sql.contains("ip.source IN ($5, $6, $7)"));
        assert!(sql.contains("feature_name IN ($1, $2)"));
        assert!(sql.contains("measurement_start_utc >= $3"));
        assert!(sql.contains("measurement_start_utc < $4"));
        assert!(!sql.contains("WHERE s.point_id IS NULL"));
        assert_eq!(max_placeholder(&sql), 7);
    }

    #[test]
    fn dynamic_sql_params_line_up() {
        let features = [
            DynamicFeatureName::MaxNVehicles,
            DynamicFeatureName::AvgOccupancyPercentage,
        ];
        let sources = [Source::Laqn, Source::Aqe, Source::Grid100];
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();

        let sql = dynamic_availability_sql(features.len(), sources.len(), true);
        let params = dynamic_params(&features, &sources, window);

        assert_eq!(max_placeholder(&sql), params.len());
        assert_eq!(
            params[0],
            DatabaseValue::String("max_n_vehicles".to_string())
        );
        assert_eq!(params[4], DatabaseValue::String("laqn".to_string()));
        assert_eq!(params[6], DatabaseValue::String("grid_100".to_string()));
        assert!(sql.contains("WHERE s.point_id IS NULL"));
    }

    #[test]
    fn dynamic_ids_sql_deduplicates_points() {
        let sql = dynamic_ids_sql(1, 1, true);
        assert!(sql.contains("SELECT DISTINCT e.point_id::text AS point_id"));
        assert!(sql.contains("WHERE s.point_id IS NULL"));
        assert!(sql.ends_with("ORDER BY point_id"));
    }

    #[test]
    fn time_range_accepts_naive_and_rfc3339_pairs() {
        let window = parse_time_range("2021-03-01", "2021-03-02").unwrap();
        assert_eq!(window.num_hours(), 24);

        let window = parse_time_range("2021-03-01T06:00:00", "2021-03-01T18:00:00").unwrap();
        assert_eq!(window.num_hours(), 12);

        let window =
            parse_time_range("2021-03-01T06:00:00+02:00", "2021-03-01T12:00:00+00:00").unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2021, 3, 1, 4, 0, 0).unwrap());
        assert_eq!(window.num_hours(), 8);
    }

    #[test]
    fn time_range_rejects_mixed_offset_kinds() {
        let err = parse_time_range("2021-03-01T00:00:00Z", "2021-03-02").unwrap_err();
        assert!(matches!(err, TimestampError::MixedOffsets { .. }));

        let err = parse_time_range("2021-03-01", "2021-03-02T00:00:00+01:00").unwrap_err();
        assert!(matches!(err, TimestampError::MixedOffsets { .. }));
    }

    #[test]
    fn time_range_rejects_garbage_and_inverted_windows() {
        assert!(matches!(
            parse_time_range("yesterday", "2021-03-02"),
            Err(TimestampError::Parse { .. })
        ));
        assert!(matches!(
            parse_time_range("2021-03-02", "2021-03-02"),
            Err(TimestampError::Window(_))
        ));
        assert!(matches!(
            parse_time_range("2021-03-03", "2021-03-02"),
            Err(TimestampError::Window(_))
        ));
    }
}
