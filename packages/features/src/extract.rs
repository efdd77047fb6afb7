//! Buffered feature queries.
//!
//! One statement per (feature, point batch): buffer the points at the five
//! radii, aggregate the source layer inside each buffer, and hand the
//! resulting select to the idempotent writer as an `INSERT ... SELECT`.
//! The rows never travel to the client.
//!
//! Geometry features clip source geometry to the largest buffer and cascade
//! the clip down the radii, reusing the previous clip whenever it is
//! already covered by the next buffer. Value features aggregate a numeric
//! column with a per-radius `FILTER` instead. Points (or hours) with no
//! intersecting source rows come back as zeros, not gaps, so availability
//! converges after one pass.

use std::fmt::Write as _;

use airmap_database::writer::{self, OnConflict, RecordSource};
use airmap_database_models::{TimeWindow, tables};
use airmap_feature_models::{
    Aggregate, BufferSize, ColumnFilter, DynamicFeatureName, FeatureKind, FeatureSource,
    StaticFeatureName,
};
use switchy_database::{Database, DatabaseValue};
use uuid::Uuid;

use crate::{FeatureError, sql};

const fn source_table(source: FeatureSource) -> &'static str {
    match source {
        FeatureSource::Ukmap => "ukmap",
        FeatureSource::Oshighway => "oshighway",
        FeatureSource::StreetCanyon => "street_canyon",
        FeatureSource::ScootRoads => "scoot_road_reading",
        FeatureSource::Scoot => "scoot_reading",
    }
}

/// The `buffers` CTE: one row per interest point with the point's buffer
/// polygon at every radius, largest first.
fn buffers_cte(point_idx: usize, point_count: usize) -> String {
    let mut buffer_columns = String::new();

    for buffer in BufferSize::ALL_DESCENDING {
        let metres = buffer.metres();
        write!(
            buffer_columns,
            ",
                    ST_Buffer(ip.location::geography, {metres})::geometry AS buff_{metres}"
        )
        .unwrap();
    }

    let points = sql::placeholder_list(point_idx, point_count, Some("uuid"));

    format!(
        "WITH buffers AS (
             SELECT ip.id{buffer_columns}
             FROM interest_point ip
             WHERE ip.id IN ({points})
         )"
    )
}

/// Renders the row filters of a feature definition as a `WHERE` clause,
/// assigning parameter indices from `start_idx`.
fn filter_clause(filters: &[ColumnFilter], start_idx: usize) -> (String, Vec<DatabaseValue>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let mut param_idx = start_idx;

    for filter in filters {
        match filter {
            ColumnFilter::Equals(column, value) => {
                clauses.push(format!("{column} = ${param_idx}"));
                params.push(DatabaseValue::String((*value).to_string()));
                param_idx += 1;
            }
            ColumnFilter::OneOf(column, values) => {
                clauses.push(format!(
                    "{column} IN ({})",
                    sql::placeholder_list(param_idx, values.len(), None)
                ));
                for value in *values {
                    params.push(DatabaseValue::String((*value).to_string()));
                }
                param_idx += values.len();
            }
            ColumnFilter::Below(column, bound) => {
                clauses.push(format!("{column} < ${param_idx}"));
                params.push(DatabaseValue::Real64(*bound));
                param_idx += 1;
            }
        }
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    (clause, params)
}

/// One aggregate select-list entry per radius, in descending radius order.
fn aggregate_columns(aggregate: Aggregate) -> String {
    let mut columns = String::new();

    for buffer in BufferSize::ALL_DESCENDING {
        let metres = buffer.metres();
        let expression = match aggregate {
            Aggregate::SumLength => format!("SUM(ST_Length(c_{metres}.geom::geography))"),
            Aggregate::SumArea => format!("SUM(ST_Area(c_{metres}.geom::geography))"),
            Aggregate::Max => {
                format!("MAX(src.val) FILTER (WHERE ST_Intersects(src.geom, b.buff_{metres}))")
            }
            Aggregate::Min => {
                format!("MIN(src.val) FILTER (WHERE ST_Intersects(src.geom, b.buff_{metres}))")
            }
            Aggregate::Avg => {
                format!("AVG(src.val) FILTER (WHERE ST_Intersects(src.geom, b.buff_{metres}))")
            }
        };
        write!(
            columns,
            ",
                    {expression} AS {}",
            buffer.column()
        )
        .unwrap();
    }

    columns
}

/// The cascaded clip: each radius reuses the previous radius's clipped
/// geometry when the next buffer already covers it, and intersects
/// otherwise. Walks the radii largest to smallest.
fn clip_chain() -> String {
    let mut chain = String::new();
    let mut prev = String::from("src.geom");

    for buffer in BufferSize::ALL_DESCENDING {
        let metres = buffer.metres();
        write!(
            chain,
            "
             CROSS JOIN LATERAL (
                 SELECT CASE
                     WHEN ST_CoveredBy({prev}, b.buff_{metres}) THEN {prev}
                     ELSE ST_Intersection({prev}, b.buff_{metres})
                 END AS geom
             ) c_{metres}"
        )
        .unwrap();
        prev = format!("c_{metres}.geom");
    }

    chain
}

/// Zero-substituted value columns read from the aggregation subquery.
fn coalesced_columns() -> String {
    let mut columns = String::new();

    for (i, buffer) in BufferSize::ALL_DESCENDING.iter().enumerate() {
        if i > 0 {
            columns.push_str(",\n                ");
        }
        write!(columns, "COALESCE(agg.{}, 0.0)", buffer.column()).unwrap();
    }

    columns
}

/// Builds the select feeding `static_feature`, with columns in
/// [`tables::STATIC_FEATURE`] order.
fn build_static_select(
    feature: StaticFeatureName,
    point_ids: &[Uuid],
) -> (String, Vec<DatabaseValue>) {
    let def = feature.definition();
    let table = source_table(def.source);

    // $1 feature name, $2 feature source, then filters, then point ids.
    let (filter_sql, filter_params) = filter_clause(def.filters, 3);
    let point_idx = 3 + filter_params.len();

    let buffers = buffers_cte(point_idx, point_ids.len());
    let largest = BufferSize::ALL_DESCENDING[0].metres();
    let agg_columns = aggregate_columns(def.aggregate);
    let coalesced = coalesced_columns();

    let source_select = match def.value_column {
        Some(column) if def.kind() == FeatureKind::Value => {
            format!("SELECT geom, {column} AS val FROM {table}{filter_sql}")
        }
        _ => format!("SELECT geom FROM {table}{filter_sql}"),
    };

    let clips = if def.kind() == FeatureKind::Geometry {
        clip_chain()
    } else {
        String::new()
    };

    let statement = format!(
        "{buffers}
         SELECT b.id,
                $1,
                $2,
                {coalesced}
         FROM buffers b
         LEFT JOIN (
             SELECT b.id AS id{agg_columns}
             FROM buffers b
             JOIN ({source_select}) src
                 ON ST_Intersects(src.geom, b.buff_{largest}){clips}
             GROUP BY b.id
         ) agg ON agg.id = b.id"
    );

    let mut params = Vec::with_capacity(2 + filter_params.len() + point_ids.len());
    params.push(DatabaseValue::String(feature.to_string()));
    params.push(DatabaseValue::String(def.source.to_string()));
    params.extend(filter_params);
    for point_id in point_ids {
        params.push(DatabaseValue::String(point_id.to_string()));
    }

    (statement, params)
}

/// Builds the select feeding `dynamic_feature`, with columns in
/// [`tables::DYNAMIC_FEATURE`] order.
///
/// The expected (point, hour) grid comes from `generate_series`, so hours
/// without a single reading on any road in range still produce zero rows
/// rather than gaps.
fn build_dynamic_select(
    feature: DynamicFeatureName,
    point_ids: &[Uuid],
    window: TimeWindow,
) -> (String, Vec<DatabaseValue>) {
    let def = feature.definition();
    let column = feature.value_column();

    // $1 feature name, $2 feature source, $3 window start, $4 window end,
    // then point ids.
    let buffers = buffers_cte(5, point_ids.len());
    let largest = BufferSize::ALL_DESCENDING[0].metres();
    let agg_columns = aggregate_columns(def.aggregate);
    let coalesced = coalesced_columns();

    let statement = format!(
        "{buffers},
         hours AS (
             SELECT generate_series(
                 $3,
                 $4 - INTERVAL '1 hour',
                 INTERVAL '1 hour'
             ) AS measurement_start_utc
         )
         SELECT b.id,
                h.measurement_start_utc,
                $1,
                $2,
                {coalesced}
         FROM buffers b
         CROSS JOIN hours h
         LEFT JOIN (
             SELECT b.id AS id,
                    src.measurement_start_utc{agg_columns}
             FROM buffers b
             JOIN (
                 SELECT r.geom, sr.measurement_start_utc, sr.{column} AS val
                 FROM oshighway r
                 JOIN scoot_road_reading sr ON sr.road_toid = r.toid
                 WHERE sr.measurement_start_utc >= $3
                   AND sr.measurement_start_utc < $4
             ) src
                 ON ST_Intersects(src.geom, b.buff_{largest})
             GROUP BY b.id, src.measurement_start_utc
         ) agg ON agg.id = b.id AND agg.measurement_start_utc = h.measurement_start_utc"
    );

    let mut params = Vec::with_capacity(4 + point_ids.len());
    params.push(DatabaseValue::String(feature.to_string()));
    params.push(DatabaseValue::String(def.source.to_string()));
    params.push(DatabaseValue::DateTime(window.start.naive_utc()));
    params.push(DatabaseValue::DateTime(window.end.naive_utc()));
    for point_id in point_ids {
        params.push(DatabaseValue::String(point_id.to_string()));
    }

    (statement, params)
}

/// Computes one static feature for a batch of points, writing one row per
/// point. Existing rows for the same (point, feature) key are overwritten.
///
/// # Errors
///
/// Returns [`FeatureError`] if the statement fails.
pub async fn insert_static_features(
    db: &dyn Database,
    feature: StaticFeatureName,
    point_ids: &[Uuid],
) -> Result<u64, FeatureError> {
    if point_ids.is_empty() {
        return Ok(0);
    }

    let (sql, params) = build_static_select(feature, point_ids);

    Ok(writer::commit_records(
        db,
        RecordSource::Query { sql, params },
        &tables::STATIC_FEATURE,
        OnConflict::Overwrite,
    )
    .await?)
}

/// Computes one dynamic feature for a batch of points over a window,
/// writing one row per (point, hour). Existing rows are overwritten.
///
/// # Errors
///
/// Returns [`FeatureError`] if the statement fails.
pub async fn insert_dynamic_features(
    db: &dyn Database,
    feature: DynamicFeatureName,
    point_ids: &[Uuid],
    window: TimeWindow,
) -> Result<u64, FeatureError> {
    if point_ids.is_empty() {
        return Ok(0);
    }

    let (sql, params) = build_dynamic_select(feature, point_ids, window);

    Ok(writer::commit_records(
        db,
        RecordSource::Query { sql, params },
        &tables::DYNAMIC_FEATURE,
        OnConflict::Overwrite,
    )
    .await?)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};

    use super::*;
    use crate::sql::max_placeholder;

    fn point_ids(count: usize) -> Vec<Uuid> {
        (0..count).map(|_| Uuid::new_v4()).collect()
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("'{needle}' not found in statement"))
    }

    #[test]
    fn buffers_descend_from_largest_to_smallest() {
        let (sql, _) = build_static_select(StaticFeatureName::TotalRoadLength, &point_ids(1));

        let mut last = 0;
        for metres in [1000, 500, 200, 100, 10] {
            let at = position(&sql, &format!("geography, {metres})::geometry AS buff_{metres}"));
            assert!(at > last, "buff_{metres} out of order");
            last = at;
        }
    }

    #[test]
    fn geometry_features_cascade_clips_down_the_radii() {
        let (sql, _) = build_static_select(StaticFeatureName::TotalGrassArea, &point_ids(2));

        assert!(sql.contains("ST_CoveredBy(src.geom, b.buff_1000)"));
        assert!(sql.contains("ST_Intersection(src.geom, b.buff_1000)"));
        assert!(sql.contains("ST_CoveredBy(c_1000.geom, b.buff_500)"));
        assert!(sql.contains("ST_CoveredBy(c_500.geom, b.buff_200)"));
        assert!(sql.contains("ST_CoveredBy(c_200.geom, b.buff_100)"));
        assert!(sql.contains("ST_CoveredBy(c_100.geom, b.buff_10)"));
        assert!(sql.contains("SUM(ST_Area(c_10.geom::geography)) AS value_10"));
        assert!(!sql.contains("FILTER"));
    }

    #[test]
    fn value_features_filter_per_radius_without_clipping() {
        let (sql, params) = build_static_select(StaticFeatureName::BuildingHeight, &point_ids(1));

        assert!(sql.contains("SELECT geom, calculated_height_of_building AS val FROM ukmap"));
        assert!(sql.contains("feature_type = $3"));
        assert!(sql.contains("calculated_height_of_building < $4"));
        assert!(
            sql.contains("MAX(src.val) FILTER (WHERE ST_Intersects(src.geom, b.buff_10)) AS value_10")
        );
        assert!(!sql.contains("ST_CoveredBy"));

        assert_eq!(params[0], DatabaseValue::String("building_height".to_string()));
        assert_eq!(params[1], DatabaseValue::String("ukmap".to_string()));
        assert_eq!(params[2], DatabaseValue::String("Building".to_string()));
        assert_eq!(params[3], DatabaseValue::Real64(999.9));
        assert_eq!(max_placeholder(&sql), params.len());
    }

    #[test]
    fn one_of_filters_expand_to_in_lists() {
        let (sql, params) = build_static_select(StaticFeatureName::TotalFlatArea, &point_ids(3));

        assert!(sql.contains("feature_type IN ($3, $4)"));
        assert_eq!(params[2], DatabaseValue::String("Vegetated".to_string()));
        assert_eq!(params[3], DatabaseValue::String("Water".to_string()));
        // Point ids follow the filter params.
        assert!(sql.contains("ip.id IN ($5::uuid, $6::uuid, $7::uuid)"));
        assert_eq!(max_placeholder(&sql), params.len());
    }

    #[test]
    fn every_radius_is_zero_substituted() {
        let (sql, _) = build_static_select(StaticFeatureName::MinCanyonRatio, &point_ids(1));

        for buffer in BufferSize::ALL_DESCENDING {
            assert!(
                sql.contains(&format!("COALESCE(agg.{}, 0.0)", buffer.column())),
                "{} not zero-substituted",
                buffer.column()
            );
        }
        assert!(sql.contains("LEFT JOIN ("));
    }

    #[test]
    fn unfiltered_features_have_no_where_on_the_source() {
        let (sql, params) = build_static_select(StaticFeatureName::TotalLength, &point_ids(1));

        assert!(sql.contains("(SELECT geom FROM oshighway) src"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn dynamic_select_grids_hours_and_joins_readings() {
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let (sql, params) =
            build_dynamic_select(DynamicFeatureName::AvgOccupancyPercentage, &point_ids(2), window);

        assert!(sql.contains("$4 - INTERVAL '1 hour'"));
        assert!(sql.contains("CROSS JOIN hours h"));
        assert!(sql.contains("JOIN scoot_road_reading sr ON sr.road_toid = r.toid"));
        assert!(sql.contains("sr.occupancy_percentage AS val"));
        assert!(sql.contains("AVG(src.val) FILTER"));
        assert!(sql.contains("GROUP BY b.id, src.measurement_start_utc"));
        assert!(sql.contains("agg.measurement_start_utc = h.measurement_start_utc"));

        assert_eq!(
            params[0],
            DatabaseValue::String("avg_occupancy_percentage".to_string())
        );
        assert_eq!(params[1], DatabaseValue::String("scoot_roads".to_string()));
        assert!(matches!(params[2], DatabaseValue::DateTime(_)));
        assert!(matches!(params[3], DatabaseValue::DateTime(_)));
        assert!(sql.contains("ip.id IN ($5::uuid, $6::uuid)"));
        assert_eq!(max_placeholder(&sql), params.len());
    }

    #[test]
    fn selects_align_with_writable_table_columns() {
        // Static select order: point, name, source, five values.
        let (sql, _) = build_static_select(StaticFeatureName::TotalRoadLength, &point_ids(1));
        let select_at = position(&sql, "SELECT b.id,\n                $1,\n                $2,");
        assert!(select_at > 0);
        assert_eq!(tables::STATIC_FEATURE.params_per_row(), 8);

        // Dynamic adds the hour after the point id.
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 3, 1, 6, 0, 0).unwrap(),
        )
        .unwrap();
        let (sql, _) =
            build_dynamic_select(DynamicFeatureName::MaxNVehicles, &point_ids(1), window);
        assert!(sql.contains("SELECT b.id,\n                h.measurement_start_utc,"));
        assert_eq!(tables::DYNAMIC_FEATURE.params_per_row(), 9);
    }
}
