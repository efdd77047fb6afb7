//! Road-to-detector matching.
//!
//! SCOOT detectors sit on road links. A road carrying its own detectors is
//! matched to each of them at the true centroid-to-detector distance; a
//! road without any borrows its five nearest detectors instead, found by
//! index-accelerated `<->` ordering. Each road's matches get aggregation
//! weights and land in `scoot_road_match`, where the per-road aggregation
//! job and the buffered feature path pick them up.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use airmap_database::DbPool;
use airmap_database::writer::{self, OnConflict, RecordSource};
use airmap_database_models::{DetectorDistance, RoadMatch, tables};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};

use crate::ScootError;

/// Detectors borrowed by a road that has none of its own.
pub const NEAREST_DETECTORS: u32 = 5;

/// What a mapping run did, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoadMappingSummary {
    /// Roads matched to detectors sitting on them.
    pub colocated_roads: usize,
    /// Roads matched to borrowed nearest detectors.
    pub backfilled_roads: usize,
    /// Match rows written.
    pub matches_written: u64,
}

impl std::fmt::Display for RoadMappingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} roads with own detectors, {} borrowing nearest, {} matches written",
            self.colocated_roads, self.backfilled_roads, self.matches_written
        )
    }
}

async fn colocated_distances(db: &dyn Database) -> Result<Vec<DetectorDistance>, ScootError> {
    let rows = db
        .query_raw_params(
            "SELECT r.toid AS road_toid,
                    d.detector_n,
                    ST_Distance(ST_Centroid(r.geom)::geography, ip.location::geography)
                        AS distance_m
             FROM oshighway r
             JOIN scoot_detector d ON d.toid = r.toid
             JOIN interest_point ip ON ip.id = d.point_id
             ORDER BY r.toid, d.detector_n",
            &[],
        )
        .await?;

    parse_distance_rows(&rows)
}

async fn nearest_distances(
    db: &dyn Database,
    n_detectors: u32,
) -> Result<Vec<DetectorDistance>, ScootError> {
    let rows = db
        .query_raw_params(
            "SELECT r.toid AS road_toid,
                    nearest.detector_n,
                    nearest.distance_m
             FROM oshighway r
             CROSS JOIN LATERAL (
                 SELECT det.detector_n,
                        ST_Distance(ST_Centroid(r.geom)::geography, ip.location::geography)
                            AS distance_m
                 FROM scoot_detector det
                 JOIN interest_point ip ON ip.id = det.point_id
                 ORDER BY ip.location <-> ST_Centroid(r.geom)
                 LIMIT $1
             ) nearest
             WHERE NOT EXISTS (
                 SELECT 1 FROM scoot_detector d WHERE d.toid = r.toid
             )
             ORDER BY r.toid, nearest.distance_m",
            &[DatabaseValue::Int64(i64::from(n_detectors))],
        )
        .await?;

    parse_distance_rows(&rows)
}

fn parse_distance_rows(
    rows: &[switchy_database::Row],
) -> Result<Vec<DetectorDistance>, ScootError> {
    let mut distances = Vec::with_capacity(rows.len());

    for row in rows {
        distances.push(DetectorDistance {
            road_toid: row.to_value("road_toid").map_err(|e| ScootError::Conversion {
                message: format!("Failed to parse road toid: {e}"),
            })?,
            detector_n: row
                .to_value("detector_n")
                .map_err(|e| ScootError::Conversion {
                    message: format!("Failed to parse detector id: {e}"),
                })?,
            distance_m: row.to_value("distance_m").map_err(|e| ScootError::Conversion {
                message: format!("Failed to parse detector distance: {e}"),
            })?,
        });
    }

    Ok(distances)
}

/// Assigns each road's matches their aggregation weights.
///
/// A road whose distance sum is exactly zero gets all-zero weights instead
/// of dividing by zero.
fn assign_weights(distances: Vec<DetectorDistance>) -> Vec<RoadMatch> {
    let mut by_road: BTreeMap<String, Vec<DetectorDistance>> = BTreeMap::new();

    for distance in distances {
        by_road
            .entry(distance.road_toid.clone())
            .or_default()
            .push(distance);
    }

    let mut matches = Vec::new();

    for road_distances in by_road.into_values() {
        let total: f64 = road_distances.iter().map(|d| d.distance_m).sum();

        // Weight is distance * (1 / total distance), so farther detectors
        // carry larger weights.
        // TODO: flip to inverse-distance weighting; has to land together
        // with a rebuild of scoot_road_reading, which was aggregated with
        // these weights.
        for distance in road_distances {
            let weight = if total > 0.0 {
                distance.distance_m * (1.0 / total)
            } else {
                0.0
            };

            matches.push(RoadMatch {
                road_toid: distance.road_toid,
                detector_n: distance.detector_n,
                distance_m: distance.distance_m,
                weight,
            });
        }
    }

    matches
}

fn distinct_roads(distances: &[DetectorDistance]) -> usize {
    distances
        .iter()
        .map(|distance| distance.road_toid.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

fn road_match_row(road_match: &RoadMatch) -> Vec<DatabaseValue> {
    vec![
        DatabaseValue::String(road_match.road_toid.clone()),
        DatabaseValue::String(road_match.detector_n.clone()),
        DatabaseValue::Real64(road_match.distance_m),
        DatabaseValue::Real64(road_match.weight),
    ]
}

/// Matches every road link to its detectors and persists the weighted
/// matches, overwriting earlier matches for the same (road, detector).
///
/// # Errors
///
/// Returns [`ScootError`] if a query fails or the matches cannot be
/// written.
pub async fn map_roads_to_detectors(pool: &DbPool) -> Result<RoadMappingSummary, ScootError> {
    let start = Instant::now();

    let colocated = colocated_distances(pool.db()).await?;
    let backfilled = nearest_distances(pool.db(), NEAREST_DETECTORS).await?;

    let summary_roads = (distinct_roads(&colocated), distinct_roads(&backfilled));

    log::info!(
        "matching {} roads with own detectors and {} without",
        summary_roads.0,
        summary_roads.1,
    );

    let mut distances = colocated;
    distances.extend(backfilled);

    let rows: Vec<Vec<DatabaseValue>> = assign_weights(distances)
        .iter()
        .map(road_match_row)
        .collect();

    let session = pool.open_session().await?;

    match writer::commit_records(
        session.db(),
        RecordSource::Rows(rows),
        &tables::SCOOT_ROAD_MATCH,
        OnConflict::Overwrite,
    )
    .await
    {
        Ok(matches_written) => {
            session.commit().await?;

            let summary = RoadMappingSummary {
                colocated_roads: summary_roads.0,
                backfilled_roads: summary_roads.1,
                matches_written,
            };

            log::info!("road mapping done in {:?}: {summary}", start.elapsed());

            Ok(summary)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback().await {
                log::error!("Failed to roll back road mapping: {rollback_err:?}");
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(road: &str, detector: &str, metres: f64) -> DetectorDistance {
        DetectorDistance {
            road_toid: road.to_string(),
            detector_n: detector.to_string(),
            distance_m: metres,
        }
    }

    #[test]
    fn weights_scale_with_distance_and_sum_to_one() {
        let matches = assign_weights(vec![
            distance("road-1", "N04/001", 10.0),
            distance("road-1", "N04/002", 30.0),
        ]);

        assert_eq!(matches.len(), 2);
        assert!((matches[0].weight - 0.25).abs() < 1e-12);
        assert!((matches[1].weight - 0.75).abs() < 1e-12);

        let total: f64 = matches.iter().map(|m| m.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_distance_sum_writes_zero_weights() {
        let matches = assign_weights(vec![
            distance("road-1", "N04/001", 0.0),
            distance("road-1", "N04/002", 0.0),
        ]);

        assert!(matches.iter().all(|m| m.weight == 0.0));
    }

    #[test]
    fn weights_are_assigned_per_road() {
        let matches = assign_weights(vec![
            distance("road-2", "N04/003", 50.0),
            distance("road-1", "N04/001", 10.0),
            distance("road-2", "N04/004", 50.0),
        ]);

        // Grouped by road, roads in order.
        assert_eq!(matches[0].road_toid, "road-1");
        assert!((matches[0].weight - 1.0).abs() < 1e-12);
        assert!((matches[1].weight - 0.5).abs() < 1e-12);
        assert!((matches[2].weight - 0.5).abs() < 1e-12);
    }

    #[test]
    fn match_rows_align_with_the_table_layout() {
        let row = road_match_row(&RoadMatch {
            road_toid: "road-1".to_string(),
            detector_n: "N04/001".to_string(),
            distance_m: 12.5,
            weight: 1.0,
        });

        assert_eq!(row.len(), tables::SCOOT_ROAD_MATCH.params_per_row());
        assert_eq!(row[0], DatabaseValue::String("road-1".to_string()));
        assert_eq!(row[3], DatabaseValue::Real64(1.0));
    }

    #[test]
    fn summary_reads_like_a_log_line() {
        let summary = RoadMappingSummary {
            colocated_roads: 120,
            backfilled_roads: 4_480,
            matches_written: 22_520,
        };

        assert_eq!(
            summary.to_string(),
            "120 roads with own detectors, 4480 borrowing nearest, 22520 matches written"
        );
    }
}
