//! Nearest-detector dynamic features.
//!
//! The buffered road path needs per-road traffic aggregates that may not be
//! materialised for the requested window. This path goes straight to the
//! detectors instead: each interest point consults its N nearest detectors
//! and aggregates their hourly values, writing the same aggregate into all
//! five radius columns. Hours none of the N detectors cover stay absent,
//! so the driver re-checks availability after each round and escalates N
//! until the window is covered or the ceiling is reached. Running out of
//! detectors is a reported outcome, not an error.

use std::fmt::Write as _;
use std::time::Instant;

use airmap_database::DbPool;
use airmap_database::writer::{self, OnConflict, RecordSource};
use airmap_database_models::{TimeWindow, tables};
use airmap_feature_models::{Aggregate, BufferSize, DynamicFeatureName, FeatureSource, Source};
use airmap_features::{FEATURE_BATCH_SIZE, InsertMethod, availability};
use switchy_database::{Database, DatabaseValue};
use uuid::Uuid;

use crate::ScootError;

/// Detector count of the first probing round.
pub const ESCALATION_START: u32 = 5;
/// Detectors added after an uncovered round.
pub const ESCALATION_STEP: u32 = 5;
/// Largest detector count probed before giving up.
pub const ESCALATION_CEILING: u32 = 50;

/// Where detector values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSource {
    /// Observed readings (`scoot_reading`).
    Readings,
    /// Forecasted values (`scoot_forecast`), keeping only the most recent
    /// forecast per detector hour.
    Forecasts,
}

/// Terminal state of an escalation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Every expected (point, hour, feature) combination is stored.
    Resolved {
        /// Detector count of the round that completed coverage, or the
        /// starting count when nothing was missing to begin with.
        n_detectors: u32,
    },
    /// The ceiling was probed and combinations are still missing.
    Exhausted {
        /// Points still missing at least one combination.
        unresolved_points: usize,
    },
}

/// Escalation state between rounds. `advance` consumes the unresolved
/// point count observed after probing and decides whether to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscalationState {
    Probing { n_detectors: u32 },
    Done(EscalationOutcome),
}

impl EscalationState {
    const fn advance(self, unresolved_points: usize) -> Self {
        match self {
            Self::Probing { n_detectors } => {
                if unresolved_points == 0 {
                    Self::Done(EscalationOutcome::Resolved { n_detectors })
                } else if n_detectors >= ESCALATION_CEILING {
                    Self::Done(EscalationOutcome::Exhausted { unresolved_points })
                } else {
                    Self::Probing {
                        n_detectors: n_detectors + ESCALATION_STEP,
                    }
                }
            }
            Self::Done(_) => self,
        }
    }
}

/// One escalation run over a window.
#[derive(Debug, Clone)]
pub struct DetectorFeatureJob {
    pub sources: Vec<Source>,
    pub window: TimeWindow,
    pub detector_source: DetectorSource,
    pub insert_method: InsertMethod,
    pub batch_size: usize,
}

impl DetectorFeatureJob {
    #[must_use]
    pub fn new(sources: Vec<Source>, window: TimeWindow) -> Self {
        Self {
            sources,
            window,
            detector_source: DetectorSource::Readings,
            insert_method: InsertMethod::Missing,
            batch_size: FEATURE_BATCH_SIZE,
        }
    }
}

const fn aggregate_fn(aggregate: Aggregate) -> &'static str {
    match aggregate {
        Aggregate::Max => "MAX",
        Aggregate::Min => "MIN",
        Aggregate::Avg => "AVG",
        Aggregate::SumLength | Aggregate::SumArea => "SUM",
    }
}

/// Builds the select feeding `dynamic_feature` from detector data, with
/// columns in [`tables::DYNAMIC_FEATURE`] order. One row per (point, hour)
/// that at least one of the N nearest detectors covers.
fn build_detector_select(
    feature: DynamicFeatureName,
    point_ids: &[Uuid],
    window: TimeWindow,
    detector_source: DetectorSource,
    n_detectors: u32,
) -> (String, Vec<DatabaseValue>) {
    let aggregate = aggregate_fn(feature.aggregate());
    let column = feature.value_column();

    // $1 feature name, $2 feature source, $3 detector count, $4 window
    // start, $5 window end, then point ids.
    let mut points = String::new();
    for (offset, _) in point_ids.iter().enumerate() {
        if offset > 0 {
            points.push_str(", ");
        }
        write!(points, "${}::uuid", 6 + offset).unwrap();
    }

    let readings = match detector_source {
        DetectorSource::Readings => "scoot_reading".to_string(),
        DetectorSource::Forecasts => String::from(
            "(
                 SELECT DISTINCT ON (detector_id, measurement_start_utc)
                        detector_id, measurement_start_utc,
                        n_vehicles_in_interval, occupancy_percentage,
                        congestion_percentage, saturation_percentage
                 FROM scoot_forecast
                 WHERE measurement_start_utc >= $4
                   AND measurement_start_utc < $5
                 ORDER BY detector_id, measurement_start_utc, forecasted_on DESC
             )",
        ),
    };

    let mut value_columns = String::new();
    for buffer in BufferSize::ALL_DESCENDING {
        write!(
            value_columns,
            ",
                COALESCE({aggregate}(r.{column}), 0.0) AS {}",
            buffer.column()
        )
        .unwrap();
    }

    let statement = format!(
        "WITH points AS (
             SELECT ip.id, ip.location
             FROM interest_point ip
             WHERE ip.id IN ({points})
         ),
         nearest AS (
             SELECT p.id AS point_id, d.detector_n
             FROM points p
             CROSS JOIN LATERAL (
                 SELECT det.detector_n
                 FROM scoot_detector det
                 JOIN interest_point dip ON dip.id = det.point_id
                 ORDER BY dip.location <-> p.location
                 LIMIT $3
             ) d
         )
         SELECT n.point_id,
                r.measurement_start_utc,
                $1,
                $2{value_columns}
         FROM nearest n
         JOIN {readings} r ON r.detector_id = n.detector_n
         WHERE r.measurement_start_utc >= $4
           AND r.measurement_start_utc < $5
         GROUP BY n.point_id, r.measurement_start_utc"
    );

    let mut params = Vec::with_capacity(5 + point_ids.len());
    params.push(DatabaseValue::String(feature.to_string()));
    params.push(DatabaseValue::String(FeatureSource::Scoot.to_string()));
    params.push(DatabaseValue::Int64(i64::from(n_detectors)));
    params.push(DatabaseValue::DateTime(window.start.naive_utc()));
    params.push(DatabaseValue::DateTime(window.end.naive_utc()));
    for point_id in point_ids {
        params.push(DatabaseValue::String(point_id.to_string()));
    }

    (statement, params)
}

async fn insert_batch(
    db: &dyn Database,
    job: &DetectorFeatureJob,
    batch: &[Uuid],
    n_detectors: u32,
) -> Result<u64, ScootError> {
    let mut written = 0;

    for feature in DynamicFeatureName::all() {
        let (sql, params) = build_detector_select(
            *feature,
            batch,
            job.window,
            job.detector_source,
            n_detectors,
        );

        written += writer::commit_records(
            db,
            RecordSource::Query { sql, params },
            &tables::DYNAMIC_FEATURE,
            OnConflict::Overwrite,
        )
        .await?;
    }

    Ok(written)
}

async fn probe_round(
    pool: &DbPool,
    job: &DetectorFeatureJob,
    targets: &[Uuid],
    n_detectors: u32,
) -> Result<(), ScootError> {
    let batch_count = targets.len().div_ceil(job.batch_size);

    for (index, batch) in targets.chunks(job.batch_size).enumerate() {
        let session = pool.open_session().await?;

        match insert_batch(session.db(), job, batch, n_detectors).await {
            Ok(rows) => {
                session.commit().await?;
                log::debug!(
                    "detector batch {}/{batch_count} wrote {rows} rows at {n_detectors} detectors",
                    index + 1,
                );
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    log::error!("Failed to roll back detector batch: {rollback_err:?}");
                }
                return Err(err);
            }
        }
    }

    Ok(())
}

/// Computes all dynamic traffic features from detector data over the job's
/// window, escalating the consulted detector count until the window is
/// covered or [`ESCALATION_CEILING`] has been probed.
///
/// # Errors
///
/// Returns [`ScootError`] if a query or write fails. An uncovered window
/// at the ceiling is not an error; it comes back as
/// [`EscalationOutcome::Exhausted`].
pub async fn update_detector_features(
    pool: &DbPool,
    job: &DetectorFeatureJob,
) -> Result<EscalationOutcome, ScootError> {
    let features = DynamicFeatureName::all();
    let start = Instant::now();

    // An `All` run recomputes every candidate point in its first round;
    // re-checks always target what is still missing.
    let missing_only = job.insert_method == InsertMethod::Missing;
    let mut targets = availability::dynamic_point_ids(
        pool.db(),
        features,
        &job.sources,
        job.window,
        missing_only,
    )
    .await?;

    let mut state = EscalationState::Probing {
        n_detectors: ESCALATION_START,
    };

    let outcome = loop {
        match state {
            EscalationState::Done(outcome) => break outcome,
            EscalationState::Probing { n_detectors } => {
                if targets.is_empty() {
                    break EscalationOutcome::Resolved { n_detectors };
                }

                log::info!(
                    "{} points unresolved for {}; probing {n_detectors} nearest detectors",
                    targets.len(),
                    job.window,
                );

                probe_round(pool, job, &targets, n_detectors).await?;

                targets = availability::dynamic_point_ids(
                    pool.db(),
                    features,
                    &job.sources,
                    job.window,
                    true,
                )
                .await?;

                state = state.advance(targets.len());
            }
        }
    };

    match outcome {
        EscalationOutcome::Resolved { n_detectors } => {
            log::info!(
                "window {} covered at {n_detectors} detectors in {:?}",
                job.window,
                start.elapsed(),
            );
        }
        EscalationOutcome::Exhausted { unresolved_points } => {
            log::warn!(
                "{unresolved_points} points still unresolved for {} after probing \
                 {ESCALATION_CEILING} detectors",
                job.window,
            );
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};

    use super::*;

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 3, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn max_placeholder(sql: &str) -> usize {
        let mut max = 0;
        for (at, _) in sql.match_indices('$') {
            let digits: String = sql[at + 1..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if let Ok(index) = digits.parse::<usize>() {
                max = max.max(index);
            }
        }
        max
    }

    #[test]
    fn escalation_steps_from_start_to_ceiling() {
        let mut state = EscalationState::Probing {
            n_detectors: ESCALATION_START,
        };
        let mut probed = Vec::new();

        while let EscalationState::Probing { n_detectors } = state {
            probed.push(n_detectors);
            state = state.advance(7);
        }

        assert_eq!(probed, vec![5, 10, 15, 20, 25, 30, 35, 40, 45, 50]);
        assert_eq!(
            state,
            EscalationState::Done(EscalationOutcome::Exhausted {
                unresolved_points: 7
            })
        );
    }

    #[test]
    fn escalation_resolves_as_soon_as_nothing_is_missing() {
        let state = EscalationState::Probing { n_detectors: 15 };
        assert_eq!(
            state.advance(0),
            EscalationState::Done(EscalationOutcome::Resolved { n_detectors: 15 })
        );
    }

    #[test]
    fn finished_escalations_stay_finished() {
        let done = EscalationState::Done(EscalationOutcome::Resolved { n_detectors: 10 });
        assert_eq!(done.advance(3), done);
    }

    #[test]
    fn reading_features_consult_the_n_nearest_detectors() {
        let point_ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let (sql, params) = build_detector_select(
            DynamicFeatureName::MaxNVehicles,
            &point_ids,
            window(),
            DetectorSource::Readings,
            ESCALATION_START,
        );

        assert!(sql.contains("ip.id IN ($6::uuid, $7::uuid)"));
        assert!(sql.contains("ORDER BY dip.location <-> p.location"));
        assert!(sql.contains("LIMIT $3"));
        assert!(sql.contains("JOIN scoot_reading r ON r.detector_id = n.detector_n"));
        assert!(sql.contains("GROUP BY n.point_id, r.measurement_start_utc"));

        assert_eq!(params[0], DatabaseValue::String("max_n_vehicles".to_string()));
        assert_eq!(params[1], DatabaseValue::String("scoot".to_string()));
        assert_eq!(params[2], DatabaseValue::Int64(5));
        assert!(matches!(params[3], DatabaseValue::DateTime(_)));
        assert_eq!(max_placeholder(&sql), params.len());
    }

    #[test]
    fn the_aggregate_is_replicated_across_all_five_columns() {
        let point_ids = vec![Uuid::new_v4()];
        let (sql, _) = build_detector_select(
            DynamicFeatureName::AvgOccupancyPercentage,
            &point_ids,
            window(),
            DetectorSource::Readings,
            10,
        );

        let expression = "COALESCE(AVG(r.occupancy_percentage), 0.0)";
        assert_eq!(sql.matches(expression).count(), 5);
        for buffer in BufferSize::ALL_DESCENDING {
            assert!(sql.contains(&format!("{expression} AS {}", buffer.column())));
        }
    }

    #[test]
    fn forecast_features_keep_only_the_latest_forecast_per_hour() {
        let point_ids = vec![Uuid::new_v4()];
        let (sql, params) = build_detector_select(
            DynamicFeatureName::MaxSaturationPercentage,
            &point_ids,
            window(),
            DetectorSource::Forecasts,
            20,
        );

        assert!(sql.contains("SELECT DISTINCT ON (detector_id, measurement_start_utc)"));
        assert!(sql.contains("ORDER BY detector_id, measurement_start_utc, forecasted_on DESC"));
        assert!(!sql.contains("JOIN scoot_reading"));
        assert_eq!(max_placeholder(&sql), params.len());
    }

    #[test]
    fn default_jobs_read_observations_for_missing_points() {
        let job = DetectorFeatureJob::new(vec![Source::Laqn], window());
        assert_eq!(job.detector_source, DetectorSource::Readings);
        assert_eq!(job.insert_method, InsertMethod::Missing);
        assert_eq!(job.batch_size, FEATURE_BATCH_SIZE);
    }
}
