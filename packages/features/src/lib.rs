#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Buffered feature extraction for interest points.
//!
//! Static features aggregate map layers (roads, buildings, canyons) inside
//! concentric buffers around each interest point. Dynamic features do the
//! same per hour against traffic readings joined onto the road network.
//! Availability queries report which (point, feature) combinations are
//! already materialised so runs only compute what is missing.

use std::time::Instant;

use airmap_database::{DbError, DbPool};
use airmap_database_models::TimeWindow;
use airmap_feature_models::{DynamicFeatureName, FeatureSource, Source, StaticFeatureName};

pub mod availability;
pub mod extract;
mod sql;

/// Number of interest points processed per transaction.
pub const FEATURE_BATCH_SIZE: usize = 250;

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),
    #[error("Data conversion error: {message}")]
    Conversion { message: String },
    #[error(transparent)]
    Timestamp(#[from] availability::TimestampError),
    #[error("{feature_source} has no static features")]
    NotStatic { feature_source: FeatureSource },
}

/// Which interest points a run recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMethod {
    /// Only points whose rows are absent from the feature table.
    Missing,
    /// Every candidate point, overwriting existing rows.
    All,
}

/// One static feature run: all features of a map layer, for all interest
/// points of the given sources.
#[derive(Debug, Clone)]
pub struct StaticFeatureJob {
    pub feature_source: FeatureSource,
    pub sources: Vec<Source>,
    pub insert_method: InsertMethod,
    pub batch_size: usize,
}

impl StaticFeatureJob {
    #[must_use]
    pub fn new(feature_source: FeatureSource, sources: Vec<Source>) -> Self {
        Self {
            feature_source,
            sources,
            insert_method: InsertMethod::Missing,
            batch_size: FEATURE_BATCH_SIZE,
        }
    }
}

/// One dynamic feature run: traffic aggregates on the road network inside
/// buffers, per hour of the window.
#[derive(Debug, Clone)]
pub struct RoadFeatureJob {
    pub sources: Vec<Source>,
    pub window: TimeWindow,
    pub insert_method: InsertMethod,
    pub batch_size: usize,
}

impl RoadFeatureJob {
    #[must_use]
    pub fn new(sources: Vec<Source>, window: TimeWindow) -> Self {
        Self {
            sources,
            window,
            insert_method: InsertMethod::Missing,
            batch_size: FEATURE_BATCH_SIZE,
        }
    }
}

/// Computes every static feature of the job's map layer.
///
/// Returns the number of feature rows written.
///
/// # Errors
///
/// * If the feature source is a dynamic one
/// * If the database connection fails or a query fails
pub async fn update_static_features(
    pool: &DbPool,
    job: &StaticFeatureJob,
) -> Result<u64, FeatureError> {
    if job.feature_source.is_dynamic() {
        return Err(FeatureError::NotStatic {
            feature_source: job.feature_source,
        });
    }

    let mut written = 0;

    for feature in StaticFeatureName::for_source(job.feature_source) {
        written += update_one_static_feature(pool, job, feature).await?;
    }

    Ok(written)
}

async fn update_one_static_feature(
    pool: &DbPool,
    job: &StaticFeatureJob,
    feature: StaticFeatureName,
) -> Result<u64, FeatureError> {
    let start = Instant::now();
    let missing_only = job.insert_method == InsertMethod::Missing;
    let point_ids =
        availability::static_point_ids(pool.db(), feature, &job.sources, missing_only).await?;

    if point_ids.is_empty() {
        log::info!("{feature} is up to date");
        return Ok(0);
    }

    let batch_count = point_ids.len().div_ceil(job.batch_size);

    log::info!(
        "{feature}: {} points in {batch_count} batches",
        point_ids.len(),
    );

    let mut written = 0;

    for (index, batch) in point_ids.chunks(job.batch_size).enumerate() {
        let session = pool.open_session().await?;

        match extract::insert_static_features(session.db(), feature, batch).await {
            Ok(rows) => {
                session.commit().await?;
                written += rows;
                log::debug!("{feature}: batch {}/{batch_count} wrote {rows} rows", index + 1);
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    log::error!("Failed to roll back feature batch: {rollback_err:?}");
                }
                return Err(err);
            }
        }
    }

    log::info!("{feature}: wrote {written} rows in {:?}", start.elapsed());

    Ok(written)
}

/// Computes every dynamic road feature over the job's time window.
///
/// Returns the number of feature rows written.
///
/// # Errors
///
/// * If the database connection fails or a query fails
pub async fn update_road_features(
    pool: &DbPool,
    job: &RoadFeatureJob,
) -> Result<u64, FeatureError> {
    let mut written = 0;

    for feature in DynamicFeatureName::all() {
        written += update_one_road_feature(pool, job, *feature).await?;
    }

    Ok(written)
}

async fn update_one_road_feature(
    pool: &DbPool,
    job: &RoadFeatureJob,
    feature: DynamicFeatureName,
) -> Result<u64, FeatureError> {
    let start = Instant::now();
    let missing_only = job.insert_method == InsertMethod::Missing;
    let point_ids = availability::dynamic_point_ids(
        pool.db(),
        &[feature],
        &job.sources,
        job.window,
        missing_only,
    )
    .await?;

    if point_ids.is_empty() {
        log::info!("{feature} is up to date for {}", job.window);
        return Ok(0);
    }

    let batch_count = point_ids.len().div_ceil(job.batch_size);

    log::info!(
        "{feature}: {} points x {} hours in {batch_count} batches",
        point_ids.len(),
        job.window.num_hours(),
    );

    let mut written = 0;

    for (index, batch) in point_ids.chunks(job.batch_size).enumerate() {
        let session = pool.open_session().await?;

        match extract::insert_dynamic_features(session.db(), feature, batch, job.window).await {
            Ok(rows) => {
                session.commit().await?;
                written += rows;
                log::debug!("{feature}: batch {}/{batch_count} wrote {rows} rows", index + 1);
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    log::error!("Failed to roll back feature batch: {rollback_err:?}");
                }
                return Err(err);
            }
        }
    }

    log::info!("{feature}: wrote {written} rows in {:?}", start.elapsed());

    Ok(written)
}
