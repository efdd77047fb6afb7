#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! SCOOT traffic detector integration.
//!
//! Two jobs live here. [`roads`] matches every road link to the detectors
//! whose values it should aggregate, co-located where possible and
//! nearest-by-distance otherwise. [`features`] computes the dynamic traffic
//! features straight from detector readings (or forecasts) for interest
//! points, escalating the number of consulted detectors until the time
//! window is covered.

use airmap_database::DbError;

pub mod features;
pub mod roads;

#[derive(Debug, thiserror::Error)]
pub enum ScootError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),
    #[error(transparent)]
    Feature(#[from] airmap_features::FeatureError),
    #[error("Data conversion error: {message}")]
    Conversion { message: String },
}
