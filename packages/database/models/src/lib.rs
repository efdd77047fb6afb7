#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Database row types and table layouts shared across the pipeline.
//!
//! These types represent the shapes of data as stored in and retrieved from
//! the `PostGIS` database. The [`tables`] module declares each writable
//! table's column list and natural key; the bulk writer builds its
//! `INSERT ... ON CONFLICT` statements from these layouts instead of
//! reflecting over attribute names at run time.

use airmap_feature_models::DynamicFeatureName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A half-open UTC time window `[start, end)` bucketed by whole hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start of the window.
    pub start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window, rejecting empty or inverted ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidWindowError> {
        if start >= end {
            return Err(InvalidWindowError);
        }
        Ok(Self { start, end })
    }

    /// Number of whole-hour buckets in the window. The final bucket starts
    /// at `end - 1h`, so a window shorter than an hour has zero buckets.
    #[must_use]
    pub fn num_hours(&self) -> i64 {
        (self.end - self.start).num_hours()
    }

    /// Start timestamps of every hourly bucket in the window.
    #[must_use]
    pub fn hour_buckets(&self) -> Vec<DateTime<Utc>> {
        let mut buckets = Vec::new();
        let mut bucket = self.start;
        while bucket < self.end {
            buckets.push(bucket);
            bucket += chrono::Duration::hours(1);
        }
        buckets
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%dT%H:%M:%S"),
            self.end.format("%Y-%m-%dT%H:%M:%S")
        )
    }
}

/// Error returned when a time window's start is not strictly before its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidWindowError;

impl std::fmt::Display for InvalidWindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "time window start must be strictly before its end")
    }
}

impl std::error::Error for InvalidWindowError {}

/// Availability of a static feature at one interest point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointAvailability {
    /// Interest point id.
    pub point_id: Uuid,
    /// Whether a stored feature row exists for this point.
    pub has_data: bool,
}

/// Availability of one dynamic feature at one interest point for one
/// hourly bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicAvailability {
    /// Interest point id.
    pub point_id: Uuid,
    /// Start of the hourly bucket.
    pub measurement_start_utc: DateTime<Utc>,
    /// Feature the bucket was checked for.
    pub feature_name: DynamicFeatureName,
    /// Whether a stored feature row exists for this combination.
    pub has_data: bool,
}

/// Distance from a road segment's centroid to a SCOOT detector's interest
/// point, before weights are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorDistance {
    /// Road segment TOID.
    pub road_toid: String,
    /// Detector identifier.
    pub detector_n: String,
    /// Centroid-to-detector distance in metres.
    pub distance_m: f64,
}

/// A road-to-detector match with its aggregation weight, as persisted in
/// `scoot_road_match`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadMatch {
    /// Road segment TOID.
    pub road_toid: String,
    /// Detector identifier.
    pub detector_n: String,
    /// Centroid-to-detector distance in metres.
    pub distance_m: f64,
    /// Weight applied when aggregating this detector's values onto the road.
    pub weight: f64,
}

/// One writable column of a [`TableSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: &'static str,
    /// Explicit parameter cast (e.g. `uuid`, `jsonb`) for columns whose
    /// values bind as text on the wire.
    pub cast: Option<&'static str>,
}

impl ColumnDef {
    const fn plain(name: &'static str) -> Self {
        Self { name, cast: None }
    }

    const fn cast(name: &'static str, cast: &'static str) -> Self {
        Self {
            name,
            cast: Some(cast),
        }
    }
}

/// Static description of a writable table: its name, column list, and the
/// natural-key columns that conflict clauses target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name.
    pub name: &'static str,
    /// All writable columns, in insert order.
    pub columns: &'static [ColumnDef],
    /// Natural-key columns, a subset of `columns`.
    pub key_columns: &'static [&'static str],
}

impl TableSpec {
    /// Number of bind parameters one row consumes.
    #[must_use]
    pub const fn params_per_row(&self) -> usize {
        self.columns.len()
    }

    /// Whether the named column is part of the natural key.
    #[must_use]
    pub fn is_key(&self, column: &str) -> bool {
        self.key_columns.contains(&column)
    }

    /// Columns outside the natural key, in insert order. These are the
    /// columns an overwrite refreshes from `EXCLUDED`.
    pub fn non_key_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .map(|column| column.name)
            .filter(|name| !self.is_key(name))
    }
}

/// Writable table definitions.
pub mod tables {
    use super::{ColumnDef, TableSpec};

    /// Static buffered features, keyed by point and feature name.
    pub const STATIC_FEATURE: TableSpec = TableSpec {
        name: "static_feature",
        columns: &[
            ColumnDef::cast("point_id", "uuid"),
            ColumnDef::plain("feature_name"),
            ColumnDef::plain("feature_source"),
            ColumnDef::plain("value_1000"),
            ColumnDef::plain("value_500"),
            ColumnDef::plain("value_200"),
            ColumnDef::plain("value_100"),
            ColumnDef::plain("value_10"),
        ],
        key_columns: &["point_id", "feature_name"],
    };

    /// Hourly buffered features, keyed by point, hour, and feature name.
    pub const DYNAMIC_FEATURE: TableSpec = TableSpec {
        name: "dynamic_feature",
        columns: &[
            ColumnDef::cast("point_id", "uuid"),
            ColumnDef::plain("measurement_start_utc"),
            ColumnDef::plain("feature_name"),
            ColumnDef::plain("feature_source"),
            ColumnDef::plain("value_1000"),
            ColumnDef::plain("value_500"),
            ColumnDef::plain("value_200"),
            ColumnDef::plain("value_100"),
            ColumnDef::plain("value_10"),
        ],
        key_columns: &["point_id", "measurement_start_utc", "feature_name"],
    };

    /// Road-to-detector matches with aggregation weights.
    pub const SCOOT_ROAD_MATCH: TableSpec = TableSpec {
        name: "scoot_road_match",
        columns: &[
            ColumnDef::plain("road_toid"),
            ColumnDef::plain("detector_n"),
            ColumnDef::plain("distance_m"),
            ColumnDef::plain("weight"),
        ],
        key_columns: &["road_toid", "detector_n"],
    };

    /// Model definitions, keyed by name and parameter hash.
    pub const MODEL: TableSpec = TableSpec {
        name: "air_quality_model",
        columns: &[
            ColumnDef::plain("model_name"),
            ColumnDef::plain("param_id"),
            ColumnDef::cast("model_params", "jsonb"),
        ],
        key_columns: &["model_name", "param_id"],
    };

    /// Dataset configurations, keyed by content hash.
    pub const DATA: TableSpec = TableSpec {
        name: "air_quality_data",
        columns: &[
            ColumnDef::plain("data_id"),
            ColumnDef::cast("data_config", "jsonb"),
            ColumnDef::cast("preprocessing", "jsonb"),
        ],
        key_columns: &["data_id"],
    };

    /// Model-fit instances, keyed by content hash.
    pub const INSTANCE: TableSpec = TableSpec {
        name: "air_quality_instance",
        columns: &[
            ColumnDef::plain("instance_id"),
            ColumnDef::plain("tag"),
            ColumnDef::plain("git_hash"),
            ColumnDef::plain("fit_start_time"),
            ColumnDef::plain("cluster_id"),
            ColumnDef::plain("model_name"),
            ColumnDef::plain("param_id"),
            ColumnDef::plain("data_id"),
        ],
        key_columns: &["instance_id"],
    };

    /// Every writable table, for cross-checking column layouts in tests.
    pub const ALL: &[TableSpec] = &[
        STATIC_FEATURE,
        DYNAMIC_FEATURE,
        SCOOT_ROAD_MATCH,
        MODEL,
        DATA,
        INSTANCE,
    ];
}
