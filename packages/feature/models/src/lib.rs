#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Feature taxonomy and shared vocabularies for the airmap pipeline.
//!
//! Every feature the platform can compute is declared here with its source
//! layer, aggregate function, value column and row filters. The query
//! builders consume these definitions instead of free-form strings, so a
//! misspelled feature or column name fails to compile rather than surfacing
//! as a broken SQL fragment at run time.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Origin of an interest point.
///
/// Stored verbatim in the `source` column of `interest_point`, so the
/// serialized forms are part of the database contract.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Source {
    /// London Air Quality Network monitoring sites.
    Laqn,
    /// Air Quality England monitoring sites.
    Aqe,
    /// SCOOT traffic detectors.
    Scoot,
    /// Regular 100 m modelling grid.
    #[serde(rename = "grid_100")]
    #[strum(serialize = "grid_100")]
    Grid100,
    /// Hexagonal modelling grid.
    Hexgrid,
    /// Satellite observation grid squares.
    Satellite,
    /// Breathe London sensor sites.
    Breathe,
}

impl Source {
    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Laqn,
            Self::Aqe,
            Self::Scoot,
            Self::Grid100,
            Self::Hexgrid,
            Self::Satellite,
            Self::Breathe,
        ]
    }
}

/// Pollutant species modelled by the platform.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Species {
    /// Nitrogen dioxide.
    No2,
    /// Particulate matter under 2.5 µm.
    Pm25,
    /// Particulate matter under 10 µm.
    Pm10,
    /// Ozone.
    O3,
}

/// Data layer a feature is computed from.
///
/// Stored verbatim in the `feature_source` column of the feature tables.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeatureSource {
    /// UKMap land-use and building polygons.
    Ukmap,
    /// OS Highways road links.
    Oshighway,
    /// Street canyon segments.
    StreetCanyon,
    /// Hourly per-road SCOOT traffic values (buffered dynamic path).
    ScootRoads,
    /// SCOOT detector readings matched to interest points (nearest-detector
    /// dynamic path).
    Scoot,
}

impl FeatureSource {
    /// Whether features from this source vary by hour.
    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        matches!(self, Self::ScootRoads | Self::Scoot)
    }

    /// The static map layers, in processing order.
    #[must_use]
    pub const fn static_sources() -> &'static [Self] {
        &[Self::Ukmap, Self::Oshighway, Self::StreetCanyon]
    }
}

/// Whether a feature aggregates clipped geometries or a numeric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Aggregate of geometry clipped to each buffer (length or area).
    Geometry,
    /// Aggregate of a numeric column over rows intersecting each buffer.
    Value,
}

/// Aggregate applied within each buffer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Aggregate {
    /// Total metre length of clipped line geometry.
    SumLength,
    /// Total square-metre area of clipped polygon geometry.
    SumArea,
    /// Maximum of the value column.
    Max,
    /// Minimum of the value column.
    Min,
    /// Mean of the value column.
    Avg,
}

impl Aggregate {
    /// The feature kind this aggregate implies.
    #[must_use]
    pub const fn kind(self) -> FeatureKind {
        match self {
            Self::SumLength | Self::SumArea => FeatureKind::Geometry,
            Self::Max | Self::Min | Self::Avg => FeatureKind::Value,
        }
    }
}

/// A column of a feature source table that a feature may aggregate or
/// filter on.
///
/// The `Display` form is the database column name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SourceColumn {
    /// UKMap feature classification (Museum, Vegetated, Water, Building...).
    FeatureType,
    /// UKMap land-use classification.
    Landuse,
    /// UKMap building height in metres; `999.9` is the unknown sentinel.
    CalculatedHeightOfBuilding,
    /// OS Highways road classification (A Road, B Road Primary...).
    RouteHierarchy,
    /// Mean height-to-width ratio of a street canyon segment.
    RatioAvg,
    /// Narrowest width of a street canyon segment, in metres.
    MinWidth,
    /// Vehicles counted by a SCOOT detector in one interval.
    NVehiclesInInterval,
    /// SCOOT occupancy percentage.
    OccupancyPercentage,
    /// SCOOT congestion percentage.
    CongestionPercentage,
    /// SCOOT saturation percentage.
    SaturationPercentage,
}

impl SourceColumn {
    /// Whether this column exists on the given source layer.
    #[must_use]
    pub const fn belongs_to(self, source: FeatureSource) -> bool {
        match self {
            Self::FeatureType | Self::Landuse | Self::CalculatedHeightOfBuilding => {
                matches!(source, FeatureSource::Ukmap)
            }
            Self::RouteHierarchy => matches!(source, FeatureSource::Oshighway),
            Self::RatioAvg | Self::MinWidth => matches!(source, FeatureSource::StreetCanyon),
            Self::NVehiclesInInterval
            | Self::OccupancyPercentage
            | Self::CongestionPercentage
            | Self::SaturationPercentage => {
                matches!(source, FeatureSource::Scoot | FeatureSource::ScootRoads)
            }
        }
    }
}

/// One of the five fixed buffer radii, in metres.
///
/// The set is ordered descending and baked into the `value_*` column names
/// of the feature tables, so changing it is a schema migration rather than
/// a configuration change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BufferSize {
    /// 1000 m radius.
    M1000,
    /// 500 m radius.
    M500,
    /// 200 m radius.
    M200,
    /// 100 m radius.
    M100,
    /// 10 m radius.
    M10,
}

impl BufferSize {
    /// All buffer radii, largest first. Query builders rely on this order
    /// when cascading geometry clips from one radius to the next.
    pub const ALL_DESCENDING: [Self; 5] =
        [Self::M1000, Self::M500, Self::M200, Self::M100, Self::M10];

    /// Radius in metres.
    #[must_use]
    pub const fn metres(self) -> u32 {
        match self {
            Self::M1000 => 1000,
            Self::M500 => 500,
            Self::M200 => 200,
            Self::M100 => 100,
            Self::M10 => 10,
        }
    }

    /// Feature table column holding this radius's aggregate.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::M1000 => "value_1000",
            Self::M500 => "value_500",
            Self::M200 => "value_200",
            Self::M100 => "value_100",
            Self::M10 => "value_10",
        }
    }

    /// Creates a buffer size from a radius in metres.
    ///
    /// # Errors
    ///
    /// Returns an error if the radius is not one of the five fixed values.
    pub const fn from_metres(metres: u32) -> Result<Self, InvalidBufferError> {
        match metres {
            1000 => Ok(Self::M1000),
            500 => Ok(Self::M500),
            200 => Ok(Self::M200),
            100 => Ok(Self::M100),
            10 => Ok(Self::M10),
            _ => Err(InvalidBufferError { metres }),
        }
    }
}

/// Error returned when a radius does not match one of the five fixed
/// buffer sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidBufferError {
    /// The radius that was requested.
    pub metres: u32,
}

impl std::fmt::Display for InvalidBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid buffer radius {} m: expected one of 1000, 500, 200, 100, 10",
            self.metres
        )
    }
}

impl std::error::Error for InvalidBufferError {}

/// A row filter applied to a source table before aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnFilter {
    /// Keep rows where the column equals the given string.
    Equals(SourceColumn, &'static str),
    /// Keep rows where the column matches any of the given strings.
    OneOf(SourceColumn, &'static [&'static str]),
    /// Keep rows where the numeric column is strictly below the bound.
    Below(SourceColumn, f64),
}

impl ColumnFilter {
    /// The column this filter constrains.
    #[must_use]
    pub const fn column(self) -> SourceColumn {
        match self {
            Self::Equals(column, _) | Self::OneOf(column, _) | Self::Below(column, _) => column,
        }
    }
}

/// Everything the query builder needs to compute one feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureDefinition {
    /// Source layer the feature reads.
    pub source: FeatureSource,
    /// Aggregate applied within each buffer.
    pub aggregate: Aggregate,
    /// Column the aggregate runs over; `None` for geometry aggregates.
    pub value_column: Option<SourceColumn>,
    /// Row filters applied to the source before aggregation.
    pub filters: &'static [ColumnFilter],
}

impl FeatureDefinition {
    /// Whether this is a geometry or value feature.
    #[must_use]
    pub const fn kind(&self) -> FeatureKind {
        self.aggregate.kind()
    }
}

/// Static (time-invariant) features computed from the land-use and road
/// network layers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StaticFeatureName {
    // ── OS Highways ─────────────────────────────────────
    /// Total road length, all classifications.
    TotalRoadLength,
    /// Total length of primary A roads.
    TotalARoadPrimaryLength,
    /// Total length of A roads.
    TotalARoadLength,
    /// Total length of B roads (primary and secondary).
    TotalBRoadLength,
    /// Total length of every road link, unfiltered.
    TotalLength,

    // ── Street canyons ──────────────────────────────────
    /// Smallest mean canyon ratio.
    MinCanyonRatio,
    /// Mean of mean canyon ratios.
    AvgCanyonRatio,
    /// Largest mean canyon ratio.
    MaxCanyonRatio,
    /// Smallest canyon narrowest-width.
    MinCanyonNarrowest,
    /// Mean canyon narrowest-width.
    AvgCanyonNarrowest,
    /// Largest canyon narrowest-width.
    MaxCanyonNarrowest,

    // ── UKMap ───────────────────────────────────────────
    /// Total museum footprint area.
    TotalMuseumArea,
    /// Total hospital land-use area.
    TotalHospitalArea,
    /// Total vegetated area.
    TotalGrassArea,
    /// Total recreational open space that is vegetated.
    TotalParkArea,
    /// Total water area.
    TotalWaterArea,
    /// Total vegetated or water area.
    TotalFlatArea,
    /// Tallest building, excluding the `999.9` unknown-height sentinel.
    BuildingHeight,
}

impl StaticFeatureName {
    /// The registry entry for this feature.
    #[must_use]
    pub const fn definition(self) -> FeatureDefinition {
        match self {
            Self::TotalRoadLength | Self::TotalLength => FeatureDefinition {
                source: FeatureSource::Oshighway,
                aggregate: Aggregate::SumLength,
                value_column: None,
                filters: &[],
            },
            Self::TotalARoadPrimaryLength => FeatureDefinition {
                source: FeatureSource::Oshighway,
                aggregate: Aggregate::SumLength,
                value_column: None,
                filters: &[ColumnFilter::Equals(
                    SourceColumn::RouteHierarchy,
                    "A Road Primary",
                )],
            },
            Self::TotalARoadLength => FeatureDefinition {
                source: FeatureSource::Oshighway,
                aggregate: Aggregate::SumLength,
                value_column: None,
                filters: &[ColumnFilter::Equals(SourceColumn::RouteHierarchy, "A Road")],
            },
            Self::TotalBRoadLength => FeatureDefinition {
                source: FeatureSource::Oshighway,
                aggregate: Aggregate::SumLength,
                value_column: None,
                filters: &[ColumnFilter::OneOf(
                    SourceColumn::RouteHierarchy,
                    &["B Road", "B Road Primary"],
                )],
            },
            Self::MinCanyonRatio => FeatureDefinition {
                source: FeatureSource::StreetCanyon,
                aggregate: Aggregate::Min,
                value_column: Some(SourceColumn::RatioAvg),
                filters: &[],
            },
            Self::AvgCanyonRatio => FeatureDefinition {
                source: FeatureSource::StreetCanyon,
                aggregate: Aggregate::Avg,
                value_column: Some(SourceColumn::RatioAvg),
                filters: &[],
            },
            Self::MaxCanyonRatio => FeatureDefinition {
                source: FeatureSource::StreetCanyon,
                aggregate: Aggregate::Max,
                value_column: Some(SourceColumn::RatioAvg),
                filters: &[],
            },
            Self::MinCanyonNarrowest => FeatureDefinition {
                source: FeatureSource::StreetCanyon,
                aggregate: Aggregate::Min,
                value_column: Some(SourceColumn::MinWidth),
                filters: &[],
            },
            Self::AvgCanyonNarrowest => FeatureDefinition {
                source: FeatureSource::StreetCanyon,
                aggregate: Aggregate::Avg,
                value_column: Some(SourceColumn::MinWidth),
                filters: &[],
            },
            Self::MaxCanyonNarrowest => FeatureDefinition {
                source: FeatureSource::StreetCanyon,
                aggregate: Aggregate::Max,
                value_column: Some(SourceColumn::MinWidth),
                filters: &[],
            },
            Self::TotalMuseumArea => FeatureDefinition {
                source: FeatureSource::Ukmap,
                aggregate: Aggregate::SumArea,
                value_column: None,
                filters: &[ColumnFilter::Equals(SourceColumn::FeatureType, "Museum")],
            },
            Self::TotalHospitalArea => FeatureDefinition {
                source: FeatureSource::Ukmap,
                aggregate: Aggregate::SumArea,
                value_column: None,
                filters: &[ColumnFilter::Equals(SourceColumn::Landuse, "Hospitals")],
            },
            Self::TotalGrassArea => FeatureDefinition {
                source: FeatureSource::Ukmap,
                aggregate: Aggregate::SumArea,
                value_column: None,
                filters: &[ColumnFilter::Equals(SourceColumn::FeatureType, "Vegetated")],
            },
            Self::TotalParkArea => FeatureDefinition {
                source: FeatureSource::Ukmap,
                aggregate: Aggregate::SumArea,
                value_column: None,
                filters: &[
                    ColumnFilter::Equals(SourceColumn::FeatureType, "Vegetated"),
                    ColumnFilter::Equals(SourceColumn::Landuse, "Recreational open space"),
                ],
            },
            Self::TotalWaterArea => FeatureDefinition {
                source: FeatureSource::Ukmap,
                aggregate: Aggregate::SumArea,
                value_column: None,
                filters: &[ColumnFilter::Equals(SourceColumn::FeatureType, "Water")],
            },
            Self::TotalFlatArea => FeatureDefinition {
                source: FeatureSource::Ukmap,
                aggregate: Aggregate::SumArea,
                value_column: None,
                filters: &[ColumnFilter::OneOf(
                    SourceColumn::FeatureType,
                    &["Vegetated", "Water"],
                )],
            },
            Self::BuildingHeight => FeatureDefinition {
                source: FeatureSource::Ukmap,
                aggregate: Aggregate::Max,
                value_column: Some(SourceColumn::CalculatedHeightOfBuilding),
                filters: &[
                    ColumnFilter::Equals(SourceColumn::FeatureType, "Building"),
                    ColumnFilter::Below(SourceColumn::CalculatedHeightOfBuilding, 999.9),
                ],
            },
        }
    }

    /// Source layer this feature reads.
    #[must_use]
    pub const fn source(self) -> FeatureSource {
        self.definition().source
    }

    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::TotalRoadLength,
            Self::TotalARoadPrimaryLength,
            Self::TotalARoadLength,
            Self::TotalBRoadLength,
            Self::TotalLength,
            Self::MinCanyonRatio,
            Self::AvgCanyonRatio,
            Self::MaxCanyonRatio,
            Self::MinCanyonNarrowest,
            Self::AvgCanyonNarrowest,
            Self::MaxCanyonNarrowest,
            Self::TotalMuseumArea,
            Self::TotalHospitalArea,
            Self::TotalGrassArea,
            Self::TotalParkArea,
            Self::TotalWaterArea,
            Self::TotalFlatArea,
            Self::BuildingHeight,
        ]
    }

    /// Returns all features computed from the given source layer.
    #[must_use]
    pub fn for_source(source: FeatureSource) -> Vec<Self> {
        Self::all()
            .iter()
            .copied()
            .filter(|name| name.source() == source)
            .collect()
    }
}

/// Dynamic (hourly) traffic features.
///
/// The buffered path aggregates per-road SCOOT values clipped to each
/// buffer; the nearest-detector path aggregates the same columns straight
/// from detector readings and replicates the result across all five value
/// columns. Both paths write the same feature names.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DynamicFeatureName {
    /// Largest vehicle count in any interval.
    MaxNVehicles,
    /// Mean vehicle count per interval.
    AvgNVehicles,
    /// Largest occupancy percentage.
    MaxOccupancyPercentage,
    /// Mean occupancy percentage.
    AvgOccupancyPercentage,
    /// Largest congestion percentage.
    MaxCongestionPercentage,
    /// Mean congestion percentage.
    AvgCongestionPercentage,
    /// Largest saturation percentage.
    MaxSaturationPercentage,
    /// Mean saturation percentage.
    AvgSaturationPercentage,
}

impl DynamicFeatureName {
    /// Aggregate applied to the hourly values.
    #[must_use]
    pub const fn aggregate(self) -> Aggregate {
        match self {
            Self::MaxNVehicles
            | Self::MaxOccupancyPercentage
            | Self::MaxCongestionPercentage
            | Self::MaxSaturationPercentage => Aggregate::Max,
            Self::AvgNVehicles
            | Self::AvgOccupancyPercentage
            | Self::AvgCongestionPercentage
            | Self::AvgSaturationPercentage => Aggregate::Avg,
        }
    }

    /// The SCOOT reading column this feature aggregates.
    #[must_use]
    pub const fn value_column(self) -> SourceColumn {
        match self {
            Self::MaxNVehicles | Self::AvgNVehicles => SourceColumn::NVehiclesInInterval,
            Self::MaxOccupancyPercentage | Self::AvgOccupancyPercentage => {
                SourceColumn::OccupancyPercentage
            }
            Self::MaxCongestionPercentage | Self::AvgCongestionPercentage => {
                SourceColumn::CongestionPercentage
            }
            Self::MaxSaturationPercentage | Self::AvgSaturationPercentage => {
                SourceColumn::SaturationPercentage
            }
        }
    }

    /// The registry entry for this feature (buffered path).
    #[must_use]
    pub const fn definition(self) -> FeatureDefinition {
        FeatureDefinition {
            source: FeatureSource::ScootRoads,
            aggregate: self.aggregate(),
            value_column: Some(self.value_column()),
            filters: &[],
        }
    }

    /// Returns all variants of this enum.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::MaxNVehicles,
            Self::AvgNVehicles,
            Self::MaxOccupancyPercentage,
            Self::AvgOccupancyPercentage,
            Self::MaxCongestionPercentage,
            Self::AvgCongestionPercentage,
            Self::MaxSaturationPercentage,
            Self::AvgSaturationPercentage,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_descend() {
        let metres: Vec<u32> = BufferSize::ALL_DESCENDING
            .iter()
            .map(|b| b.metres())
            .collect();
        let mut sorted = metres.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(metres, sorted);
        assert_eq!(metres, vec![1000, 500, 200, 100, 10]);
    }

    #[test]
    fn buffer_from_metres_roundtrip() {
        for buffer in BufferSize::ALL_DESCENDING {
            assert_eq!(BufferSize::from_metres(buffer.metres()), Ok(buffer));
        }
        assert!(BufferSize::from_metres(0).is_err());
        assert!(BufferSize::from_metres(250).is_err());
    }

    #[test]
    fn buffer_columns_match_radii() {
        assert_eq!(BufferSize::M1000.column(), "value_1000");
        assert_eq!(BufferSize::M10.column(), "value_10");
    }

    #[test]
    fn static_registry_is_well_formed() {
        for name in StaticFeatureName::all() {
            let def = name.definition();
            match def.kind() {
                FeatureKind::Value => {
                    let column = def
                        .value_column
                        .unwrap_or_else(|| panic!("{name:?} is a value feature without a column"));
                    assert!(
                        column.belongs_to(def.source),
                        "{name:?} aggregates {column:?} which is not on {:?}",
                        def.source
                    );
                }
                FeatureKind::Geometry => {
                    assert!(
                        def.value_column.is_none(),
                        "{name:?} is a geometry feature with a value column"
                    );
                }
            }
            for filter in def.filters {
                assert!(
                    filter.column().belongs_to(def.source),
                    "{name:?} filters on {:?} which is not on {:?}",
                    filter.column(),
                    def.source
                );
            }
        }
    }

    #[test]
    fn static_sources_are_static() {
        for source in FeatureSource::static_sources() {
            assert!(!source.is_dynamic(), "{source:?} varies by hour");
        }
        assert!(FeatureSource::ScootRoads.is_dynamic());
        assert!(FeatureSource::Scoot.is_dynamic());
    }

    #[test]
    fn geometry_aggregates_match_layer_dimension() {
        for name in StaticFeatureName::all() {
            let def = name.definition();
            match def.source {
                FeatureSource::Oshighway => assert_eq!(def.aggregate, Aggregate::SumLength),
                FeatureSource::Ukmap if def.kind() == FeatureKind::Geometry => {
                    assert_eq!(def.aggregate, Aggregate::SumArea);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn dynamic_registry_is_well_formed() {
        for name in DynamicFeatureName::all() {
            let def = name.definition();
            assert_eq!(def.kind(), FeatureKind::Value);
            assert_eq!(def.source, FeatureSource::ScootRoads);
            let column = def.value_column.expect("dynamic features aggregate a column");
            assert!(column.belongs_to(def.source));
            assert!(def.filters.is_empty());
        }
    }

    #[test]
    fn building_height_excludes_sentinel() {
        let def = StaticFeatureName::BuildingHeight.definition();
        assert!(def.filters.iter().any(|filter| matches!(
            filter,
            ColumnFilter::Below(SourceColumn::CalculatedHeightOfBuilding, bound) if *bound == 999.9
        )));
    }

    #[test]
    fn names_serialize_snake_case() {
        assert_eq!(
            StaticFeatureName::TotalARoadPrimaryLength.to_string(),
            "total_a_road_primary_length"
        );
        assert_eq!(
            "max_n_vehicles".parse::<DynamicFeatureName>().unwrap(),
            DynamicFeatureName::MaxNVehicles
        );
        assert_eq!(Source::Grid100.to_string(), "grid_100");
        assert_eq!("grid_100".parse::<Source>().unwrap(), Source::Grid100);
        assert_eq!(Species::Pm25.to_string(), "PM25");
    }

    #[test]
    fn column_names_match_schema() {
        assert_eq!(
            SourceColumn::CalculatedHeightOfBuilding.to_string(),
            "calculated_height_of_building"
        );
        assert_eq!(
            SourceColumn::NVehiclesInInterval.to_string(),
            "n_vehicles_in_interval"
        );
        assert_eq!(SourceColumn::RouteHierarchy.to_string(), "route_hierarchy");
    }
}
