#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the air quality feature pipeline.

use airmap_database::{DbPool, db, run_migrations};
use airmap_feature_models::{FeatureSource, Source};
use airmap_features::{InsertMethod, RoadFeatureJob, StaticFeatureJob, availability};
use airmap_instance::{ClusterId, DataConfig, Instance, ModelName, Tag};
use airmap_scoot::features::{DetectorFeatureJob, DetectorSource};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "airmap_cli", about = "Air quality feature pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Compute static map-layer features inside interest point buffers
    StaticFeatures {
        /// Map layer to process (`ukmap`, `oshighway`, `street_canyon`).
        /// All three if not specified.
        #[arg(long)]
        layer: Option<String>,
        /// Comma-separated interest point sources (e.g. "laqn,aqe").
        /// All sources if not specified.
        #[arg(long)]
        sources: Option<String>,
        /// Recompute every point, overwriting rows that already exist
        #[arg(long)]
        force: bool,
        /// Number of interest points per transaction
        #[arg(long, default_value = "250")]
        batch_size: usize,
    },
    /// Compute hourly road-traffic features inside interest point buffers
    RoadFeatures {
        /// Window start (`YYYY-MM-DD`, ISO date-time, or RFC 3339)
        start: String,
        /// Window end, exclusive (same formats; offsets must match start)
        end: String,
        /// Comma-separated interest point sources. All if not specified.
        #[arg(long)]
        sources: Option<String>,
        /// Recompute every point, overwriting rows that already exist
        #[arg(long)]
        force: bool,
        /// Number of interest points per transaction
        #[arg(long, default_value = "250")]
        batch_size: usize,
    },
    /// Compute hourly detector features, escalating how many nearest
    /// detectors each point borrows until the window is covered
    ScootFeatures {
        /// Window start (`YYYY-MM-DD`, ISO date-time, or RFC 3339)
        start: String,
        /// Window end, exclusive (same formats; offsets must match start)
        end: String,
        /// Comma-separated interest point sources. All if not specified.
        #[arg(long)]
        sources: Option<String>,
        /// Aggregate the latest hourly forecasts instead of readings
        #[arg(long)]
        forecasts: bool,
        /// Recompute every point, overwriting rows that already exist
        #[arg(long)]
        force: bool,
        /// Number of interest points per transaction
        #[arg(long, default_value = "250")]
        batch_size: usize,
    },
    /// Match every road segment to its SCOOT detectors and assign
    /// aggregation weights
    MapRoads,
    /// Register a model fit in the experiment tables and print its id
    RegisterInstance {
        /// Model family (`svgp` or `mrdgp`)
        #[arg(long)]
        model_name: String,
        /// Path to the model parameters JSON
        #[arg(long)]
        model_params: String,
        /// Path to the data configuration JSON
        #[arg(long)]
        data_config: String,
        /// Path to the preprocessing JSON; an empty object if not specified
        #[arg(long)]
        preprocessing: Option<String>,
        /// Lifecycle tag (`test`, `validation`, `production`)
        #[arg(long, default_value = "test")]
        tag: String,
        /// Where the fit ran (`laptop`, `azure`, `kubernetes`)
        #[arg(long, default_value = "laptop")]
        cluster_id: String,
    },
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            log::info!("Running database migrations...");
            let db = db::connect_from_env().await?;
            run_migrations(db.as_ref()).await?;
            log::info!("Migrations complete.");
        }
        Commands::StaticFeatures {
            layer,
            sources,
            force,
            batch_size,
        } => {
            let pool = connect_pool().await?;
            let sources = parse_sources(sources.as_deref())?;
            let layers = match layer {
                Some(raw) => vec![parse_name::<FeatureSource>(&raw, "feature source")?],
                None => FeatureSource::static_sources().to_vec(),
            };

            for layer in layers {
                let mut job = StaticFeatureJob::new(layer, sources.clone());
                job.insert_method = insert_method(force);
                job.batch_size = batch_size;
                airmap_features::update_static_features(&pool, &job).await?;
            }
        }
        Commands::RoadFeatures {
            start,
            end,
            sources,
            force,
            batch_size,
        } => {
            let pool = connect_pool().await?;
            let window = availability::parse_time_range(&start, &end)?;

            let mut job = RoadFeatureJob::new(parse_sources(sources.as_deref())?, window);
            job.insert_method = insert_method(force);
            job.batch_size = batch_size;

            airmap_features::update_road_features(&pool, &job).await?;
        }
        Commands::ScootFeatures {
            start,
            end,
            sources,
            forecasts,
            force,
            batch_size,
        } => {
            let pool = connect_pool().await?;
            let window = availability::parse_time_range(&start, &end)?;

            let mut job = DetectorFeatureJob::new(parse_sources(sources.as_deref())?, window);
            job.detector_source = if forecasts {
                DetectorSource::Forecasts
            } else {
                DetectorSource::Readings
            };
            job.insert_method = insert_method(force);
            job.batch_size = batch_size;

            airmap_scoot::features::update_detector_features(&pool, &job).await?;
        }
        Commands::MapRoads => {
            let pool = connect_pool().await?;
            airmap_scoot::roads::map_roads_to_detectors(&pool).await?;
        }
        Commands::RegisterInstance {
            model_name,
            model_params,
            data_config,
            preprocessing,
            tag,
            cluster_id,
        } => {
            let pool = connect_pool().await?;

            let model_name = parse_name::<ModelName>(&model_name, "model name")?;
            let tag = parse_name::<Tag>(&tag, "tag")?;
            let cluster_id = parse_name::<ClusterId>(&cluster_id, "cluster id")?;

            let model_params: serde_json::Value = read_json(&model_params)?;
            let data_config: DataConfig = read_json(&data_config)?;
            let preprocessing = match preprocessing {
                Some(path) => read_json(&path)?,
                None => serde_json::json!({}),
            };

            let instance =
                Instance::from_configs(model_name, &model_params, &data_config, tag, cluster_id)?;
            instance
                .update_remote_tables(&pool, &model_params, &data_config, &preprocessing)
                .await?;

            println!("{}", instance.instance_id());
        }
    }

    Ok(())
}

/// Connects from `DATABASE_URL` and applies pending migrations, so every
/// command runs against a current schema.
async fn connect_pool() -> Result<DbPool, Box<dyn std::error::Error>> {
    let db = db::connect_from_env().await?;
    run_migrations(db.as_ref()).await?;
    Ok(DbPool::new(db))
}

const fn insert_method(force: bool) -> InsertMethod {
    if force {
        InsertMethod::All
    } else {
        InsertMethod::Missing
    }
}

fn parse_sources(raw: Option<&str>) -> Result<Vec<Source>, String> {
    let Some(list) = raw else {
        return Ok(Source::all().to_vec());
    };

    list.split(',')
        .map(str::trim)
        .map(|name| name.parse::<Source>().map_err(|_| format!("Unknown source: {name}")))
        .collect()
}

fn parse_name<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, String> {
    raw.parse().map_err(|_| format!("Unknown {what}: {raw}"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
