#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Model instance identity and registry persistence.
//!
//! A model fit is identified by what went into it: the model family, a
//! hash of its parameters, a hash of its data configuration, and the git
//! hash of the code that ran it. [`Instance`] carries those four fields
//! plus the derived instance id and writes the registry rows that let a
//! fit be looked up and reproduced later.

pub mod hashing;

use airmap_database::writer::{self, OnConflict, RecordSource};
use airmap_database::{DbError, DbPool};
use airmap_database_models::tables;
use airmap_feature_models::{BufferSize, DynamicFeatureName, Source, Species, StaticFeatureName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use switchy_database::{Database, DatabaseValue};

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Model family fitted against the feature matrix.
///
/// Stored verbatim in `air_quality_model.model_name` and hashed into the
/// instance id, so the serialized forms are part of both contracts.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelName {
    /// Sparse variational Gaussian process.
    Svgp,
    /// Multi-resolution deep Gaussian process.
    Mrdgp,
}

/// Lifecycle stage of a fit.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tag {
    Test,
    Validation,
    Production,
}

/// Where a fit ran.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClusterId {
    Laptop,
    Azure,
    Kubernetes,
}

/// Data selection for one model fit.
///
/// `data_id` is [`hashing::hash_config`] of this struct, so every field
/// takes part in the identity. The vocabulary types serialize to the same
/// strings the feature tables store, which keeps a config hash stable
/// across the code that wrote the features and the code that trains on
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_start_date: DateTime<Utc>,
    pub train_end_date: DateTime<Utc>,
    pub pred_start_date: DateTime<Utc>,
    pub pred_end_date: DateTime<Utc>,
    pub train_sources: Vec<Source>,
    pub pred_sources: Vec<Source>,
    pub species: Vec<Species>,
    pub static_features: Vec<StaticFeatureName>,
    pub dynamic_features: Vec<DynamicFeatureName>,
    pub buffer_sizes: Vec<BufferSize>,
}

/// One model fit and its derived identity.
///
/// The instance id is a pure function of model name, param id, data id
/// and git hash. It is recomputed inside every setter of those fields, so
/// a caller can never observe a stale id.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    model_name: ModelName,
    param_id: String,
    data_id: String,
    git_hash: String,
    tag: Tag,
    cluster_id: ClusterId,
    fit_start_time: DateTime<Utc>,
    instance_id: String,
}

impl Instance {
    /// Creates an instance from already-computed hashes.
    ///
    /// The git hash comes from the `GIT_HASH` environment variable and
    /// the fit start time is now.
    #[must_use]
    pub fn new(
        model_name: ModelName,
        param_id: String,
        data_id: String,
        tag: Tag,
        cluster_id: ClusterId,
    ) -> Self {
        let git_hash = hashing::git_hash();
        let instance_id =
            hashing::instance_id_from_hash(model_name.as_ref(), &param_id, &data_id, &git_hash);

        Self {
            model_name,
            param_id,
            data_id,
            git_hash,
            tag,
            cluster_id,
            fit_start_time: Utc::now(),
            instance_id,
        }
    }

    /// Derives the param and data ids from the configurations themselves.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Serialize`] if either configuration cannot
    /// be represented as JSON.
    pub fn from_configs(
        model_name: ModelName,
        model_params: &serde_json::Value,
        data_config: &DataConfig,
        tag: Tag,
        cluster_id: ClusterId,
    ) -> Result<Self, InstanceError> {
        let param_id = hashing::hash_config(model_params)?;
        let data_id = hashing::hash_config(data_config)?;

        Ok(Self::new(model_name, param_id, data_id, tag, cluster_id))
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub const fn model_name(&self) -> ModelName {
        self.model_name
    }

    #[must_use]
    pub fn param_id(&self) -> &str {
        &self.param_id
    }

    #[must_use]
    pub fn data_id(&self) -> &str {
        &self.data_id
    }

    #[must_use]
    pub fn git_hash(&self) -> &str {
        &self.git_hash
    }

    #[must_use]
    pub const fn tag(&self) -> Tag {
        self.tag
    }

    #[must_use]
    pub const fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    #[must_use]
    pub const fn fit_start_time(&self) -> DateTime<Utc> {
        self.fit_start_time
    }

    pub fn set_model_name(&mut self, model_name: ModelName) {
        self.model_name = model_name;
        self.refresh_instance_id();
    }

    pub fn set_param_id(&mut self, param_id: String) {
        self.param_id = param_id;
        self.refresh_instance_id();
    }

    pub fn set_data_id(&mut self, data_id: String) {
        self.data_id = data_id;
        self.refresh_instance_id();
    }

    pub fn set_git_hash(&mut self, git_hash: String) {
        self.git_hash = git_hash;
        self.refresh_instance_id();
    }

    /// Tags do not take part in the id.
    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    pub fn set_cluster_id(&mut self, cluster_id: ClusterId) {
        self.cluster_id = cluster_id;
    }

    /// Start times do not take part in the id; two runs of the same fit
    /// share an instance id on purpose.
    pub fn set_fit_start_time(&mut self, fit_start_time: DateTime<Utc>) {
        self.fit_start_time = fit_start_time;
    }

    fn refresh_instance_id(&mut self) {
        self.instance_id = hashing::instance_id_from_hash(
            self.model_name.as_ref(),
            &self.param_id,
            &self.data_id,
            &self.git_hash,
        );
    }

    /// Writes the model, data and instance rows for this fit.
    ///
    /// All three writes share one transaction, and re-running with the
    /// same hashes overwrites in place.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] if the data configuration cannot be
    /// serialized or any of the writes fail.
    pub async fn update_remote_tables(
        &self,
        pool: &DbPool,
        model_params: &serde_json::Value,
        data_config: &DataConfig,
        preprocessing: &serde_json::Value,
    ) -> Result<(), InstanceError> {
        let data_row = self.data_row(data_config, preprocessing)?;

        let session = pool.open_session().await?;

        match self
            .write_registry_rows(session.db(), model_params, data_row)
            .await
        {
            Ok(()) => {
                session.commit().await?;

                log::info!(
                    "registered instance {} ({}, {})",
                    self.instance_id,
                    self.model_name,
                    self.tag,
                );

                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    log::error!("Failed to roll back instance registration: {rollback_err:?}");
                }
                Err(err.into())
            }
        }
    }

    async fn write_registry_rows(
        &self,
        db: &dyn Database,
        model_params: &serde_json::Value,
        data_row: Vec<DatabaseValue>,
    ) -> Result<(), DbError> {
        writer::commit_records(
            db,
            RecordSource::Rows(vec![self.model_row(model_params)]),
            &tables::MODEL,
            OnConflict::Overwrite,
        )
        .await?;

        writer::commit_records(
            db,
            RecordSource::Rows(vec![data_row]),
            &tables::DATA,
            OnConflict::Overwrite,
        )
        .await?;

        writer::commit_records(
            db,
            RecordSource::Rows(vec![self.instance_row()]),
            &tables::INSTANCE,
            OnConflict::Overwrite,
        )
        .await?;

        Ok(())
    }

    fn model_row(&self, model_params: &serde_json::Value) -> Vec<DatabaseValue> {
        vec![
            DatabaseValue::String(self.model_name.to_string()),
            DatabaseValue::String(self.param_id.clone()),
            DatabaseValue::String(model_params.to_string()),
        ]
    }

    fn data_row(
        &self,
        data_config: &DataConfig,
        preprocessing: &serde_json::Value,
    ) -> Result<Vec<DatabaseValue>, InstanceError> {
        Ok(vec![
            DatabaseValue::String(self.data_id.clone()),
            DatabaseValue::String(serde_json::to_value(data_config)?.to_string()),
            DatabaseValue::String(preprocessing.to_string()),
        ])
    }

    fn instance_row(&self) -> Vec<DatabaseValue> {
        vec![
            DatabaseValue::String(self.instance_id.clone()),
            DatabaseValue::String(self.tag.to_string()),
            DatabaseValue::String(self.git_hash.clone()),
            DatabaseValue::DateTime(self.fit_start_time.naive_utc()),
            DatabaseValue::String(self.cluster_id.to_string()),
            DatabaseValue::String(self.model_name.to_string()),
            DatabaseValue::String(self.param_id.clone()),
            DatabaseValue::String(self.data_id.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn sample_config() -> DataConfig {
        DataConfig {
            train_start_date: Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap(),
            train_end_date: Utc.with_ymd_and_hms(2021, 3, 8, 0, 0, 0).unwrap(),
            pred_start_date: Utc.with_ymd_and_hms(2021, 3, 8, 0, 0, 0).unwrap(),
            pred_end_date: Utc.with_ymd_and_hms(2021, 3, 10, 0, 0, 0).unwrap(),
            train_sources: vec![Source::Laqn, Source::Aqe],
            pred_sources: vec![Source::Grid100],
            species: vec![Species::No2],
            static_features: vec![
                StaticFeatureName::TotalRoadLength,
                StaticFeatureName::BuildingHeight,
            ],
            dynamic_features: vec![DynamicFeatureName::MaxNVehicles],
            buffer_sizes: BufferSize::ALL_DESCENDING.to_vec(),
        }
    }

    fn sample_instance() -> Instance {
        let mut instance = Instance::new(
            ModelName::Svgp,
            "param-hash".to_string(),
            "data-hash".to_string(),
            Tag::Test,
            ClusterId::Laptop,
        );
        instance.set_git_hash("abc123".to_string());
        instance
    }

    #[test]
    fn setters_of_hashed_fields_refresh_the_id() {
        let mut instance = sample_instance();
        let before = instance.instance_id().to_string();

        instance.set_param_id("other-param".to_string());

        assert_ne!(instance.instance_id(), before);
        assert_eq!(
            instance.instance_id(),
            hashing::instance_id_from_hash("svgp", "other-param", "data-hash", "abc123"),
        );
    }

    #[test]
    fn setters_of_unhashed_fields_leave_the_id_alone() {
        let mut instance = sample_instance();
        let before = instance.instance_id().to_string();

        instance.set_tag(Tag::Production);
        instance.set_cluster_id(ClusterId::Kubernetes);
        instance.set_fit_start_time(Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap());

        assert_eq!(instance.instance_id(), before);
    }

    #[test]
    fn from_configs_derives_both_hashes() {
        let params = serde_json::json!({"maxiter": 5000, "kernel": "matern32"});
        let config = sample_config();

        let instance =
            Instance::from_configs(ModelName::Mrdgp, &params, &config, Tag::Test, ClusterId::Azure)
                .unwrap();

        assert_eq!(instance.param_id(), hashing::hash_config(&params).unwrap());
        assert_eq!(instance.data_id(), hashing::hash_config(&config).unwrap());
    }

    #[test]
    fn data_id_ignores_source_list_order() {
        let config = sample_config();
        let mut reordered = config.clone();
        reordered.train_sources = vec![Source::Aqe, Source::Laqn];

        assert_eq!(
            hashing::hash_config(&config).unwrap(),
            hashing::hash_config(&reordered).unwrap(),
        );
    }

    #[test]
    fn rows_line_up_with_the_table_layouts() {
        let instance = sample_instance();
        let params = serde_json::json!({"maxiter": 5000});
        let preprocessing = serde_json::json!({"normaliseby": "laqn"});

        assert_eq!(
            instance.model_row(&params).len(),
            tables::MODEL.params_per_row(),
        );
        assert_eq!(
            instance
                .data_row(&sample_config(), &preprocessing)
                .unwrap()
                .len(),
            tables::DATA.params_per_row(),
        );
        assert_eq!(
            instance.instance_row().len(),
            tables::INSTANCE.params_per_row(),
        );
    }

    #[test]
    fn fit_start_time_binds_as_a_datetime() {
        let instance = sample_instance();
        let row = instance.instance_row();

        assert!(matches!(row[3], DatabaseValue::DateTime(..)));
    }

    #[test]
    fn enum_forms_match_the_stored_strings() {
        assert_eq!(ModelName::Svgp.to_string(), "svgp");
        assert_eq!(ModelName::Mrdgp.to_string(), "mrdgp");
        assert_eq!(Tag::Production.to_string(), "production");
        assert_eq!(ClusterId::Kubernetes.to_string(), "kubernetes");
        assert_eq!("validation".parse::<Tag>().unwrap(), Tag::Validation);
    }
}
