//! Tracker: the public tracking API
//!
//! Wires the store, tracking client, reachability probe and flushing
//! manager together once, from a [`Config`]. Tracking calls return as soon
//! as the record is durably queued; delivery happens on flush.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Result, StorageError};
use crate::flushing::FlushingManager;
use crate::reachability::{HostReachability, Reachability};
use crate::tracking::{AgePolicy, TrackingClient, TrackingRepository};
use crate::types::*;

/// Timeout of the TCP probe run before each flush
const REACHABILITY_TIMEOUT_SECS: u64 = 5;

pub struct Tracker {
    config: Config,
    store: Arc<Database>,
    flushing: Arc<FlushingManager>,
}

impl Tracker {
    /// Build a tracker backed by the database in the XDG data directory.
    pub fn configure(config: Config) -> Result<Self> {
        Self::open(config, &Config::database_path())
    }

    /// Build a tracker backed by the database at `db_path`.
    pub fn open(config: Config, db_path: &Path) -> Result<Self> {
        config.validate()?;

        let store = Database::open(db_path)?;
        store.migrate()?;

        let project = config.default_project()?;
        let repository = TrackingClient::new(
            project.clone(),
            config.flushing.timeout(),
            AgePolicy::new(config.flushing.age_event_types.iter().cloned()),
        )?;
        let reachability = HostReachability::from_base_url(
            &project.base_url,
            std::time::Duration::from_secs(REACHABILITY_TIMEOUT_SECS),
        )?;

        Self::new(
            config,
            Arc::new(store),
            Arc::new(repository),
            Arc::new(reachability),
        )
    }

    /// Build a tracker from explicit collaborators.
    pub fn new(
        config: Config,
        store: Arc<Database>,
        repository: Arc<dyn TrackingRepository>,
        reachability: Arc<dyn Reachability>,
    ) -> Result<Self> {
        config.validate()?;
        store.ensure_cookie()?;

        let flushing = FlushingManager::new(
            store.clone(),
            repository,
            reachability,
            config.flushing.max_retries,
            config.flushing.immediate_delay(),
        )?;
        flushing.set_flushing_mode(config.flushing.flushing_mode());

        tracing::info!(
            project_token = config.project.project_token.as_deref().unwrap_or(""),
            base_url = %config.project.base_url,
            "Tracker configured"
        );

        Ok(Self {
            config,
            store,
            flushing,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    pub fn flushing_manager(&self) -> &Arc<FlushingManager> {
        &self.flushing
    }

    // ============================================
    // Tracking
    // ============================================

    /// Identify the current customer and update their properties.
    pub fn identify_customer(
        &self,
        customer_ids: CustomerIds,
        properties: Properties,
    ) -> std::result::Result<RecordId, StorageError> {
        let id = self.append(
            RecordKind::CustomerUpdate,
            &self.default_project()?,
            vec![
                DataRecord::CustomerIds(customer_ids),
                DataRecord::Properties(properties),
                DataRecord::Timestamp(None),
            ],
        )?;
        self.flushing.schedule_immediate_flush();
        Ok(id)
    }

    /// Track an event into the main project and every project mapped to its type.
    pub fn track_event(
        &self,
        event_type: &str,
        properties: Properties,
        timestamp: Option<f64>,
    ) -> std::result::Result<Vec<RecordId>, StorageError> {
        let projects = self
            .config
            .projects_for(event_type)
            .map_err(StorageError::write)?;

        let mut ids = Vec::with_capacity(projects.len());
        for project in &projects {
            ids.push(self.append(
                RecordKind::Event,
                project,
                vec![
                    DataRecord::EventType(event_type.to_string()),
                    DataRecord::Properties(properties.clone()),
                    DataRecord::Timestamp(timestamp),
                ],
            )?);
        }
        self.flushing.schedule_immediate_flush();
        Ok(ids)
    }

    /// Track a click on a campaign link.
    pub fn track_campaign_click(
        &self,
        url: &str,
        properties: Properties,
        timestamp: Option<f64>,
    ) -> std::result::Result<Vec<RecordId>, StorageError> {
        let mut click = Properties::new();
        click.insert("url".to_string(), json!(url));
        click.insert("properties".to_string(), JsonValue::Object(properties));
        self.track_event(CAMPAIGN_CLICK_EVENT, click, timestamp)
    }

    /// Register (or with `None`, unregister) the push notification token.
    pub fn track_push_token(
        &self,
        token: Option<String>,
        authorized: bool,
    ) -> std::result::Result<RecordId, StorageError> {
        let id = self.append(
            RecordKind::CustomerUpdate,
            &self.default_project()?,
            vec![
                DataRecord::PushToken { token, authorized },
                DataRecord::Timestamp(None),
            ],
        )?;
        self.flushing.schedule_immediate_flush();
        Ok(id)
    }

    /// Forget the current customer and every pending record, then start
    /// over as a fresh anonymous customer.
    pub fn anonymize(&self) -> std::result::Result<String, StorageError> {
        self.store.clear()?;
        let cookie = self.store.ensure_cookie()?;
        tracing::info!(cookie = %cookie, "Customer anonymized");
        Ok(cookie)
    }

    pub fn customer_ids(&self) -> std::result::Result<CustomerIds, StorageError> {
        self.store.customer_ids()
    }

    fn default_project(&self) -> std::result::Result<Project, StorageError> {
        self.config.default_project().map_err(StorageError::write)
    }

    /// Default properties go first so the caller's keys win.
    fn append(
        &self,
        kind: RecordKind,
        project: &Project,
        data: Vec<DataRecord>,
    ) -> std::result::Result<RecordId, StorageError> {
        let mut records = Vec::with_capacity(data.len() + 1);
        if !self.config.project.default_properties.is_empty() {
            records.push(DataRecord::Properties(
                self.config.project.default_properties.clone(),
            ));
        }
        records.extend(data);
        self.store.append_for_project(kind, project, &records)
    }

    // ============================================
    // Flushing
    // ============================================

    pub async fn flush(&self) -> FlushResult {
        self.flushing.flush().await
    }

    pub fn flushing_mode(&self) -> FlushingMode {
        self.flushing.flushing_mode()
    }

    pub fn set_flushing_mode(&self, mode: FlushingMode) {
        self.flushing.set_flushing_mode(mode);
    }

    pub fn has_pending_data(&self) -> bool {
        self.flushing.has_pending_data()
    }

    pub fn application_did_become_active(&self) {
        self.flushing.application_did_become_active();
    }

    pub fn application_did_enter_background(&self) {
        self.flushing.application_did_enter_background();
    }

    pub fn on_customer_identified(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.flushing.on_customer_identified(handler);
    }
}
