//! Narrow façade over the GPU management library.
//!
//! Everything the exporter needs from the host engine goes through the
//! [`DcgmApi`] trait: device and topology discovery, group and field-group
//! handles, watch registration, and value queries. Production wires the
//! `libloading`-backed [`live::LiveDcgm`]; tests wire a canned mock.

pub mod fields;
pub mod live;
pub mod types;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use types::{
    CpuHierarchy, DcgmResult, DeviceIdentity, EntityClass, EntityId, EntityPair, EntitySample,
    FieldGroupHandle, FieldMeta, GroupHandle, MigHierarchy, NvLinkStatus, Sample,
};

/// The fixed capability set the exporter relies on. One implementation talks
/// to the live host engine; tests implement it directly with canned data.
///
/// Every call may fail. [`types::DcgmError::ConnectionNotValid`] is fatal to
/// the process; all other errors are reported up and handled per call site.
pub trait DcgmApi: Send + Sync {
    fn device_count(&self) -> DcgmResult<u32>;
    fn device_info(&self, gpu_id: EntityId) -> DcgmResult<DeviceIdentity>;
    fn mig_hierarchy(&self) -> DcgmResult<MigHierarchy>;
    fn cpu_hierarchy(&self) -> DcgmResult<CpuHierarchy>;
    fn nvlink_status(&self) -> DcgmResult<Vec<NvLinkStatus>>;
    fn entity_group_entities(&self, class: EntityClass) -> DcgmResult<Vec<EntityId>>;
    fn field_meta(&self, field_id: u16) -> DcgmResult<FieldMeta>;

    fn create_group(&self, name: &str) -> DcgmResult<GroupHandle>;
    fn destroy_group(&self, group: GroupHandle) -> DcgmResult<()>;
    fn add_entity_to_group(&self, group: GroupHandle, entity: EntityPair) -> DcgmResult<()>;
    fn add_link_entity_to_group(
        &self,
        group: GroupHandle,
        link_index: u32,
        parent_id: EntityId,
    ) -> DcgmResult<()>;

    fn create_field_group(&self, name: &str, field_ids: &[u16]) -> DcgmResult<FieldGroupHandle>;
    fn destroy_field_group(&self, group: FieldGroupHandle) -> DcgmResult<()>;

    fn watch_fields(
        &self,
        field_group: FieldGroupHandle,
        group: GroupHandle,
        update_period_us: i64,
        keep_age_s: f64,
        keep_samples: i32,
    ) -> DcgmResult<()>;

    fn entity_latest_values(&self, entity: EntityPair, field_ids: &[u16])
        -> DcgmResult<Vec<Sample>>;
    fn link_latest_values(
        &self,
        link_index: u32,
        parent_id: EntityId,
        field_ids: &[u16],
    ) -> DcgmResult<Vec<Sample>>;

    /// Samples recorded after `since_us` for the watched (group, field group)
    /// pair, plus the cursor to pass on the next call.
    fn values_since(
        &self,
        group: GroupHandle,
        field_group: FieldGroupHandle,
        since_us: i64,
    ) -> DcgmResult<(Vec<EntitySample>, i64)>;

    fn update_all_fields(&self) -> DcgmResult<()>;
    fn shutdown(&self) -> DcgmResult<()>;
}

/// Connect to the host engine per the configuration: remote when
/// `use_remote` is set, embedded otherwise.
pub fn connect(config: &Config) -> Result<Arc<dyn DcgmApi>> {
    if config.enable_native_log {
        // The native library reads these at init time.
        std::env::set_var("__DCGM_DBG_FILE", "-");
        std::env::set_var("__DCGM_DBG_LVL", &config.native_log_level);
    }

    let client = if config.use_remote {
        let addr = config
            .remote_address
            .as_deref()
            .context("use_remote is set but no remote address configured")?;
        info!(addr, "Connecting to remote host engine");
        live::LiveDcgm::connect_remote(addr)?
    } else {
        info!("Starting embedded host engine");
        live::LiveDcgm::start_embedded()?
    };

    Ok(Arc::new(client))
}
