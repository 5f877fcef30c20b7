//! Watch-list planning: translate the catalog into per-entity-class field
//! watches on the host engine.
//!
//! Every provider-side acquisition (entity group, field group) pushes a
//! disposer; on any failure mid-plan the stack unwinds in reverse order so
//! no handle leaks. Destroying a handle the engine already dropped answers
//! "not configured", which is suppressed.

use std::sync::Arc;

use anyhow::Result;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::catalog::Counter;
use crate::dcgm::types::{
    DcgmError, EntityClass, FieldGroupHandle, GroupHandle, GROUP_MAX_ENTITIES,
};
use crate::dcgm::{fields, DcgmApi};
use crate::inventory::DeviceInventory;

/// One provider-side acquisition to undo at teardown.
enum Disposer {
    Group(GroupHandle),
    FieldGroup(FieldGroupHandle),
}

/// Planned watches for one entity class. Owns its provider-level handles
/// exclusively; dropped once, at shutdown, via [`WatchList::destroy`].
pub struct WatchList {
    pub class: EntityClass,
    /// Raw field ids projected for this class, in catalog order.
    pub device_fields: Vec<u16>,
    pub update_period_us: i64,
    provider: Arc<dyn DcgmApi>,
    disposers: Vec<Disposer>,
}

impl std::fmt::Debug for WatchList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchList")
            .field("class", &self.class)
            .field("device_fields", &self.device_fields)
            .field("update_period_us", &self.update_period_us)
            .finish()
    }
}

impl WatchList {
    /// Tear down every handle this watch list created, newest first.
    /// Idempotent: a second call is a no-op, and "not configured" answers
    /// from the engine (already gone) are suppressed.
    pub fn destroy(&mut self) {
        while let Some(disposer) = self.disposers.pop() {
            let result = match disposer {
                Disposer::Group(handle) => self.provider.destroy_group(handle),
                Disposer::FieldGroup(handle) => self.provider.destroy_field_group(handle),
            };
            match result {
                Ok(()) | Err(DcgmError::NotConfigured) => {}
                Err(e) => warn!(class = %self.class, error = %e, "Failed to destroy watch handle"),
            }
        }
    }
}

impl Drop for WatchList {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub struct WatchListManager {
    provider: Arc<dyn DcgmApi>,
    /// Microseconds between host-engine field updates.
    update_period_us: i64,
}

impl WatchListManager {
    pub fn new(provider: Arc<dyn DcgmApi>, collect_interval_ms: u64) -> Self {
        Self {
            provider,
            update_period_us: collect_interval_ms as i64 * 1000,
        }
    }

    /// Plan watches for one entity class. Returns `None` when the catalog
    /// holds nothing worth watching for it.
    pub fn plan(
        &self,
        class: EntityClass,
        counters: &[Counter],
        inventory: &DeviceInventory,
    ) -> Result<Option<WatchList>> {
        let device_fields = self.project_fields(class, counters);

        if device_fields.is_empty()
            || device_fields == [fields::DCGM_FI_DRIVER_VERSION]
        {
            debug!(class = %class, "No fields to watch; skipping class");
            return Ok(None);
        }

        let mut watch_list = WatchList {
            class,
            device_fields,
            update_period_us: self.update_period_us,
            provider: self.provider.clone(),
            disposers: Vec::new(),
        };

        if let Err(e) = self.build_groups(&mut watch_list, inventory) {
            watch_list.destroy();
            return Err(e);
        }

        info!(
            class = %class,
            fields = watch_list.device_fields.len(),
            "Watching fields"
        );
        Ok(Some(watch_list))
    }

    /// Project the counter list to the fields relevant for `class`.
    fn project_fields(&self, class: EntityClass, counters: &[Counter]) -> Vec<u16> {
        counters
            .iter()
            .filter_map(|c| {
                let meta = self.provider.field_meta(c.field_id).ok()?;
                let relevant = meta.entity_level == class
                    || meta.entity_level == EntityClass::None
                    || (class == EntityClass::Gpu
                        && matches!(
                            meta.entity_level,
                            EntityClass::GpuInstance
                                | EntityClass::ComputeInstance
                                | EntityClass::VGpu
                        ))
                    || (class == EntityClass::Cpu
                        && matches!(
                            meta.entity_level,
                            EntityClass::Cpu | EntityClass::CpuCore
                        ));
                relevant.then_some(c.field_id)
            })
            .collect()
    }

    fn build_groups(&self, watch_list: &mut WatchList, inventory: &DeviceInventory) -> Result<()> {
        let groups = match watch_list.class {
            EntityClass::Link => self.link_groups(watch_list, inventory)?,
            EntityClass::CpuCore => self.core_groups(watch_list, inventory)?,
            class => {
                let group = self.create_group(watch_list)?;
                for entity in inventory.monitored_entities(class) {
                    self.provider.add_entity_to_group(group, entity.entity)?;
                }
                vec![group]
            }
        };

        for group in groups {
            let field_group = self.create_field_group(watch_list)?;
            self.provider.watch_fields(
                field_group,
                group,
                watch_list.update_period_us,
                0.0,
                1,
            )?;
        }
        Ok(())
    }

    /// One group per watched switch, holding its up-and-watched links.
    fn link_groups(
        &self,
        watch_list: &mut WatchList,
        inventory: &DeviceInventory,
    ) -> Result<Vec<GroupHandle>> {
        let mut groups = Vec::new();
        for switch in &inventory.switches {
            if !inventory.is_switch_watched(switch.entity_id) {
                continue;
            }
            let group = self.create_group(watch_list)?;
            for link in &switch.links {
                if link.state != crate::dcgm::types::LinkState::Up {
                    continue;
                }
                if !inventory.is_link_watched(link.index, switch.entity_id) {
                    continue;
                }
                self.provider
                    .add_link_entity_to_group(group, link.index, switch.entity_id)?;
            }
            groups.push(group);
        }
        Ok(groups)
    }

    /// Per-CPU groups, subdivided so none exceeds the engine's entity cap.
    fn core_groups(
        &self,
        watch_list: &mut WatchList,
        inventory: &DeviceInventory,
    ) -> Result<Vec<GroupHandle>> {
        let mut groups = Vec::new();
        for cpu in &inventory.cpus {
            if !inventory.is_cpu_watched(cpu.entity_id) {
                continue;
            }
            let watched: Vec<_> = cpu
                .core_ids
                .iter()
                .filter(|core| inventory.is_core_watched(**core, cpu.entity_id))
                .collect();
            for chunk in watched.chunks(GROUP_MAX_ENTITIES) {
                let group = self.create_group(watch_list)?;
                for core in chunk {
                    self.provider.add_entity_to_group(
                        group,
                        crate::dcgm::types::EntityPair::new(EntityClass::CpuCore, **core),
                    )?;
                }
                groups.push(group);
            }
        }
        Ok(groups)
    }

    fn create_group(&self, watch_list: &mut WatchList) -> Result<GroupHandle> {
        let name = format!("{}-group-{}", watch_list.class.tag(), random_suffix());
        let group = self.provider.create_group(&name)?;
        watch_list.disposers.push(Disposer::Group(group));
        Ok(group)
    }

    fn create_field_group(&self, watch_list: &mut WatchList) -> Result<FieldGroupHandle> {
        let name = format!("{}-fields-{}", watch_list.class.tag(), random_suffix());
        let field_group = self
            .provider
            .create_field_group(&name, &watch_list.device_fields)?;
        watch_list.disposers.push(Disposer::FieldGroup(field_group));
        Ok(field_group)
    }
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PromType;
    use crate::dcgm::mock::MockDcgm;
    use crate::dcgm::types::{DeviceIdentity, LinkState, NvLinkStatus};
    use crate::inventory::{CpuInfo, GpuInfo, SwitchInfo};

    fn counter(field_id: u16, name: &str) -> Counter {
        Counter {
            field_id,
            field_name: name.into(),
            prom_type: PromType::Gauge,
            help: String::new(),
        }
    }

    fn gpu_inventory(count: u32) -> DeviceInventory {
        DeviceInventory {
            gpus: (0..count)
                .map(|gpu_id| GpuInfo {
                    device: DeviceIdentity {
                        gpu_id,
                        uuid: format!("GPU-{gpu_id}"),
                        ..Default::default()
                    },
                    mig_enabled: false,
                    instances: vec![],
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn projects_fields_per_class() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock, 1000);
        let counters = vec![
            counter(fields::DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP"),
            counter(fields::DCGM_FI_DRIVER_VERSION, "DCGM_FI_DRIVER_VERSION"),
            counter(fields::DCGM_FI_DEV_FB_USED, "DCGM_FI_DEV_FB_USED"),
            counter(
                fields::DCGM_FI_DEV_CPU_UTIL_TOTAL,
                "DCGM_FI_DEV_CPU_UTIL_TOTAL",
            ),
        ];

        let projected = manager.project_fields(EntityClass::Gpu, &counters);
        assert_eq!(
            projected,
            vec![
                fields::DCGM_FI_DEV_GPU_TEMP,
                fields::DCGM_FI_DRIVER_VERSION,
                fields::DCGM_FI_DEV_FB_USED,
            ]
        );

        let projected = manager.project_fields(EntityClass::Cpu, &counters);
        assert_eq!(
            projected,
            vec![
                fields::DCGM_FI_DRIVER_VERSION,
                fields::DCGM_FI_DEV_CPU_UTIL_TOTAL
            ]
        );
    }

    #[test]
    fn skips_class_with_no_fields_or_driver_version_only() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock, 1000);
        let inventory = gpu_inventory(1);

        let counters = vec![counter(fields::DCGM_FI_DRIVER_VERSION, "DCGM_FI_DRIVER_VERSION")];
        assert!(manager
            .plan(EntityClass::Gpu, &counters, &inventory)
            .unwrap()
            .is_none());

        let counters = vec![counter(fields::DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP")];
        assert!(manager
            .plan(EntityClass::Switch, &counters, &inventory)
            .unwrap()
            .is_none());
    }

    #[test]
    fn plans_single_group_with_monitored_gpus() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock.clone(), 2000);
        let inventory = gpu_inventory(2);
        let counters = vec![counter(fields::DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP")];

        let watch_list = manager
            .plan(EntityClass::Gpu, &counters, &inventory)
            .unwrap()
            .unwrap();
        assert_eq!(watch_list.device_fields, vec![fields::DCGM_FI_DEV_GPU_TEMP]);

        let members = mock.all_group_members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].len(), 2);

        let watches = mock.watches();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].update_period_us, 2_000_000);
        assert_eq!(watches[0].keep_age_s, 0.0);
        assert_eq!(watches[0].keep_samples, 1);
    }

    #[test]
    fn group_names_are_unique() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock.clone(), 1000);
        let inventory = gpu_inventory(1);
        let counters = vec![counter(fields::DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP")];

        let _a = manager.plan(EntityClass::Gpu, &counters, &inventory).unwrap();
        let _b = manager.plan(EntityClass::Gpu, &counters, &inventory).unwrap();
        let names = mock.group_names();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
    }

    #[test]
    fn link_class_builds_one_group_per_watched_switch() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock.clone(), 1000);
        let link = |parent_id, index, state| NvLinkStatus {
            parent_class: EntityClass::Switch,
            parent_id,
            index,
            state,
        };
        let inventory = DeviceInventory {
            switches: vec![
                SwitchInfo {
                    entity_id: 0,
                    links: vec![link(0, 0, LinkState::Up), link(0, 1, LinkState::Down)],
                },
                SwitchInfo {
                    entity_id: 1,
                    links: vec![link(1, 0, LinkState::Up)],
                },
            ],
            ..Default::default()
        };
        let counters = vec![counter(
            fields::DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX,
            "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX",
        )];

        let _wl = manager
            .plan(EntityClass::Link, &counters, &inventory)
            .unwrap()
            .unwrap();

        let link_members = mock.all_link_members();
        assert_eq!(link_members.len(), 2);
        // Down links never join a group.
        assert_eq!(link_members[0], vec![(0, 0)]);
        assert_eq!(link_members[1], vec![(0, 1)]);
        assert_eq!(mock.watches().len(), 2);
    }

    #[test]
    fn core_groups_subdivide_at_entity_cap() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock.clone(), 1000);
        let inventory = DeviceInventory {
            cpus: vec![CpuInfo {
                entity_id: 0,
                core_ids: (0..70).collect(),
            }],
            ..Default::default()
        };
        let counters = vec![counter(
            fields::DCGM_FI_DEV_CPU_UTIL_TOTAL,
            "DCGM_FI_DEV_CPU_UTIL_TOTAL",
        )];

        let _wl = manager
            .plan(EntityClass::CpuCore, &counters, &inventory)
            .unwrap()
            .unwrap();

        let members = mock.all_group_members();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].len(), GROUP_MAX_ENTITIES);
        assert_eq!(members[1].len(), 6);
        assert_eq!(mock.watches().len(), 2);
    }

    #[test]
    fn failure_mid_plan_unwinds_disposers_in_reverse() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock.clone(), 1000);
        let inventory = gpu_inventory(1);
        let counters = vec![counter(fields::DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP")];

        mock.fail_field_group_create();
        let err = manager
            .plan(EntityClass::Gpu, &counters, &inventory)
            .unwrap_err();
        assert!(err.to_string().contains("dcgmFieldGroupCreate"));

        // The entity group created before the failure was destroyed.
        let created = mock.created_group_handles();
        assert_eq!(created.len(), 1);
        assert_eq!(mock.destroyed_groups(), created);
    }

    #[test]
    fn destroy_is_idempotent_and_tolerates_not_configured() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock.clone(), 1000);
        let inventory = gpu_inventory(1);
        let counters = vec![counter(fields::DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP")];

        let mut watch_list = manager
            .plan(EntityClass::Gpu, &counters, &inventory)
            .unwrap()
            .unwrap();

        mock.not_configured_on_destroy();
        watch_list.destroy();
        assert_eq!(mock.destroyed_groups().len(), 1);
        assert_eq!(mock.destroyed_field_groups().len(), 1);

        // Second destroy: nothing left to undo.
        watch_list.destroy();
        assert_eq!(mock.destroyed_groups().len(), 1);
    }

    #[test]
    fn field_groups_destroyed_before_entity_groups() {
        let mock = Arc::new(MockDcgm::new());
        let manager = WatchListManager::new(mock.clone(), 1000);
        let inventory = gpu_inventory(1);
        let counters = vec![counter(fields::DCGM_FI_DEV_GPU_TEMP, "DCGM_FI_DEV_GPU_TEMP")];

        let mut watch_list = manager
            .plan(EntityClass::Gpu, &counters, &inventory)
            .unwrap()
            .unwrap();
        let group = mock.created_group_handles()[0];
        let field_group = mock.created_field_group_handles()[0];

        watch_list.destroy();
        // Reverse acquisition order: the field group (acquired last) first.
        assert_eq!(mock.destroyed_field_groups(), vec![field_group]);
        assert_eq!(mock.destroyed_groups(), vec![group]);
    }
}
