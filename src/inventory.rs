//! Device topology snapshot and selection filters.
//!
//! The inventory is built once at startup from the provider's discovery
//! calls and is immutable afterwards; collectors and transformations share
//! it read-only. Hot-plug is out of scope.

use std::str::FromStr;

use anyhow::{bail, Result};
use tracing::info;

use crate::dcgm::types::{
    DeviceIdentity, EntityClass, EntityId, EntityPair, FieldValue, LinkState, NvLinkStatus,
};
use crate::dcgm::{fields, DcgmApi};

/// Sentinel inside a ranged filter meaning "every id".
pub const RANGE_ALL: i32 = -1;

/// Per-class device selection: either flexible (topology decides) or
/// explicit parent/child id ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// One entry per GPU, or per MIG instance when MIG is enabled.
    Flex,
    /// `major` restricts parents (GPU/switch/CPU ids), `minor` restricts
    /// children (instance/link/core ids). `[-1]` means all.
    Ranged { major: Vec<i32>, minor: Vec<i32> },
}

impl DeviceFilter {
    /// All parents, no explicit children: the default monitoring shape.
    pub fn all() -> Self {
        Self::Ranged {
            major: vec![RANGE_ALL],
            minor: Vec::new(),
        }
    }

    fn major_is_all(&self) -> bool {
        matches!(self, Self::Ranged { major, .. } if major.first() == Some(&RANGE_ALL))
    }

    fn minor_is_all(&self) -> bool {
        matches!(self, Self::Ranged { minor, .. } if minor.first() == Some(&RANGE_ALL))
    }

    fn major_contains(&self, id: EntityId) -> bool {
        matches!(self, Self::Ranged { major, .. } if major.contains(&(id as i32)))
    }

    fn minor_contains(&self, id: EntityId) -> bool {
        matches!(self, Self::Ranged { minor, .. } if minor.contains(&(id as i32)))
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for DeviceFilter {
    type Err = anyhow::Error;

    /// `"f"`/`"flex"`, or `"<majors>[:<minors>]"` where each side is a
    /// comma-separated id list (`-1` for all).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("f") || s.eq_ignore_ascii_case("flex") {
            return Ok(Self::Flex);
        }
        if s.is_empty() {
            return Ok(Self::all());
        }

        let parse_list = |part: &str| -> Result<Vec<i32>> {
            part.split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| {
                    p.trim()
                        .parse::<i32>()
                        .map_err(|_| anyhow::anyhow!("invalid device id {p:?} in filter {s:?}"))
                })
                .collect()
        };

        match s.split_once(':') {
            Some((major, minor)) => Ok(Self::Ranged {
                major: parse_list(major)?,
                minor: parse_list(minor)?,
            }),
            None => Ok(Self::Ranged {
                major: parse_list(s)?,
                minor: Vec::new(),
            }),
        }
    }
}

/// A MIG GPU instance and its compute instances.
#[derive(Debug, Clone)]
pub struct GpuInstanceInfo {
    pub entity_id: EntityId,
    pub parent_gpu_id: EntityId,
    pub nvml_instance_id: u32,
    pub profile_id: u32,
    pub slices: u32,
    /// Resolved lazily after hierarchy assembly via a batched name fetch.
    pub profile_name: String,
    pub compute_instance_ids: Vec<EntityId>,
}

#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub device: DeviceIdentity,
    pub mig_enabled: bool,
    pub instances: Vec<GpuInstanceInfo>,
}

impl GpuInfo {
    /// The `nvidia<i>` device string used as a label column.
    pub fn device_string(&self) -> String {
        format!("nvidia{}", self.device.gpu_id)
    }
}

#[derive(Debug, Clone)]
pub struct SwitchInfo {
    pub entity_id: EntityId,
    pub links: Vec<NvLinkStatus>,
}

#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub entity_id: EntityId,
    pub core_ids: Vec<EntityId>,
}

/// One entity a collector should visit, with enough identity to label the
/// resulting metrics.
#[derive(Debug, Clone)]
pub struct MonitoredEntity {
    pub entity: EntityPair,
    /// Identity of the owning GPU for GPU/instance entities.
    pub device: DeviceIdentity,
    /// Set for MIG-instance entries.
    pub instance: Option<MonitoredInstance>,
    /// Parent id for link and core entities.
    pub parent_id: Option<EntityId>,
}

#[derive(Debug, Clone)]
pub struct MonitoredInstance {
    pub entity_id: EntityId,
    pub nvml_instance_id: u32,
    pub profile_name: String,
}

impl MonitoredEntity {
    fn gpu(gpu: &GpuInfo) -> Self {
        Self {
            entity: EntityPair::new(EntityClass::Gpu, gpu.device.gpu_id),
            device: gpu.device.clone(),
            instance: None,
            parent_id: None,
        }
    }

    fn gpu_instance(gpu: &GpuInfo, instance: &GpuInstanceInfo) -> Self {
        Self {
            entity: EntityPair::new(EntityClass::GpuInstance, instance.entity_id),
            device: gpu.device.clone(),
            instance: Some(MonitoredInstance {
                entity_id: instance.entity_id,
                nvml_instance_id: instance.nvml_instance_id,
                profile_name: instance.profile_name.clone(),
            }),
            parent_id: Some(gpu.device.gpu_id),
        }
    }

    fn plain(class: EntityClass, id: EntityId) -> Self {
        Self {
            entity: EntityPair::new(class, id),
            device: DeviceIdentity::default(),
            instance: None,
            parent_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InventoryOptions {
    pub gpu_filter: DeviceFilter,
    pub switch_filter: DeviceFilter,
    pub cpu_filter: DeviceFilter,
    pub use_fake_gpus: bool,
    /// Build the switch/link part of the topology (only when link or switch
    /// fields are configured; absence of switches is an error then).
    pub want_switches: bool,
    /// Same for the CPU part.
    pub want_cpus: bool,
}

#[derive(Debug, Default)]
pub struct DeviceInventory {
    pub gpus: Vec<GpuInfo>,
    pub switches: Vec<SwitchInfo>,
    pub cpus: Vec<CpuInfo>,
    pub gpu_filter: DeviceFilter,
    pub switch_filter: DeviceFilter,
    pub cpu_filter: DeviceFilter,
}

impl DeviceInventory {
    pub fn build(provider: &dyn DcgmApi, opts: &InventoryOptions) -> Result<Self> {
        let gpus = build_gpus(provider, opts)?;

        let switches = if opts.want_switches {
            build_switches(provider)?
        } else {
            Vec::new()
        };

        let cpus = if opts.want_cpus {
            build_cpus(provider)?
        } else {
            Vec::new()
        };

        let inventory = Self {
            gpus,
            switches,
            cpus,
            gpu_filter: opts.gpu_filter.clone(),
            switch_filter: opts.switch_filter.clone(),
            cpu_filter: opts.cpu_filter.clone(),
        };
        inventory.verify_filters()?;

        info!(
            gpus = inventory.gpus.len(),
            switches = inventory.switches.len(),
            cpus = inventory.cpus.len(),
            "Device inventory built"
        );
        Ok(inventory)
    }

    /// Every explicitly listed id in a ranged filter must exist in the
    /// discovered topology. Flex filters are always accepted.
    fn verify_filters(&self) -> Result<()> {
        if let DeviceFilter::Ranged { major, minor } = &self.gpu_filter {
            for id in major.iter().filter(|&&id| id != RANGE_ALL) {
                if !self.gpus.iter().any(|g| g.device.gpu_id as i32 == *id) {
                    bail!("couldn't find requested GPU id {id}");
                }
            }
            for id in minor.iter().filter(|&&id| id != RANGE_ALL) {
                let found = self
                    .gpus
                    .iter()
                    .flat_map(|g| &g.instances)
                    .any(|i| i.entity_id as i32 == *id);
                if !found {
                    bail!("couldn't find requested GPU instance id {id}");
                }
            }
        }
        if let DeviceFilter::Ranged { major, minor } = &self.switch_filter {
            for id in major.iter().filter(|&&id| id != RANGE_ALL) {
                if !self.switches.iter().any(|s| s.entity_id as i32 == *id) {
                    bail!("couldn't find requested NvSwitch id {id}");
                }
            }
            for id in minor.iter().filter(|&&id| id != RANGE_ALL) {
                let found = self
                    .switches
                    .iter()
                    .flat_map(|s| &s.links)
                    .any(|l| l.index as i32 == *id);
                if !found {
                    bail!("couldn't find requested NvLink id {id}");
                }
            }
        }
        if let DeviceFilter::Ranged { major, minor } = &self.cpu_filter {
            for id in major.iter().filter(|&&id| id != RANGE_ALL) {
                if !self.cpus.iter().any(|c| c.entity_id as i32 == *id) {
                    bail!("couldn't find requested CPU id {id}");
                }
            }
            for id in minor.iter().filter(|&&id| id != RANGE_ALL) {
                let found = self
                    .cpus
                    .iter()
                    .flat_map(|c| &c.core_ids)
                    .any(|core| *core as i32 == *id);
                if !found {
                    bail!("couldn't find requested CPU core id {id}");
                }
            }
        }
        Ok(())
    }

    pub fn gpu_by_id(&self, gpu_id: EntityId) -> Option<&GpuInfo> {
        self.gpus.iter().find(|g| g.device.gpu_id == gpu_id)
    }

    pub fn gpu_index_by_uuid(&self, uuid: &str) -> Option<EntityId> {
        self.gpus
            .iter()
            .find(|g| g.device.uuid == uuid)
            .map(|g| g.device.gpu_id)
    }

    // Watch-membership predicates. Absent ids are never watched.

    pub fn is_switch_watched(&self, switch_id: EntityId) -> bool {
        match &self.switch_filter {
            DeviceFilter::Flex => true,
            f => f.major_is_all() || f.major_contains(switch_id),
        }
    }

    pub fn is_link_watched(&self, link_index: u32, switch_id: EntityId) -> bool {
        if !self.is_switch_watched(switch_id) {
            return false;
        }
        if self.switch_filter.minor_is_all() || matches!(self.switch_filter, DeviceFilter::Flex) {
            return true;
        }
        let exists = self
            .switches
            .iter()
            .filter(|s| s.entity_id == switch_id)
            .flat_map(|s| &s.links)
            .any(|l| l.index == link_index);
        exists && self.switch_filter.minor_contains(link_index)
    }

    pub fn is_cpu_watched(&self, cpu_id: EntityId) -> bool {
        if !self.cpus.iter().any(|c| c.entity_id == cpu_id) {
            return false;
        }
        match &self.cpu_filter {
            DeviceFilter::Flex => true,
            f => f.major_is_all() || f.major_contains(cpu_id),
        }
    }

    pub fn is_core_watched(&self, core_id: EntityId, cpu_id: EntityId) -> bool {
        if !self.is_cpu_watched(cpu_id) {
            return false;
        }
        if self.cpu_filter.minor_is_all() || matches!(self.cpu_filter, DeviceFilter::Flex) {
            return true;
        }
        self.cpu_filter.minor_contains(core_id)
    }

    /// Entities a collector for `class` should visit, in inventory order.
    pub fn monitored_entities(&self, class: EntityClass) -> Vec<MonitoredEntity> {
        match class {
            EntityClass::Gpu => self.monitored_gpus(),
            EntityClass::Switch => self
                .switches
                .iter()
                .filter(|s| self.is_switch_watched(s.entity_id))
                .map(|s| MonitoredEntity::plain(EntityClass::Switch, s.entity_id))
                .collect(),
            EntityClass::Link => self.monitored_links(),
            EntityClass::Cpu => self
                .cpus
                .iter()
                .filter(|c| self.is_cpu_watched(c.entity_id))
                .map(|c| MonitoredEntity::plain(EntityClass::Cpu, c.entity_id))
                .collect(),
            EntityClass::CpuCore => self
                .cpus
                .iter()
                .flat_map(|cpu| {
                    cpu.core_ids
                        .iter()
                        .filter(|core| self.is_core_watched(**core, cpu.entity_id))
                        .map(|core| {
                            let mut entity =
                                MonitoredEntity::plain(EntityClass::CpuCore, *core);
                            entity.parent_id = Some(cpu.entity_id);
                            entity
                        })
                        .collect::<Vec<_>>()
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// GPU monitoring has three shapes: flex (GPU or its instances when MIG
    /// is enabled), all (GPUs only), ranged (listed GPUs plus listed
    /// instances).
    fn monitored_gpus(&self) -> Vec<MonitoredEntity> {
        let mut monitored = Vec::new();
        match &self.gpu_filter {
            DeviceFilter::Flex => {
                for gpu in &self.gpus {
                    if gpu.mig_enabled {
                        for instance in &gpu.instances {
                            monitored.push(MonitoredEntity::gpu_instance(gpu, instance));
                        }
                    } else {
                        monitored.push(MonitoredEntity::gpu(gpu));
                    }
                }
            }
            filter @ DeviceFilter::Ranged { major, minor } => {
                if filter.major_is_all() {
                    for gpu in &self.gpus {
                        monitored.push(MonitoredEntity::gpu(gpu));
                    }
                } else {
                    for id in major {
                        if let Some(gpu) = self.gpu_by_id(*id as EntityId) {
                            monitored.push(MonitoredEntity::gpu(gpu));
                        }
                    }
                }
                if filter.minor_is_all() {
                    for gpu in &self.gpus {
                        for instance in &gpu.instances {
                            monitored.push(MonitoredEntity::gpu_instance(gpu, instance));
                        }
                    }
                } else {
                    for id in minor {
                        for gpu in &self.gpus {
                            for instance in &gpu.instances {
                                if instance.entity_id as i32 == *id {
                                    monitored
                                        .push(MonitoredEntity::gpu_instance(gpu, instance));
                                }
                            }
                        }
                    }
                }
            }
        }
        monitored
    }

    fn monitored_links(&self) -> Vec<MonitoredEntity> {
        let mut monitored = Vec::new();
        for switch in &self.switches {
            for link in &switch.links {
                if link.state != LinkState::Up {
                    continue;
                }
                if !self.is_link_watched(link.index, switch.entity_id) {
                    continue;
                }
                let mut entity = MonitoredEntity::plain(EntityClass::Link, link.index);
                entity.parent_id = Some(switch.entity_id);
                monitored.push(entity);
            }
        }
        monitored
    }
}

fn build_gpus(provider: &dyn DcgmApi, opts: &InventoryOptions) -> Result<Vec<GpuInfo>> {
    let count = provider.device_count().map_err(anyhow::Error::from)?;

    let mut gpus = Vec::with_capacity(count as usize);
    for gpu_id in 0..count {
        let device = match provider.device_info(gpu_id) {
            Ok(device) => device,
            Err(_) if opts.use_fake_gpus => DeviceIdentity {
                gpu_id,
                uuid: format!("fake{}", gpu_id + 1),
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };
        gpus.push(GpuInfo {
            device,
            mig_enabled: false,
            instances: Vec::new(),
        });
    }

    attach_mig_hierarchy(provider, &mut gpus)?;
    resolve_profile_names(provider, &mut gpus)?;
    Ok(gpus)
}

fn attach_mig_hierarchy(provider: &dyn DcgmApi, gpus: &mut [GpuInfo]) -> Result<()> {
    let hierarchy = provider.mig_hierarchy().map_err(anyhow::Error::from)?;

    for entry in hierarchy.entries {
        match entry.parent.class {
            EntityClass::Gpu => {
                let Some(gpu) = gpus.iter_mut().find(|g| g.device.gpu_id == entry.parent.id)
                else {
                    continue;
                };
                gpu.mig_enabled = true;
                gpu.instances.push(GpuInstanceInfo {
                    entity_id: entry.entity.id,
                    parent_gpu_id: entry.parent.id,
                    nvml_instance_id: entry.info.nvml_instance_id,
                    profile_id: entry.info.nvml_profile_id,
                    slices: entry.info.nvml_profile_slices,
                    profile_name: String::new(),
                    compute_instance_ids: Vec::new(),
                });
            }
            EntityClass::GpuInstance => {
                // Hierarchy entries arrive parent-first: attach the compute
                // instance to the newest instance of the recorded GPU.
                let Some(gpu) = gpus
                    .iter_mut()
                    .find(|g| g.device.gpu_id == entry.info.nvml_gpu_index)
                else {
                    continue;
                };
                if let Some(instance) = gpu.instances.last_mut() {
                    instance.compute_instance_ids.push(entry.entity.id);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Fetch `DCGM_FI_DEV_NAME` for every assembled GPU instance and store it as
/// the profile name. Misses are aggregated into one deterministic error.
fn resolve_profile_names(provider: &dyn DcgmApi, gpus: &mut [GpuInfo]) -> Result<()> {
    let mut missing: Vec<EntityId> = Vec::new();

    for gpu in gpus.iter_mut() {
        for instance in gpu.instances.iter_mut() {
            let entity = EntityPair::new(EntityClass::GpuInstance, instance.entity_id);
            let samples = provider
                .entity_latest_values(entity, &[fields::DCGM_FI_DEV_NAME])
                .unwrap_or_default();
            let name = samples.into_iter().find_map(|s| match s.value {
                FieldValue::Str(name) if !fields::is_str_blank(&name) => Some(name),
                _ => None,
            });
            match name {
                Some(name) => instance.profile_name = name,
                None => missing.push(instance.entity_id),
            }
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort_unstable();
        let ids: Vec<String> = missing.iter().map(|id| id.to_string()).collect();
        bail!(
            "couldn't find profile names for GPU instances: {}",
            ids.join(", ")
        )
    }
}

fn build_switches(provider: &dyn DcgmApi) -> Result<Vec<SwitchInfo>> {
    let ids = provider
        .entity_group_entities(EntityClass::Switch)
        .map_err(anyhow::Error::from)?;
    if ids.is_empty() {
        bail!("no switches to monitor");
    }

    let links = provider.nvlink_status().map_err(anyhow::Error::from)?;
    Ok(ids
        .into_iter()
        .map(|entity_id| SwitchInfo {
            entity_id,
            links: links
                .iter()
                .filter(|l| l.parent_class == EntityClass::Switch && l.parent_id == entity_id)
                .cloned()
                .collect(),
        })
        .collect())
}

fn build_cpus(provider: &dyn DcgmApi) -> Result<Vec<CpuInfo>> {
    let hierarchy = provider.cpu_hierarchy().map_err(anyhow::Error::from)?;
    if hierarchy.cpus.is_empty() {
        bail!("no CPUs to monitor");
    }
    Ok(hierarchy
        .cpus
        .iter()
        .map(|cpu| CpuInfo {
            entity_id: cpu.cpu_id,
            core_ids: cpu.core_ids(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcgm::mock::MockDcgm;
    use crate::dcgm::types::{CpuEntry, MigEntityInfo, MigEntry};

    fn mig_entry(
        class: EntityClass,
        entity_id: EntityId,
        parent: EntityPair,
        gpu_index: u32,
        instance_id: u32,
    ) -> MigEntry {
        MigEntry {
            entity: EntityPair::new(class, entity_id),
            parent,
            info: MigEntityInfo {
                gpu_uuid: String::new(),
                nvml_gpu_index: gpu_index,
                nvml_instance_id: instance_id,
                nvml_compute_instance_id: 0,
                nvml_profile_id: 19,
                nvml_profile_slices: 1,
            },
        }
    }

    fn gpu_opts(filter: DeviceFilter) -> InventoryOptions {
        InventoryOptions {
            gpu_filter: filter,
            ..Default::default()
        }
    }

    #[test]
    fn builds_plain_gpus_in_enumeration_order() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "0000:17:00.0");
        mock.add_gpu(1, "GPU-bbb", "NVIDIA A100", "0000:65:00.0");

        let inv = DeviceInventory::build(&mock, &gpu_opts(DeviceFilter::all())).unwrap();
        assert_eq!(inv.gpus.len(), 2);
        assert_eq!(inv.gpus[0].device.uuid, "GPU-aaa");
        assert!(!inv.gpus[0].mig_enabled);
        assert_eq!(inv.gpus[1].device_string(), "nvidia1");
    }

    #[test]
    fn synthesizes_fake_gpus_when_device_info_fails() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA T400 4GB", "");
        mock.fail_device_info();

        let opts = InventoryOptions {
            use_fake_gpus: true,
            ..Default::default()
        };
        let inv = DeviceInventory::build(&mock, &opts).unwrap();
        assert_eq!(inv.gpus.len(), 1);
        assert_eq!(inv.gpus[0].device.uuid, "fake1");
        assert_eq!(inv.gpus[0].device.gpu_id, 0);

        // Without the flag the same failure is fatal.
        let err = DeviceInventory::build(&mock, &gpu_opts(DeviceFilter::all())).unwrap_err();
        assert!(err.to_string().contains("device_info"));
    }

    #[test]
    fn mig_hierarchy_attaches_instances_and_profile_names() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        mock.add_mig_entry(mig_entry(
            EntityClass::GpuInstance,
            11,
            EntityPair::new(EntityClass::Gpu, 0),
            0,
            3,
        ));
        mock.add_mig_entry(mig_entry(
            EntityClass::ComputeInstance,
            21,
            EntityPair::new(EntityClass::GpuInstance, 11),
            0,
            3,
        ));
        mock.set_latest(
            EntityClass::GpuInstance,
            11,
            fields::DCGM_FI_DEV_NAME,
            FieldValue::Str("1g.10gb".into()),
        );

        let inv = DeviceInventory::build(&mock, &gpu_opts(DeviceFilter::all())).unwrap();
        let gpu = &inv.gpus[0];
        assert!(gpu.mig_enabled);
        assert_eq!(gpu.instances.len(), 1);
        let instance = &gpu.instances[0];
        assert_eq!(instance.entity_id, 11);
        assert_eq!(instance.nvml_instance_id, 3);
        assert_eq!(instance.profile_name, "1g.10gb");
        assert_eq!(instance.compute_instance_ids, vec![21]);
    }

    #[test]
    fn missing_profile_names_aggregate_sorted() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        mock.add_mig_entry(mig_entry(
            EntityClass::GpuInstance,
            12,
            EntityPair::new(EntityClass::Gpu, 0),
            0,
            1,
        ));
        mock.add_mig_entry(mig_entry(
            EntityClass::GpuInstance,
            5,
            EntityPair::new(EntityClass::Gpu, 0),
            0,
            0,
        ));

        let err = DeviceInventory::build(&mock, &gpu_opts(DeviceFilter::all())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "couldn't find profile names for GPU instances: 5, 12"
        );
    }

    #[test]
    fn builds_switches_with_their_own_links_only() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        mock.set_switches(vec![5]);
        mock.set_links(vec![
            NvLinkStatus {
                parent_class: EntityClass::Switch,
                parent_id: 5,
                index: 0,
                state: LinkState::Up,
            },
            NvLinkStatus {
                parent_class: EntityClass::Switch,
                parent_id: 6,
                index: 1,
                state: LinkState::Up,
            },
            NvLinkStatus {
                parent_class: EntityClass::Gpu,
                parent_id: 5,
                index: 2,
                state: LinkState::Up,
            },
        ]);
        let opts = InventoryOptions {
            want_switches: true,
            ..Default::default()
        };
        let inv = DeviceInventory::build(&mock, &opts).unwrap();
        assert_eq!(inv.switches.len(), 1);
        assert_eq!(inv.switches[0].entity_id, 5);
        assert_eq!(inv.switches[0].links.len(), 1);
        assert_eq!(inv.switches[0].links[0].index, 0);
    }

    #[test]
    fn no_switches_is_an_error_when_switches_wanted() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        let opts = InventoryOptions {
            want_switches: true,
            ..Default::default()
        };
        let err = DeviceInventory::build(&mock, &opts).unwrap_err();
        assert_eq!(err.to_string(), "no switches to monitor");
    }

    #[test]
    fn builds_cpu_topology_from_hierarchy() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        mock.set_cpus(vec![
            CpuEntry {
                cpu_id: 0,
                owned_cores_bitmask: vec![0b111],
            },
            CpuEntry {
                cpu_id: 1,
                owned_cores_bitmask: vec![0, 0b1],
            },
        ]);
        let opts = InventoryOptions {
            want_cpus: true,
            ..Default::default()
        };
        let inv = DeviceInventory::build(&mock, &opts).unwrap();
        assert_eq!(inv.cpus.len(), 2);
        assert_eq!(inv.cpus[0].core_ids, vec![0, 1, 2]);
        assert_eq!(inv.cpus[1].core_ids, vec![64]);
    }

    #[test]
    fn no_cpus_is_an_error_when_cpus_wanted() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        let opts = InventoryOptions {
            want_cpus: true,
            ..Default::default()
        };
        let err = DeviceInventory::build(&mock, &opts).unwrap_err();
        assert_eq!(err.to_string(), "no CPUs to monitor");
    }

    #[test]
    fn ranged_filter_with_unknown_gpu_fails_verification() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        let filter = DeviceFilter::Ranged {
            major: vec![0, 7],
            minor: vec![],
        };
        let err = DeviceInventory::build(&mock, &gpu_opts(filter)).unwrap_err();
        assert_eq!(err.to_string(), "couldn't find requested GPU id 7");
    }

    #[test]
    fn flex_filter_skips_verification() {
        let mock = MockDcgm::new();
        mock.add_gpu(0, "GPU-aaa", "NVIDIA A100", "");
        DeviceInventory::build(&mock, &gpu_opts(DeviceFilter::Flex)).unwrap();
    }

    fn switch_inventory() -> DeviceInventory {
        let link = |parent_id, index, state| NvLinkStatus {
            parent_class: EntityClass::Switch,
            parent_id,
            index,
            state,
        };
        DeviceInventory {
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
            switch_filter: DeviceFilter::Ranged {
                major: vec![0],
                minor: vec![RANGE_ALL],
            },
            ..Default::default()
        }
    }

    #[test]
    fn switch_and_link_predicates() {
        let inv = switch_inventory();
        assert!(inv.is_switch_watched(0));
        assert!(!inv.is_switch_watched(1));
        // Absent switch id: not watched.
        assert!(!inv.is_switch_watched(9));
        assert!(inv.is_link_watched(0, 0));
        assert!(!inv.is_link_watched(0, 1));
    }

    #[test]
    fn monitored_links_require_up_state() {
        let inv = switch_inventory();
        let links = inv.monitored_entities(EntityClass::Link);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].entity.id, 0);
        assert_eq!(links[0].parent_id, Some(0));
    }

    #[test]
    fn cpu_and_core_predicates() {
        let inv = DeviceInventory {
            cpus: vec![CpuInfo {
                entity_id: 0,
                core_ids: vec![0, 1, 2, 3],
            }],
            cpu_filter: DeviceFilter::Ranged {
                major: vec![RANGE_ALL],
                minor: vec![1, 2],
            },
            ..Default::default()
        };
        assert!(inv.is_cpu_watched(0));
        assert!(!inv.is_cpu_watched(1)); // absent
        assert!(inv.is_core_watched(1, 0));
        assert!(!inv.is_core_watched(0, 0));

        let cores = inv.monitored_entities(EntityClass::CpuCore);
        assert_eq!(cores.len(), 2);
        assert_eq!(cores[0].entity.id, 1);
        assert_eq!(cores[0].parent_id, Some(0));
    }

    fn mig_inventory() -> DeviceInventory {
        let instance = |entity_id, parent, nvml_id| GpuInstanceInfo {
            entity_id,
            parent_gpu_id: parent,
            nvml_instance_id: nvml_id,
            profile_id: 19,
            slices: 1,
            profile_name: "1g.10gb".into(),
            compute_instance_ids: vec![],
        };
        DeviceInventory {
            gpus: vec![
                GpuInfo {
                    device: DeviceIdentity {
                        gpu_id: 0,
                        uuid: "GPU-aaa".into(),
                        ..Default::default()
                    },
                    mig_enabled: true,
                    instances: vec![instance(11, 0, 0), instance(12, 0, 1)],
                },
                GpuInfo {
                    device: DeviceIdentity {
                        gpu_id: 1,
                        uuid: "GPU-bbb".into(),
                        ..Default::default()
                    },
                    mig_enabled: false,
                    instances: vec![],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn flex_shape_prefers_instances_on_mig_gpus() {
        let mut inv = mig_inventory();
        inv.gpu_filter = DeviceFilter::Flex;
        let monitored = inv.monitored_entities(EntityClass::Gpu);
        assert_eq!(monitored.len(), 3);
        assert_eq!(monitored[0].entity.class, EntityClass::GpuInstance);
        assert_eq!(monitored[0].entity.id, 11);
        assert_eq!(monitored[2].entity.class, EntityClass::Gpu);
        assert_eq!(monitored[2].entity.id, 1);
    }

    #[test]
    fn all_shape_ignores_instances() {
        let mut inv = mig_inventory();
        inv.gpu_filter = DeviceFilter::all();
        let monitored = inv.monitored_entities(EntityClass::Gpu);
        assert_eq!(monitored.len(), 2);
        assert!(monitored
            .iter()
            .all(|m| m.entity.class == EntityClass::Gpu));
    }

    #[test]
    fn ranged_shape_emits_listed_gpus_and_instances() {
        let mut inv = mig_inventory();
        inv.gpu_filter = DeviceFilter::Ranged {
            major: vec![1],
            minor: vec![12],
        };
        let monitored = inv.monitored_entities(EntityClass::Gpu);
        assert_eq!(monitored.len(), 2);
        assert_eq!(monitored[0].entity, EntityPair::new(EntityClass::Gpu, 1));
        assert_eq!(
            monitored[1].entity,
            EntityPair::new(EntityClass::GpuInstance, 12)
        );
        assert_eq!(
            monitored[1].instance.as_ref().unwrap().profile_name,
            "1g.10gb"
        );
    }

    #[test]
    fn filter_parsing() {
        assert_eq!("f".parse::<DeviceFilter>().unwrap(), DeviceFilter::Flex);
        assert_eq!(
            "0,1:2".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::Ranged {
                major: vec![0, 1],
                minor: vec![2],
            }
        );
        assert_eq!(
            "-1".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::Ranged {
                major: vec![-1],
                minor: vec![],
            }
        );
        assert!("x,y".parse::<DeviceFilter>().is_err());
    }
}
