//! Canned-data provider for unit tests. Implements [`DcgmApi`] directly and
//! records group/watch traffic so tests can assert on it.

use std::collections::HashMap;
use std::sync::Mutex;

use super::fields;
use super::types::{
    CpuEntry, CpuHierarchy, DcgmError, DcgmResult, DeviceIdentity, EntityClass, EntityId,
    EntityPair, EntitySample, FieldGroupHandle, FieldMeta, FieldValue, GroupHandle, MigEntry,
    MigHierarchy, NvLinkStatus, Sample,
};
use super::DcgmApi;

#[derive(Debug, Clone, PartialEq)]
pub struct WatchRecord {
    pub field_group: FieldGroupHandle,
    pub group: GroupHandle,
    pub update_period_us: i64,
    pub keep_age_s: f64,
    pub keep_samples: i32,
}

#[derive(Default)]
struct State {
    devices: Vec<DeviceIdentity>,
    fail_enumeration: bool,
    fail_device_info: bool,
    mig: Vec<MigEntry>,
    cpus: Vec<CpuEntry>,
    links: Vec<NvLinkStatus>,
    entities: HashMap<EntityClass, Vec<EntityId>>,
    latest: HashMap<(EntityClass, EntityId, u16), Sample>,
    link_latest: HashMap<(u32, EntityId, u16), Sample>,
    since_samples: Vec<EntitySample>,
    since_cursor: i64,

    next_handle: u64,
    groups: Vec<(GroupHandle, String)>,
    destroyed_groups: Vec<GroupHandle>,
    field_groups: Vec<(FieldGroupHandle, String, Vec<u16>)>,
    destroyed_field_groups: Vec<FieldGroupHandle>,
    group_members: HashMap<GroupHandle, Vec<EntityPair>>,
    link_members: HashMap<GroupHandle, Vec<(u32, EntityId)>>,
    watches: Vec<WatchRecord>,
    update_all_calls: u32,

    fail_group_create: bool,
    fail_field_group_create: bool,
    not_configured_on_destroy: bool,
}

pub struct MockDcgm {
    state: Mutex<State>,
}

impl Default for MockDcgm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDcgm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                ..State::default()
            }),
        }
    }

    pub fn add_gpu(&self, gpu_id: EntityId, uuid: &str, model_name: &str, pci_bus_id: &str) {
        let mut s = self.state.lock().unwrap();
        s.devices.push(DeviceIdentity {
            gpu_id,
            uuid: uuid.into(),
            model_name: model_name.into(),
            pci_bus_id: pci_bus_id.into(),
        });
        s.entities
            .entry(EntityClass::Gpu)
            .or_default()
            .push(gpu_id);
    }

    pub fn fail_enumeration(&self) {
        self.state.lock().unwrap().fail_enumeration = true;
    }

    /// Keep `device_count` working but fail every `device_info` call, the
    /// shape that triggers fake-GPU synthesis.
    pub fn fail_device_info(&self) {
        self.state.lock().unwrap().fail_device_info = true;
    }

    pub fn add_mig_entry(&self, entry: MigEntry) {
        self.state.lock().unwrap().mig.push(entry);
    }

    pub fn set_cpus(&self, cpus: Vec<CpuEntry>) {
        let mut s = self.state.lock().unwrap();
        let ids = cpus.iter().map(|c| c.cpu_id).collect();
        s.entities.insert(EntityClass::Cpu, ids);
        s.cpus = cpus;
    }

    pub fn set_switches(&self, ids: Vec<EntityId>) {
        self.state
            .lock()
            .unwrap()
            .entities
            .insert(EntityClass::Switch, ids);
    }

    pub fn set_links(&self, links: Vec<NvLinkStatus>) {
        self.state.lock().unwrap().links = links;
    }

    pub fn set_latest(&self, class: EntityClass, id: EntityId, field_id: u16, value: FieldValue) {
        self.state.lock().unwrap().latest.insert(
            (class, id, field_id),
            Sample {
                field_id,
                value,
                status: 0,
                timestamp_us: 0,
            },
        );
    }

    pub fn set_link_latest(
        &self,
        link_index: u32,
        parent_id: EntityId,
        field_id: u16,
        value: FieldValue,
    ) {
        self.state.lock().unwrap().link_latest.insert(
            (link_index, parent_id, field_id),
            Sample {
                field_id,
                value,
                status: 0,
                timestamp_us: 0,
            },
        );
    }

    pub fn push_since_sample(
        &self,
        entity: EntityPair,
        field_id: u16,
        value: FieldValue,
        status: i32,
    ) {
        self.state.lock().unwrap().since_samples.push(EntitySample {
            entity,
            sample: Sample {
                field_id,
                value,
                status,
                timestamp_us: 0,
            },
        });
    }

    pub fn fail_group_create(&self) {
        self.state.lock().unwrap().fail_group_create = true;
    }

    pub fn fail_field_group_create(&self) {
        self.state.lock().unwrap().fail_field_group_create = true;
    }

    pub fn not_configured_on_destroy(&self) {
        self.state.lock().unwrap().not_configured_on_destroy = true;
    }

    // Assertion accessors.

    pub fn watches(&self) -> Vec<WatchRecord> {
        self.state.lock().unwrap().watches.clone()
    }

    pub fn group_names(&self) -> Vec<String> {
        let s = self.state.lock().unwrap();
        s.groups.iter().map(|(_, name)| name.clone()).collect()
    }

    pub fn all_group_members(&self) -> Vec<Vec<EntityPair>> {
        let s = self.state.lock().unwrap();
        s.groups
            .iter()
            .map(|(h, _)| s.group_members.get(h).cloned().unwrap_or_default())
            .collect()
    }

    pub fn all_link_members(&self) -> Vec<Vec<(u32, EntityId)>> {
        let s = self.state.lock().unwrap();
        s.groups
            .iter()
            .map(|(h, _)| s.link_members.get(h).cloned().unwrap_or_default())
            .collect()
    }

    pub fn destroyed_groups(&self) -> Vec<GroupHandle> {
        self.state.lock().unwrap().destroyed_groups.clone()
    }

    pub fn destroyed_field_groups(&self) -> Vec<FieldGroupHandle> {
        self.state.lock().unwrap().destroyed_field_groups.clone()
    }

    pub fn created_group_handles(&self) -> Vec<GroupHandle> {
        let s = self.state.lock().unwrap();
        s.groups.iter().map(|(h, _)| *h).collect()
    }

    pub fn created_field_group_handles(&self) -> Vec<FieldGroupHandle> {
        let s = self.state.lock().unwrap();
        s.field_groups.iter().map(|(h, _, _)| *h).collect()
    }

    pub fn update_all_calls(&self) -> u32 {
        self.state.lock().unwrap().update_all_calls
    }
}

impl DcgmApi for MockDcgm {
    fn device_count(&self) -> DcgmResult<u32> {
        let s = self.state.lock().unwrap();
        if s.fail_enumeration {
            return Err(DcgmError::Api {
                op: "dcgmGetAllSupportedDevices",
                code: super::types::ReturnCode(-3),
            });
        }
        Ok(s.devices.len() as u32)
    }

    fn device_info(&self, gpu_id: EntityId) -> DcgmResult<DeviceIdentity> {
        let s = self.state.lock().unwrap();
        if s.fail_enumeration || s.fail_device_info {
            return Err(DcgmError::Api {
                op: "device_info",
                code: super::types::ReturnCode(-3),
            });
        }
        s.devices
            .iter()
            .find(|d| d.gpu_id == gpu_id)
            .cloned()
            .ok_or(DcgmError::Api {
                op: "device_info",
                code: super::types::ReturnCode(-1),
            })
    }

    fn mig_hierarchy(&self) -> DcgmResult<MigHierarchy> {
        Ok(MigHierarchy {
            entries: self.state.lock().unwrap().mig.clone(),
        })
    }

    fn cpu_hierarchy(&self) -> DcgmResult<CpuHierarchy> {
        Ok(CpuHierarchy {
            cpus: self.state.lock().unwrap().cpus.clone(),
        })
    }

    fn nvlink_status(&self) -> DcgmResult<Vec<NvLinkStatus>> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    fn entity_group_entities(&self, class: EntityClass) -> DcgmResult<Vec<EntityId>> {
        let s = self.state.lock().unwrap();
        Ok(s.entities.get(&class).cloned().unwrap_or_default())
    }

    fn field_meta(&self, field_id: u16) -> DcgmResult<FieldMeta> {
        fields::field_by_id(field_id)
            .map(|def| def.meta())
            .ok_or(DcgmError::UnknownField(field_id))
    }

    fn create_group(&self, name: &str) -> DcgmResult<GroupHandle> {
        let mut s = self.state.lock().unwrap();
        if s.fail_group_create {
            return Err(DcgmError::Api {
                op: "dcgmGroupCreate",
                code: super::types::ReturnCode(-3),
            });
        }
        let handle = GroupHandle(s.next_handle);
        s.next_handle += 1;
        s.groups.push((handle, name.to_string()));
        Ok(handle)
    }

    fn destroy_group(&self, group: GroupHandle) -> DcgmResult<()> {
        let mut s = self.state.lock().unwrap();
        s.destroyed_groups.push(group);
        if s.not_configured_on_destroy {
            return Err(DcgmError::NotConfigured);
        }
        Ok(())
    }

    fn add_entity_to_group(&self, group: GroupHandle, entity: EntityPair) -> DcgmResult<()> {
        let mut s = self.state.lock().unwrap();
        s.group_members.entry(group).or_default().push(entity);
        Ok(())
    }

    fn add_link_entity_to_group(
        &self,
        group: GroupHandle,
        link_index: u32,
        parent_id: EntityId,
    ) -> DcgmResult<()> {
        let mut s = self.state.lock().unwrap();
        s.link_members
            .entry(group)
            .or_default()
            .push((link_index, parent_id));
        Ok(())
    }

    fn create_field_group(&self, name: &str, field_ids: &[u16]) -> DcgmResult<FieldGroupHandle> {
        let mut s = self.state.lock().unwrap();
        if s.fail_field_group_create {
            return Err(DcgmError::Api {
                op: "dcgmFieldGroupCreate",
                code: super::types::ReturnCode(-3),
            });
        }
        let handle = FieldGroupHandle(s.next_handle);
        s.next_handle += 1;
        s.field_groups
            .push((handle, name.to_string(), field_ids.to_vec()));
        Ok(handle)
    }

    fn destroy_field_group(&self, group: FieldGroupHandle) -> DcgmResult<()> {
        let mut s = self.state.lock().unwrap();
        s.destroyed_field_groups.push(group);
        if s.not_configured_on_destroy {
            return Err(DcgmError::NotConfigured);
        }
        Ok(())
    }

    fn watch_fields(
        &self,
        field_group: FieldGroupHandle,
        group: GroupHandle,
        update_period_us: i64,
        keep_age_s: f64,
        keep_samples: i32,
    ) -> DcgmResult<()> {
        self.state.lock().unwrap().watches.push(WatchRecord {
            field_group,
            group,
            update_period_us,
            keep_age_s,
            keep_samples,
        });
        Ok(())
    }

    fn entity_latest_values(
        &self,
        entity: EntityPair,
        field_ids: &[u16],
    ) -> DcgmResult<Vec<Sample>> {
        let s = self.state.lock().unwrap();
        Ok(field_ids
            .iter()
            .filter_map(|fid| s.latest.get(&(entity.class, entity.id, *fid)).cloned())
            .collect())
    }

    fn link_latest_values(
        &self,
        link_index: u32,
        parent_id: EntityId,
        field_ids: &[u16],
    ) -> DcgmResult<Vec<Sample>> {
        let s = self.state.lock().unwrap();
        Ok(field_ids
            .iter()
            .filter_map(|fid| s.link_latest.get(&(link_index, parent_id, *fid)).cloned())
            .collect())
    }

    fn values_since(
        &self,
        _group: GroupHandle,
        _field_group: FieldGroupHandle,
        _since_us: i64,
    ) -> DcgmResult<(Vec<EntitySample>, i64)> {
        let s = self.state.lock().unwrap();
        Ok((s.since_samples.clone(), s.since_cursor))
    }

    fn update_all_fields(&self) -> DcgmResult<()> {
        self.state.lock().unwrap().update_all_calls += 1;
        Ok(())
    }

    fn shutdown(&self) -> DcgmResult<()> {
        Ok(())
    }
}
