//! `libdcgm.so` binding, resolved at runtime.
//!
//! The library is opened with `libloading` so the exporter builds and its
//! tests run on machines without the native library installed. Symbols are
//! copied out of the [`Library`] once at connect time; the `Library` itself
//! is kept alive for the lifetime of the client.

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Mutex;

use libloading::Library;

use super::fields;
use super::types::{
    CpuEntry, CpuHierarchy, DcgmError, DcgmResult, DeviceIdentity, EntityClass, EntityId,
    EntityPair, EntitySample, FieldGroupHandle, FieldMeta, FieldValue, GroupHandle, LinkState,
    MigEntityInfo, MigEntry, MigHierarchy, NvLinkStatus, ReturnCode, Sample,
};
use super::DcgmApi;

const LIB_NAMES: &[&str] = &["libdcgm.so.4", "libdcgm.so.3", "libdcgm.so"];

// Limits from the native headers.
const MAX_NUM_DEVICES: usize = 32;
const MAX_NUM_SWITCHES: usize = 12;
const MAX_LINKS_PER_GPU: usize = 18;
const MAX_LINKS_PER_NVSWITCH: usize = 64;
const MAX_HIERARCHY_INFO: usize = 844;
const MAX_NUM_CPUS: usize = 8;
const CPU_CORE_BITMASK_WORDS: usize = 16;
const MAX_ENTITIES_PER_QUERY: usize = 64;
const MAX_STR_LENGTH: usize = 256;
const BLOB_LENGTH: usize = 4096;

const OPMODE_AUTO: u32 = 1;
const GROUP_EMPTY: u32 = 1;
const FV_FLAG_LIVE_DATA: u32 = 1;
const WAIT_FOR_UPDATE: i32 = 1;

// Field type tags carried in value structs.
const FT_DOUBLE: u16 = b'd' as u16;
const FT_INT64: u16 = b'i' as u16;
const FT_STRING: u16 = b's' as u16;
const FT_TIMESTAMP: u16 = b't' as u16;

/// Native version stamp: struct size in the low bytes, version in the top.
fn make_version<T>(version: u32) -> u32 {
    (std::mem::size_of::<T>() as u32) | (version << 24)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GroupEntityPair {
    entity_group_id: u32,
    entity_id: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
union FieldValueUnion {
    i64_: i64,
    dbl: f64,
    str_: [c_char; MAX_STR_LENGTH],
    blob: [u8; BLOB_LENGTH],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FieldValueV1 {
    version: u32,
    field_id: u16,
    field_type: u16,
    status: i32,
    ts: i64,
    value: FieldValueUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FieldValueV2 {
    version: u32,
    entity_group_id: u32,
    entity_id: u32,
    field_id: u16,
    field_type: u16,
    status: i32,
    unused: u32,
    ts: i64,
    value: FieldValueUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ConnectParamsV2 {
    version: u32,
    persist_after_disconnect: u32,
    timeout_ms: u32,
    address_is_unix_socket: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MigEntityInfoRaw {
    gpu_uuid: [c_char; 128],
    nvml_gpu_index: u32,
    nvml_instance_id: u32,
    nvml_compute_instance_id: u32,
    nvml_mig_profile_id: u32,
    nvml_profile_slices: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MigHierarchyInfoV2 {
    entity: GroupEntityPair,
    parent: GroupEntityPair,
    info: MigEntityInfoRaw,
}

#[repr(C)]
struct MigHierarchyV2 {
    version: u32,
    count: u32,
    entity_list: [MigHierarchyInfoV2; MAX_HIERARCHY_INFO],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CpuOwnedCoresV1 {
    version: u32,
    bitmask: [u64; CPU_CORE_BITMASK_WORDS],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CpuHierarchyCpuV1 {
    cpu_id: u32,
    owned_cores: CpuOwnedCoresV1,
}

#[repr(C)]
struct CpuHierarchyV1 {
    version: u32,
    num_cpus: u32,
    cpus: [CpuHierarchyCpuV1; MAX_NUM_CPUS],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct NvLinkGpuLinkStatus {
    entity_id: u32,
    link_state: [u32; MAX_LINKS_PER_GPU],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct NvLinkSwitchLinkStatus {
    entity_id: u32,
    link_state: [u32; MAX_LINKS_PER_NVSWITCH],
}

#[repr(C)]
struct NvLinkStatusV4 {
    version: u32,
    num_gpus: u32,
    gpus: [NvLinkGpuLinkStatus; MAX_NUM_DEVICES],
    num_switches: u32,
    switches: [NvLinkSwitchLinkStatus; MAX_NUM_SWITCHES],
}

type EnumCb = unsafe extern "C" fn(u32, u32, *mut FieldValueV1, i32, *mut c_void) -> i32;

#[allow(clippy::type_complexity)]
struct Api {
    init: unsafe extern "C" fn() -> i32,
    shutdown: unsafe extern "C" fn() -> i32,
    start_embedded: unsafe extern "C" fn(u32, *mut u64) -> i32,
    stop_embedded: unsafe extern "C" fn(u64) -> i32,
    connect_v2: unsafe extern "C" fn(*const c_char, *mut ConnectParamsV2, *mut u64) -> i32,
    disconnect: unsafe extern "C" fn(u64) -> i32,
    get_all_supported_devices: unsafe extern "C" fn(u64, *mut u32, *mut i32) -> i32,
    get_entity_group_entities: unsafe extern "C" fn(u64, u32, *mut u32, *mut i32, u32) -> i32,
    get_gpu_instance_hierarchy: unsafe extern "C" fn(u64, *mut MigHierarchyV2) -> i32,
    get_cpu_hierarchy: unsafe extern "C" fn(u64, *mut CpuHierarchyV1) -> i32,
    get_nvlink_link_status: unsafe extern "C" fn(u64, *mut NvLinkStatusV4) -> i32,
    group_create: unsafe extern "C" fn(u64, u32, *const c_char, *mut u64) -> i32,
    group_destroy: unsafe extern "C" fn(u64, u64) -> i32,
    group_add_entity: unsafe extern "C" fn(u64, u64, u32, u32) -> i32,
    field_group_create: unsafe extern "C" fn(u64, i32, *const u16, *const c_char, *mut u64) -> i32,
    field_group_destroy: unsafe extern "C" fn(u64, u64) -> i32,
    watch_fields: unsafe extern "C" fn(u64, u64, u64, i64, f64, i32) -> i32,
    update_all_fields: unsafe extern "C" fn(u64, i32) -> i32,
    entities_get_latest_values: unsafe extern "C" fn(
        u64,
        *const GroupEntityPair,
        u32,
        *const u16,
        u32,
        u32,
        *mut FieldValueV2,
    ) -> i32,
    get_values_since:
        unsafe extern "C" fn(u64, u64, u64, i64, *mut i64, EnumCb, *mut c_void) -> i32,
}

impl Api {
    fn load(lib: &Library) -> Result<Self, libloading::Error> {
        // Fn pointers are Copy; the caller keeps the Library alive.
        unsafe {
            Ok(Self {
                init: *lib.get(b"dcgmInit\0")?,
                shutdown: *lib.get(b"dcgmShutdown\0")?,
                start_embedded: *lib.get(b"dcgmStartEmbedded\0")?,
                stop_embedded: *lib.get(b"dcgmStopEmbedded\0")?,
                connect_v2: *lib.get(b"dcgmConnect_v2\0")?,
                disconnect: *lib.get(b"dcgmDisconnect\0")?,
                get_all_supported_devices: *lib.get(b"dcgmGetAllSupportedDevices\0")?,
                get_entity_group_entities: *lib.get(b"dcgmGetEntityGroupEntities\0")?,
                get_gpu_instance_hierarchy: *lib.get(b"dcgmGetGpuInstanceHierarchy\0")?,
                get_cpu_hierarchy: *lib.get(b"dcgmGetCpuHierarchy\0")?,
                get_nvlink_link_status: *lib.get(b"dcgmGetNvLinkLinkStatus\0")?,
                group_create: *lib.get(b"dcgmGroupCreate\0")?,
                group_destroy: *lib.get(b"dcgmGroupDestroy\0")?,
                group_add_entity: *lib.get(b"dcgmGroupAddEntity\0")?,
                field_group_create: *lib.get(b"dcgmFieldGroupCreate\0")?,
                field_group_destroy: *lib.get(b"dcgmFieldGroupDestroy\0")?,
                watch_fields: *lib.get(b"dcgmWatchFields\0")?,
                update_all_fields: *lib.get(b"dcgmUpdateAllFields\0")?,
                entities_get_latest_values: *lib.get(b"dcgmEntitiesGetLatestValues\0")?,
                get_values_since: *lib.get(b"dcgmGetValuesSince_v2\0")?,
            })
        }
    }
}

enum Mode {
    Embedded,
    Remote,
}

/// Live host-engine client. All native calls are serialized behind one lock;
/// the handle itself is valid from any thread.
pub struct LiveDcgm {
    _lib: Library,
    api: Api,
    handle: u64,
    mode: Mode,
    call_lock: Mutex<()>,
}

fn open_library() -> DcgmResult<Library> {
    let mut last_err = String::new();
    for name in LIB_NAMES {
        match unsafe { Library::new(name) } {
            Ok(lib) => return Ok(lib),
            Err(e) => last_err = format!("{name}: {e}"),
        }
    }
    Err(DcgmError::LibUnavailable(last_err))
}

fn check(op: &'static str, code: i32) -> DcgmResult<()> {
    if code == ReturnCode::OK {
        Ok(())
    } else {
        Err(DcgmError::from_code(op, code))
    }
}

fn cstr_field(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn convert_value(field_type: u16, value: &FieldValueUnion) -> FieldValue {
    unsafe {
        match field_type {
            FT_INT64 | FT_TIMESTAMP => FieldValue::Int64(value.i64_),
            FT_DOUBLE => FieldValue::Double(value.dbl),
            FT_STRING => FieldValue::Str(cstr_field(&value.str_)),
            _ => FieldValue::Blob,
        }
    }
}

fn convert_v1(fv: &FieldValueV1) -> Sample {
    Sample {
        field_id: fv.field_id,
        value: convert_value(fv.field_type, &fv.value),
        status: fv.status,
        timestamp_us: fv.ts,
    }
}

fn convert_v2(fv: &FieldValueV2) -> Sample {
    Sample {
        field_id: fv.field_id,
        value: convert_value(fv.field_type, &fv.value),
        status: fv.status,
        timestamp_us: fv.ts,
    }
}

/// NvLink entities are addressed by a packed id: parent class in the top
/// byte, link index below it, parent id in the low half.
fn link_entity_id(link_index: u32, parent_id: EntityId) -> u32 {
    (EntityClass::Switch.as_raw() << 24) | ((link_index & 0xff) << 16) | (parent_id & 0xffff)
}

unsafe extern "C" fn values_since_cb(
    entity_group: u32,
    entity_id: u32,
    values: *mut FieldValueV1,
    num_values: i32,
    user_data: *mut c_void,
) -> i32 {
    let out = &mut *(user_data as *mut Vec<EntitySample>);
    let class = EntityClass::from_raw(entity_group).unwrap_or(EntityClass::None);
    for i in 0..num_values as usize {
        let fv = &*values.add(i);
        out.push(EntitySample {
            entity: EntityPair::new(class, entity_id),
            sample: convert_v1(fv),
        });
    }
    0
}

impl LiveDcgm {
    pub fn start_embedded() -> DcgmResult<Self> {
        let lib = open_library()?;
        let api = Api::load(&lib).map_err(|e| DcgmError::LibUnavailable(e.to_string()))?;

        unsafe {
            check("dcgmInit", (api.init)())?;
            let mut handle: u64 = 0;
            check("dcgmStartEmbedded", (api.start_embedded)(OPMODE_AUTO, &mut handle))?;
            Ok(Self {
                _lib: lib,
                api,
                handle,
                mode: Mode::Embedded,
                call_lock: Mutex::new(()),
            })
        }
    }

    pub fn connect_remote(address: &str) -> DcgmResult<Self> {
        let lib = open_library()?;
        let api = Api::load(&lib).map_err(|e| DcgmError::LibUnavailable(e.to_string()))?;

        let addr = CString::new(address).map_err(|_| DcgmError::LibUnavailable(
            "remote address contains a NUL byte".into(),
        ))?;
        let mut params = ConnectParamsV2 {
            version: make_version::<ConnectParamsV2>(2),
            persist_after_disconnect: 0,
            timeout_ms: 5000,
            address_is_unix_socket: u32::from(address.starts_with('/')),
        };

        unsafe {
            check("dcgmInit", (api.init)())?;
            let mut handle: u64 = 0;
            check(
                "dcgmConnect_v2",
                (api.connect_v2)(addr.as_ptr(), &mut params, &mut handle),
            )?;
            Ok(Self {
                _lib: lib,
                api,
                handle,
                mode: Mode::Remote,
                call_lock: Mutex::new(()),
            })
        }
    }

    fn latest_values(
        &self,
        entities: &[GroupEntityPair],
        field_ids: &[u16],
    ) -> DcgmResult<Vec<Sample>> {
        let _guard = self.call_lock.lock().unwrap();
        let count = entities.len() * field_ids.len();
        let mut values = vec![
            FieldValueV2 {
                version: make_version::<FieldValueV2>(2),
                entity_group_id: 0,
                entity_id: 0,
                field_id: 0,
                field_type: 0,
                status: 0,
                unused: 0,
                ts: 0,
                value: FieldValueUnion { i64_: 0 },
            };
            count
        ];

        unsafe {
            check(
                "dcgmEntitiesGetLatestValues",
                (self.api.entities_get_latest_values)(
                    self.handle,
                    entities.as_ptr(),
                    entities.len() as u32,
                    field_ids.as_ptr(),
                    field_ids.len() as u32,
                    FV_FLAG_LIVE_DATA,
                    values.as_mut_ptr(),
                ),
            )?;
        }

        Ok(values.iter().map(convert_v2).collect())
    }
}

impl DcgmApi for LiveDcgm {
    fn device_count(&self) -> DcgmResult<u32> {
        let _guard = self.call_lock.lock().unwrap();
        let mut ids = [0u32; MAX_NUM_DEVICES];
        let mut count: i32 = 0;
        unsafe {
            check(
                "dcgmGetAllSupportedDevices",
                (self.api.get_all_supported_devices)(self.handle, ids.as_mut_ptr(), &mut count),
            )?;
        }
        Ok(count as u32)
    }

    fn device_info(&self, gpu_id: EntityId) -> DcgmResult<DeviceIdentity> {
        let entity = GroupEntityPair {
            entity_group_id: EntityClass::Gpu.as_raw(),
            entity_id: gpu_id,
        };
        let field_ids = [
            fields::DCGM_FI_DEV_UUID,
            fields::DCGM_FI_DEV_NAME,
            fields::DCGM_FI_DEV_PCI_BUSID,
        ];
        let samples = self.latest_values(&[entity], &field_ids)?;

        let mut identity = DeviceIdentity {
            gpu_id,
            ..Default::default()
        };
        for sample in samples {
            let FieldValue::Str(s) = sample.value else {
                continue;
            };
            if fields::is_str_blank(&s) {
                continue;
            }
            match sample.field_id {
                fields::DCGM_FI_DEV_UUID => identity.uuid = s,
                fields::DCGM_FI_DEV_NAME => identity.model_name = s,
                fields::DCGM_FI_DEV_PCI_BUSID => identity.pci_bus_id = s,
                _ => {}
            }
        }
        Ok(identity)
    }

    fn mig_hierarchy(&self) -> DcgmResult<MigHierarchy> {
        let _guard = self.call_lock.lock().unwrap();
        let mut raw: Box<MigHierarchyV2> = Box::new(unsafe { std::mem::zeroed() });
        raw.version = make_version::<MigHierarchyV2>(2);

        unsafe {
            check(
                "dcgmGetGpuInstanceHierarchy",
                (self.api.get_gpu_instance_hierarchy)(self.handle, &mut *raw),
            )?;
        }

        let mut entries = Vec::with_capacity(raw.count as usize);
        for item in raw.entity_list.iter().take(raw.count as usize) {
            let (Some(class), Some(parent_class)) = (
                EntityClass::from_raw(item.entity.entity_group_id),
                EntityClass::from_raw(item.parent.entity_group_id),
            ) else {
                continue;
            };
            entries.push(MigEntry {
                entity: EntityPair::new(class, item.entity.entity_id),
                parent: EntityPair::new(parent_class, item.parent.entity_id),
                info: MigEntityInfo {
                    gpu_uuid: cstr_field(&item.info.gpu_uuid),
                    nvml_gpu_index: item.info.nvml_gpu_index,
                    nvml_instance_id: item.info.nvml_instance_id,
                    nvml_compute_instance_id: item.info.nvml_compute_instance_id,
                    nvml_profile_id: item.info.nvml_mig_profile_id,
                    nvml_profile_slices: item.info.nvml_profile_slices,
                },
            });
        }
        Ok(MigHierarchy { entries })
    }

    fn cpu_hierarchy(&self) -> DcgmResult<CpuHierarchy> {
        let _guard = self.call_lock.lock().unwrap();
        let mut raw: Box<CpuHierarchyV1> = Box::new(unsafe { std::mem::zeroed() });
        raw.version = make_version::<CpuHierarchyV1>(1);

        unsafe {
            check(
                "dcgmGetCpuHierarchy",
                (self.api.get_cpu_hierarchy)(self.handle, &mut *raw),
            )?;
        }

        let cpus = raw
            .cpus
            .iter()
            .take(raw.num_cpus as usize)
            .map(|cpu| CpuEntry {
                cpu_id: cpu.cpu_id,
                owned_cores_bitmask: cpu.owned_cores.bitmask.to_vec(),
            })
            .collect();
        Ok(CpuHierarchy { cpus })
    }

    fn nvlink_status(&self) -> DcgmResult<Vec<NvLinkStatus>> {
        let _guard = self.call_lock.lock().unwrap();
        let mut raw: Box<NvLinkStatusV4> = Box::new(unsafe { std::mem::zeroed() });
        raw.version = make_version::<NvLinkStatusV4>(4);

        unsafe {
            check(
                "dcgmGetNvLinkLinkStatus",
                (self.api.get_nvlink_link_status)(self.handle, &mut *raw),
            )?;
        }

        let mut links = Vec::new();
        for gpu in raw.gpus.iter().take(raw.num_gpus as usize) {
            for (index, state) in gpu.link_state.iter().enumerate() {
                links.push(NvLinkStatus {
                    parent_class: EntityClass::Gpu,
                    parent_id: gpu.entity_id,
                    index: index as u32,
                    state: LinkState::from_raw(*state),
                });
            }
        }
        for switch in raw.switches.iter().take(raw.num_switches as usize) {
            for (index, state) in switch.link_state.iter().enumerate() {
                links.push(NvLinkStatus {
                    parent_class: EntityClass::Switch,
                    parent_id: switch.entity_id,
                    index: index as u32,
                    state: LinkState::from_raw(*state),
                });
            }
        }
        Ok(links)
    }

    fn entity_group_entities(&self, class: EntityClass) -> DcgmResult<Vec<EntityId>> {
        let _guard = self.call_lock.lock().unwrap();
        let mut ids = [0u32; MAX_ENTITIES_PER_QUERY];
        let mut count: i32 = ids.len() as i32;
        unsafe {
            check(
                "dcgmGetEntityGroupEntities",
                (self.api.get_entity_group_entities)(
                    self.handle,
                    class.as_raw(),
                    ids.as_mut_ptr(),
                    &mut count,
                    0,
                ),
            )?;
        }
        Ok(ids[..count as usize].to_vec())
    }

    fn field_meta(&self, field_id: u16) -> DcgmResult<FieldMeta> {
        // The static table mirrors the native one for every field the
        // catalog can resolve; no native call needed.
        fields::field_by_id(field_id)
            .map(|def| def.meta())
            .ok_or(DcgmError::UnknownField(field_id))
    }

    fn create_group(&self, name: &str) -> DcgmResult<GroupHandle> {
        let _guard = self.call_lock.lock().unwrap();
        let cname = CString::new(name).unwrap_or_default();
        let mut group: u64 = 0;
        unsafe {
            check(
                "dcgmGroupCreate",
                (self.api.group_create)(self.handle, GROUP_EMPTY, cname.as_ptr(), &mut group),
            )?;
        }
        Ok(GroupHandle(group))
    }

    fn destroy_group(&self, group: GroupHandle) -> DcgmResult<()> {
        let _guard = self.call_lock.lock().unwrap();
        unsafe { check("dcgmGroupDestroy", (self.api.group_destroy)(self.handle, group.0)) }
    }

    fn add_entity_to_group(&self, group: GroupHandle, entity: EntityPair) -> DcgmResult<()> {
        let _guard = self.call_lock.lock().unwrap();
        unsafe {
            check(
                "dcgmGroupAddEntity",
                (self.api.group_add_entity)(
                    self.handle,
                    group.0,
                    entity.class.as_raw(),
                    entity.id,
                ),
            )
        }
    }

    fn add_link_entity_to_group(
        &self,
        group: GroupHandle,
        link_index: u32,
        parent_id: EntityId,
    ) -> DcgmResult<()> {
        let _guard = self.call_lock.lock().unwrap();
        unsafe {
            check(
                "dcgmGroupAddEntity",
                (self.api.group_add_entity)(
                    self.handle,
                    group.0,
                    EntityClass::Link.as_raw(),
                    link_entity_id(link_index, parent_id),
                ),
            )
        }
    }

    fn create_field_group(&self, name: &str, field_ids: &[u16]) -> DcgmResult<FieldGroupHandle> {
        let _guard = self.call_lock.lock().unwrap();
        let cname = CString::new(name).unwrap_or_default();
        let mut handle: u64 = 0;
        unsafe {
            check(
                "dcgmFieldGroupCreate",
                (self.api.field_group_create)(
                    self.handle,
                    field_ids.len() as i32,
                    field_ids.as_ptr(),
                    cname.as_ptr(),
                    &mut handle,
                ),
            )?;
        }
        Ok(FieldGroupHandle(handle))
    }

    fn destroy_field_group(&self, group: FieldGroupHandle) -> DcgmResult<()> {
        let _guard = self.call_lock.lock().unwrap();
        unsafe {
            check(
                "dcgmFieldGroupDestroy",
                (self.api.field_group_destroy)(self.handle, group.0),
            )
        }
    }

    fn watch_fields(
        &self,
        field_group: FieldGroupHandle,
        group: GroupHandle,
        update_period_us: i64,
        keep_age_s: f64,
        keep_samples: i32,
    ) -> DcgmResult<()> {
        let _guard = self.call_lock.lock().unwrap();
        unsafe {
            check(
                "dcgmWatchFields",
                (self.api.watch_fields)(
                    self.handle,
                    group.0,
                    field_group.0,
                    update_period_us,
                    keep_age_s,
                    keep_samples,
                ),
            )
        }
    }

    fn entity_latest_values(
        &self,
        entity: EntityPair,
        field_ids: &[u16],
    ) -> DcgmResult<Vec<Sample>> {
        let pair = GroupEntityPair {
            entity_group_id: entity.class.as_raw(),
            entity_id: entity.id,
        };
        self.latest_values(&[pair], field_ids)
    }

    fn link_latest_values(
        &self,
        link_index: u32,
        parent_id: EntityId,
        field_ids: &[u16],
    ) -> DcgmResult<Vec<Sample>> {
        let pair = GroupEntityPair {
            entity_group_id: EntityClass::Link.as_raw(),
            entity_id: link_entity_id(link_index, parent_id),
        };
        self.latest_values(&[pair], field_ids)
    }

    fn values_since(
        &self,
        group: GroupHandle,
        field_group: FieldGroupHandle,
        since_us: i64,
    ) -> DcgmResult<(Vec<EntitySample>, i64)> {
        let _guard = self.call_lock.lock().unwrap();
        let mut samples: Vec<EntitySample> = Vec::new();
        let mut next_since: i64 = 0;
        unsafe {
            check(
                "dcgmGetValuesSince_v2",
                (self.api.get_values_since)(
                    self.handle,
                    group.0,
                    field_group.0,
                    since_us,
                    &mut next_since,
                    values_since_cb,
                    &mut samples as *mut Vec<EntitySample> as *mut c_void,
                ),
            )?;
        }
        Ok((samples, next_since))
    }

    fn update_all_fields(&self) -> DcgmResult<()> {
        let _guard = self.call_lock.lock().unwrap();
        unsafe {
            check(
                "dcgmUpdateAllFields",
                (self.api.update_all_fields)(self.handle, WAIT_FOR_UPDATE),
            )
        }
    }

    fn shutdown(&self) -> DcgmResult<()> {
        let _guard = self.call_lock.lock().unwrap();
        unsafe {
            match self.mode {
                Mode::Embedded => check("dcgmStopEmbedded", (self.api.stop_embedded)(self.handle))?,
                Mode::Remote => check("dcgmDisconnect", (self.api.disconnect)(self.handle))?,
            }
            check("dcgmShutdown", (self.api.shutdown)())
        }
    }
}
