use thiserror::Error;

/// Entity classes exposed by the host engine. Numeric values follow the
/// native `dcgm_field_entity_group_t` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum EntityClass {
    None = 0,
    Gpu = 1,
    VGpu = 2,
    Switch = 3,
    GpuInstance = 4,
    ComputeInstance = 5,
    Link = 6,
    Cpu = 7,
    CpuCore = 8,
}

impl EntityClass {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Gpu,
            2 => Self::VGpu,
            3 => Self::Switch,
            4 => Self::GpuInstance,
            5 => Self::ComputeInstance,
            6 => Self::Link,
            7 => Self::Cpu,
            8 => Self::CpuCore,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Short name used in group names and log lines.
    pub fn tag(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gpu => "gpu",
            Self::VGpu => "vgpu",
            Self::Switch => "nvswitch",
            Self::GpuInstance => "gpu-instance",
            Self::ComputeInstance => "compute-instance",
            Self::Link => "nvlink",
            Self::Cpu => "cpu",
            Self::CpuCore => "cpu-core",
        }
    }
}

impl std::fmt::Display for EntityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

pub type EntityId = u32;

/// (class, id) address of one monitored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityPair {
    pub class: EntityClass,
    pub id: EntityId,
}

impl EntityPair {
    pub fn new(class: EntityClass, id: EntityId) -> Self {
        Self { class, id }
    }
}

/// Opaque handle to a host-engine entity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub u64);

/// Opaque handle to a host-engine field group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldGroupHandle(pub u64);

/// Built-in group containing every GPU known to the host engine.
pub const GROUP_ALL_GPUS: GroupHandle = GroupHandle(0x7fffffff);

/// Hard limit on entities per group enforced by the host engine.
pub const GROUP_MAX_ENTITIES: usize = 64;

/// A single sample as returned by latest-value and values-since queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub field_id: u16,
    pub value: FieldValue,
    /// Native status code for this datum; zero means OK.
    pub status: i32,
    pub timestamp_us: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int64(i64),
    Double(f64),
    Str(String),
    Blob,
}

/// A sample tagged with the entity it was observed on (values-since path).
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySample {
    pub entity: EntityPair,
    pub sample: Sample,
}

/// Per-field metadata from the native field table.
#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub field_id: u16,
    pub entity_level: EntityClass,
    pub value_type: FieldValueType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValueType {
    Int64,
    Double,
    Str,
    Blob,
    Timestamp,
}

/// Identity attributes of one physical GPU.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub gpu_id: EntityId,
    pub uuid: String,
    pub pci_bus_id: String,
    pub model_name: String,
}

/// One entry of the MIG hierarchy as reported by the host engine.
#[derive(Debug, Clone)]
pub struct MigEntry {
    pub entity: EntityPair,
    pub parent: EntityPair,
    pub info: MigEntityInfo,
}

#[derive(Debug, Clone, Default)]
pub struct MigEntityInfo {
    pub gpu_uuid: String,
    pub nvml_gpu_index: u32,
    pub nvml_instance_id: u32,
    pub nvml_compute_instance_id: u32,
    pub nvml_profile_id: u32,
    pub nvml_profile_slices: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MigHierarchy {
    pub entries: Vec<MigEntry>,
}

/// CPU topology: each CPU owns a set of cores encoded as a bitmask over
/// fixed-width words, least significant word first.
#[derive(Debug, Clone, Default)]
pub struct CpuHierarchy {
    pub cpus: Vec<CpuEntry>,
}

#[derive(Debug, Clone)]
pub struct CpuEntry {
    pub cpu_id: EntityId,
    pub owned_cores_bitmask: Vec<u64>,
}

impl CpuEntry {
    /// Decode the owned-core bitmask into an ordered list of core ids.
    pub fn core_ids(&self) -> Vec<EntityId> {
        let mut cores = Vec::new();
        for (word_idx, word) in self.owned_cores_bitmask.iter().enumerate() {
            for bit in 0..64 {
                if word & (1u64 << bit) != 0 {
                    cores.push((word_idx * 64 + bit) as EntityId);
                }
            }
        }
        cores
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    NotSupported,
    Disabled,
    Down,
    Up,
}

impl LinkState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Disabled,
            2 => Self::Down,
            3 => Self::Up,
            _ => Self::NotSupported,
        }
    }
}

/// State of one NVLink, addressed by (parent entity, link index).
#[derive(Debug, Clone)]
pub struct NvLinkStatus {
    pub parent_class: EntityClass,
    pub parent_id: EntityId,
    pub index: u32,
    pub state: LinkState,
}

/// Native return codes we give distinct handling to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode(pub i32);

impl ReturnCode {
    pub const OK: i32 = 0;
    pub const NOT_CONFIGURED: i32 = -5;
    pub const NO_DATA: i32 = -12;
    pub const CONNECTION_NOT_VALID: i32 = -19;
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            0 => "ok",
            -1 => "bad parameter",
            -3 => "generic error",
            -5 => "not configured",
            -6 => "not supported",
            -7 => "init error",
            -8 => "NVML error",
            -10 => "version mismatch",
            -11 => "unknown field",
            -12 => "no data",
            -14 => "not watched",
            -15 => "no permission",
            -16 => "GPU is lost",
            -19 => "connection not valid",
            -22 => "max limit reached",
            _ => return write!(f, "code {}", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DcgmError {
    /// Fatal: the host-engine connection is gone and cannot recover.
    #[error("DCGM connection is not valid")]
    ConnectionNotValid,

    /// Benign on destroy paths: the handle is already gone.
    #[error("not configured")]
    NotConfigured,

    #[error("unknown field id {0}")]
    UnknownField(u16),

    #[error("{op}: {code}")]
    Api { op: &'static str, code: ReturnCode },

    #[error("libdcgm unavailable: {0}")]
    LibUnavailable(String),
}

impl DcgmError {
    /// Map a native return code to the error taxonomy for the given call.
    pub fn from_code(op: &'static str, code: i32) -> Self {
        match code {
            ReturnCode::CONNECTION_NOT_VALID => Self::ConnectionNotValid,
            ReturnCode::NOT_CONFIGURED => Self::NotConfigured,
            _ => Self::Api {
                op,
                code: ReturnCode(code),
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionNotValid)
    }
}

pub type DcgmResult<T> = Result<T, DcgmError>;
