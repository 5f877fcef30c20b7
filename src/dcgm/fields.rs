//! Field-id constants and metadata mirroring the native field table.
//!
//! Only the subset the exporter can usefully scrape is listed; unknown names
//! in a catalog file are rejected during parsing rather than at watch time.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::OnceLock;

use super::types::{EntityClass, FieldMeta, FieldValueType};

pub const DCGM_FI_DRIVER_VERSION: u16 = 1;
pub const DCGM_FI_NVML_VERSION: u16 = 2;

pub const DCGM_FI_DEV_NAME: u16 = 50;
pub const DCGM_FI_DEV_BRAND: u16 = 51;
pub const DCGM_FI_DEV_SERIAL: u16 = 53;
pub const DCGM_FI_DEV_UUID: u16 = 54;
pub const DCGM_FI_DEV_MINOR_NUMBER: u16 = 55;
pub const DCGM_FI_DEV_PCI_BUSID: u16 = 57;

pub const DCGM_FI_DEV_SM_CLOCK: u16 = 100;
pub const DCGM_FI_DEV_MEM_CLOCK: u16 = 101;
pub const DCGM_FI_DEV_VIDEO_CLOCK: u16 = 102;
pub const DCGM_FI_DEV_CLOCKS_EVENT_REASONS: u16 = 112;

pub const DCGM_FI_DEV_MEMORY_TEMP: u16 = 140;
pub const DCGM_FI_DEV_GPU_TEMP: u16 = 150;

pub const DCGM_FI_DEV_POWER_USAGE: u16 = 155;
pub const DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION: u16 = 156;

pub const DCGM_FI_DEV_FAN_SPEED: u16 = 190;

pub const DCGM_FI_DEV_PCIE_TX_THROUGHPUT: u16 = 200;
pub const DCGM_FI_DEV_PCIE_RX_THROUGHPUT: u16 = 201;
pub const DCGM_FI_DEV_PCIE_REPLAY_COUNTER: u16 = 202;

pub const DCGM_FI_DEV_GPU_UTIL: u16 = 203;
pub const DCGM_FI_DEV_MEM_COPY_UTIL: u16 = 204;
pub const DCGM_FI_DEV_ENC_UTIL: u16 = 206;
pub const DCGM_FI_DEV_DEC_UTIL: u16 = 207;

pub const DCGM_FI_DEV_XID_ERRORS: u16 = 230;

pub const DCGM_FI_DEV_FB_TOTAL: u16 = 250;
pub const DCGM_FI_DEV_FB_FREE: u16 = 251;
pub const DCGM_FI_DEV_FB_USED: u16 = 252;
pub const DCGM_FI_DEV_FB_RESERVED: u16 = 253;

pub const DCGM_FI_DEV_ECC_SBE_VOL_TOTAL: u16 = 310;
pub const DCGM_FI_DEV_ECC_DBE_VOL_TOTAL: u16 = 311;
pub const DCGM_FI_DEV_ECC_SBE_AGG_TOTAL: u16 = 312;
pub const DCGM_FI_DEV_ECC_DBE_AGG_TOTAL: u16 = 313;

pub const DCGM_FI_DEV_VGPU_LICENSE_STATUS: u16 = 383;

pub const DCGM_FI_DEV_RETIRED_SBE: u16 = 390;
pub const DCGM_FI_DEV_RETIRED_DBE: u16 = 391;
pub const DCGM_FI_DEV_RETIRED_PENDING: u16 = 392;

pub const DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL: u16 = 449;

pub const DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX: u16 = 780;
pub const DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX: u16 = 781;
pub const DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT: u16 = 858;
pub const DCGM_FI_DEV_NVSWITCH_POWER: u16 = 859;

// Profiling (DCP) fields. Watching these requires the profiling module.
pub const DCGM_FI_PROF_GR_ENGINE_ACTIVE: u16 = 1001;
pub const DCGM_FI_PROF_SM_ACTIVE: u16 = 1002;
pub const DCGM_FI_PROF_SM_OCCUPANCY: u16 = 1003;
pub const DCGM_FI_PROF_PIPE_TENSOR_ACTIVE: u16 = 1004;
pub const DCGM_FI_PROF_DRAM_ACTIVE: u16 = 1005;
pub const DCGM_FI_PROF_PIPE_FP64_ACTIVE: u16 = 1006;
pub const DCGM_FI_PROF_PIPE_FP32_ACTIVE: u16 = 1007;
pub const DCGM_FI_PROF_PIPE_FP16_ACTIVE: u16 = 1008;
pub const DCGM_FI_PROF_PCIE_TX_BYTES: u16 = 1009;
pub const DCGM_FI_PROF_PCIE_RX_BYTES: u16 = 1010;
pub const DCGM_FI_PROF_NVLINK_TX_BYTES: u16 = 1011;
pub const DCGM_FI_PROF_NVLINK_RX_BYTES: u16 = 1012;

pub const DCGM_FI_DEV_CPU_UTIL_TOTAL: u16 = 1100;
pub const DCGM_FI_DEV_CPU_UTIL_USER: u16 = 1101;
pub const DCGM_FI_DEV_CPU_UTIL_NICE: u16 = 1102;
pub const DCGM_FI_DEV_CPU_UTIL_SYS: u16 = 1103;
pub const DCGM_FI_DEV_CPU_UTIL_IRQ: u16 = 1104;
pub const DCGM_FI_DEV_CPU_TEMP_CURRENT: u16 = 1110;
pub const DCGM_FI_DEV_CPU_CLOCK_CURRENT: u16 = 1120;
pub const DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT: u16 = 1130;
pub const DCGM_FI_DEV_CPU_POWER_LIMIT: u16 = 1131;
pub const DCGM_FI_DEV_CPU_VENDOR: u16 = 1140;
pub const DCGM_FI_DEV_CPU_MODEL: u16 = 1141;

/// Exporter-computed counters; ids chosen outside the native field space.
pub const DCGM_EXP_XID_ERRORS_COUNT: u16 = 9001;
pub const DCGM_EXP_CLOCK_EVENTS_COUNT: u16 = 9002;

/// Profiling fields live in this id range and need the DCP module enabled.
pub const DCP_FIELD_RANGE: Range<u16> = 1000..1100;

pub fn is_dcp_field(field_id: u16) -> bool {
    DCP_FIELD_RANGE.contains(&field_id)
}

// Blank-value sentinels substituted by the native library for datapoints it
// could not produce. Values at or above the base blank are all sentinels.
pub const INT64_BLANK: i64 = 9223372036854775792;
pub const INT32_BLANK: i64 = 2147483632;
pub const FP64_BLANK: f64 = 140737488355328.0;
pub const STR_BLANK: &str = "<<<NULL>>>";
pub const STR_NOT_FOUND: &str = "<<<NOT_FOUND>>>";
pub const STR_NOT_SUPPORTED: &str = "<<<NOT_SUPPORTED>>>";
pub const STR_NOT_PERMISSIONED: &str = "<<<VIOLATION>>>";

pub fn is_int64_blank(v: i64) -> bool {
    v >= INT64_BLANK
}

pub fn is_fp64_blank(v: f64) -> bool {
    v >= FP64_BLANK
}

pub fn is_str_blank(v: &str) -> bool {
    matches!(
        v,
        STR_BLANK | STR_NOT_FOUND | STR_NOT_SUPPORTED | STR_NOT_PERMISSIONED
    )
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub id: u16,
    pub name: &'static str,
    pub value_type: FieldValueType,
    pub entity_level: EntityClass,
}

impl FieldDef {
    pub fn meta(&self) -> FieldMeta {
        FieldMeta {
            field_id: self.id,
            entity_level: self.entity_level,
            value_type: self.value_type,
        }
    }
}

macro_rules! field {
    ($id:ident, $ty:ident, $level:ident) => {
        FieldDef {
            id: $id,
            name: stringify!($id),
            value_type: FieldValueType::$ty,
            entity_level: EntityClass::$level,
        }
    };
}

/// The known-field table: every name the catalog parser accepts directly.
pub static KNOWN_FIELDS: &[FieldDef] = &[
    field!(DCGM_FI_DRIVER_VERSION, Str, None),
    field!(DCGM_FI_NVML_VERSION, Str, None),
    field!(DCGM_FI_DEV_NAME, Str, Gpu),
    field!(DCGM_FI_DEV_BRAND, Str, Gpu),
    field!(DCGM_FI_DEV_SERIAL, Str, Gpu),
    field!(DCGM_FI_DEV_UUID, Str, Gpu),
    field!(DCGM_FI_DEV_MINOR_NUMBER, Int64, Gpu),
    field!(DCGM_FI_DEV_PCI_BUSID, Str, Gpu),
    field!(DCGM_FI_DEV_SM_CLOCK, Int64, Gpu),
    field!(DCGM_FI_DEV_MEM_CLOCK, Int64, Gpu),
    field!(DCGM_FI_DEV_VIDEO_CLOCK, Int64, Gpu),
    field!(DCGM_FI_DEV_CLOCKS_EVENT_REASONS, Int64, Gpu),
    field!(DCGM_FI_DEV_MEMORY_TEMP, Int64, Gpu),
    field!(DCGM_FI_DEV_GPU_TEMP, Int64, Gpu),
    field!(DCGM_FI_DEV_POWER_USAGE, Double, Gpu),
    field!(DCGM_FI_DEV_TOTAL_ENERGY_CONSUMPTION, Int64, Gpu),
    field!(DCGM_FI_DEV_FAN_SPEED, Int64, Gpu),
    field!(DCGM_FI_DEV_PCIE_TX_THROUGHPUT, Int64, Gpu),
    field!(DCGM_FI_DEV_PCIE_RX_THROUGHPUT, Int64, Gpu),
    field!(DCGM_FI_DEV_PCIE_REPLAY_COUNTER, Int64, Gpu),
    field!(DCGM_FI_DEV_GPU_UTIL, Int64, Gpu),
    field!(DCGM_FI_DEV_MEM_COPY_UTIL, Int64, Gpu),
    field!(DCGM_FI_DEV_ENC_UTIL, Int64, Gpu),
    field!(DCGM_FI_DEV_DEC_UTIL, Int64, Gpu),
    field!(DCGM_FI_DEV_XID_ERRORS, Int64, Gpu),
    field!(DCGM_FI_DEV_FB_TOTAL, Int64, GpuInstance),
    field!(DCGM_FI_DEV_FB_FREE, Int64, GpuInstance),
    field!(DCGM_FI_DEV_FB_USED, Int64, GpuInstance),
    field!(DCGM_FI_DEV_FB_RESERVED, Int64, GpuInstance),
    field!(DCGM_FI_DEV_ECC_SBE_VOL_TOTAL, Int64, Gpu),
    field!(DCGM_FI_DEV_ECC_DBE_VOL_TOTAL, Int64, Gpu),
    field!(DCGM_FI_DEV_ECC_SBE_AGG_TOTAL, Int64, Gpu),
    field!(DCGM_FI_DEV_ECC_DBE_AGG_TOTAL, Int64, Gpu),
    field!(DCGM_FI_DEV_VGPU_LICENSE_STATUS, Int64, VGpu),
    field!(DCGM_FI_DEV_RETIRED_SBE, Int64, Gpu),
    field!(DCGM_FI_DEV_RETIRED_DBE, Int64, Gpu),
    field!(DCGM_FI_DEV_RETIRED_PENDING, Int64, Gpu),
    field!(DCGM_FI_DEV_NVLINK_BANDWIDTH_TOTAL, Int64, Gpu),
    field!(DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX, Int64, Link),
    field!(DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_RX, Int64, Link),
    field!(DCGM_FI_DEV_NVSWITCH_TEMPERATURE_CURRENT, Int64, Switch),
    field!(DCGM_FI_DEV_NVSWITCH_POWER, Int64, Switch),
    field!(DCGM_FI_PROF_GR_ENGINE_ACTIVE, Double, GpuInstance),
    field!(DCGM_FI_PROF_SM_ACTIVE, Double, GpuInstance),
    field!(DCGM_FI_PROF_SM_OCCUPANCY, Double, GpuInstance),
    field!(DCGM_FI_PROF_PIPE_TENSOR_ACTIVE, Double, GpuInstance),
    field!(DCGM_FI_PROF_DRAM_ACTIVE, Double, GpuInstance),
    field!(DCGM_FI_PROF_PIPE_FP64_ACTIVE, Double, GpuInstance),
    field!(DCGM_FI_PROF_PIPE_FP32_ACTIVE, Double, GpuInstance),
    field!(DCGM_FI_PROF_PIPE_FP16_ACTIVE, Double, GpuInstance),
    field!(DCGM_FI_PROF_PCIE_TX_BYTES, Int64, GpuInstance),
    field!(DCGM_FI_PROF_PCIE_RX_BYTES, Int64, GpuInstance),
    field!(DCGM_FI_PROF_NVLINK_TX_BYTES, Int64, GpuInstance),
    field!(DCGM_FI_PROF_NVLINK_RX_BYTES, Int64, GpuInstance),
    field!(DCGM_FI_DEV_CPU_UTIL_TOTAL, Double, CpuCore),
    field!(DCGM_FI_DEV_CPU_UTIL_USER, Double, CpuCore),
    field!(DCGM_FI_DEV_CPU_UTIL_NICE, Double, CpuCore),
    field!(DCGM_FI_DEV_CPU_UTIL_SYS, Double, CpuCore),
    field!(DCGM_FI_DEV_CPU_UTIL_IRQ, Double, CpuCore),
    field!(DCGM_FI_DEV_CPU_TEMP_CURRENT, Double, Cpu),
    field!(DCGM_FI_DEV_CPU_CLOCK_CURRENT, Int64, Cpu),
    field!(DCGM_FI_DEV_CPU_POWER_UTIL_CURRENT, Double, Cpu),
    field!(DCGM_FI_DEV_CPU_POWER_LIMIT, Double, Cpu),
    field!(DCGM_FI_DEV_CPU_VENDOR, Str, Cpu),
    field!(DCGM_FI_DEV_CPU_MODEL, Str, Cpu),
];

/// Names kept working after upstream renames. Resolved to the current id.
pub static LEGACY_ALIASES: &[(&str, u16)] = &[
    ("DCGM_FI_DEV_CLOCK_THROTTLE_REASONS", DCGM_FI_DEV_CLOCKS_EVENT_REASONS),
    ("DCGM_FI_DEV_ENC_UTILIZATION", DCGM_FI_DEV_ENC_UTIL),
    ("DCGM_FI_DEV_DEC_UTILIZATION", DCGM_FI_DEV_DEC_UTIL),
];

fn name_index() -> &'static HashMap<&'static str, &'static FieldDef> {
    static INDEX: OnceLock<HashMap<&'static str, &'static FieldDef>> = OnceLock::new();
    INDEX.get_or_init(|| KNOWN_FIELDS.iter().map(|f| (f.name, f)).collect())
}

fn id_index() -> &'static HashMap<u16, &'static FieldDef> {
    static INDEX: OnceLock<HashMap<u16, &'static FieldDef>> = OnceLock::new();
    INDEX.get_or_init(|| KNOWN_FIELDS.iter().map(|f| (f.id, f)).collect())
}

pub fn field_by_name(name: &str) -> Option<&'static FieldDef> {
    name_index().get(name).copied()
}

pub fn field_by_id(id: u16) -> Option<&'static FieldDef> {
    id_index().get(&id).copied()
}

pub fn legacy_alias(name: &str) -> Option<u16> {
    LEGACY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, id)| *id)
}
