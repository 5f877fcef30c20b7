//! MIG device-id resolution for the pod mapper.
//!
//! Old-style ids (`MIG-GPU-<uuid>/<gi>/<ci>`) carry the topology in the
//! string. New-style ids are bare MIG device UUIDs and need an NVML lookup
//! for the owning GPU and instance id; NVML is bound at runtime like the
//! DCGM client so nothing links against it at build time.

use std::ffi::{c_char, c_void, CString};
use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, bail, Result};
use libloading::Library;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigDeviceInfo {
    pub parent_uuid: String,
    pub gpu_instance_id: u32,
    pub compute_instance_id: Option<u32>,
}

/// Lookup from a kubelet MIG device id to its topology. Production uses
/// NVML; tests inject canned values.
pub trait MigResolver: Send + Sync {
    fn device_info(&self, device_id: &str) -> Result<MigDeviceInfo>;
}

/// Parse the old-style `MIG-GPU-<uuid>/<gi>/<ci>` encoding.
pub fn parse_legacy_mig_id(device_id: &str) -> Option<MigDeviceInfo> {
    let rest = device_id.strip_prefix("MIG-")?;
    if !rest.starts_with("GPU-") {
        return None;
    }
    let mut parts = rest.split('/');
    let parent_uuid = parts.next()?.to_string();
    let gpu_instance_id = parts.next()?.parse().ok()?;
    let compute_instance_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(MigDeviceInfo {
        parent_uuid,
        gpu_instance_id,
        compute_instance_id: Some(compute_instance_id),
    })
}

const NVML_LIB_NAMES: &[&str] = &["libnvidia-ml.so.1", "libnvidia-ml.so"];
const NVML_UUID_BUFFER: usize = 96;

type NvmlDevice = *mut c_void;

type InitFn = unsafe extern "C" fn() -> i32;
type HandleByUuidFn = unsafe extern "C" fn(*const c_char, *mut NvmlDevice) -> i32;
type InstanceIdFn = unsafe extern "C" fn(NvmlDevice, *mut u32) -> i32;
type ParentOfMigFn = unsafe extern "C" fn(NvmlDevice, *mut NvmlDevice) -> i32;
type UuidFn = unsafe extern "C" fn(NvmlDevice, *mut c_char, u32) -> i32;

struct NvmlApi {
    _lib: Library,
    init: InitFn,
    handle_by_uuid: HandleByUuidFn,
    gpu_instance_id: InstanceIdFn,
    compute_instance_id: InstanceIdFn,
    parent_of_mig: ParentOfMigFn,
    uuid: UuidFn,
}

impl NvmlApi {
    fn from_library(lib: Library) -> Result<Self> {
        // Fn pointers are copied out first so the symbol borrows end
        // before the library moves into the struct.
        let api = unsafe {
            let init: InitFn = *lib.get(b"nvmlInit_v2\0")?;
            let handle_by_uuid: HandleByUuidFn = *lib.get(b"nvmlDeviceGetHandleByUUID\0")?;
            let gpu_instance_id: InstanceIdFn = *lib.get(b"nvmlDeviceGetGpuInstanceId\0")?;
            let compute_instance_id: InstanceIdFn =
                *lib.get(b"nvmlDeviceGetComputeInstanceId\0")?;
            let parent_of_mig: ParentOfMigFn =
                *lib.get(b"nvmlDeviceGetDeviceHandleFromMigDeviceHandle\0")?;
            let uuid: UuidFn = *lib.get(b"nvmlDeviceGetUUID\0")?;
            NvmlApi {
                _lib: lib,
                init,
                handle_by_uuid,
                gpu_instance_id,
                compute_instance_id,
                parent_of_mig,
                uuid,
            }
        };
        unsafe {
            let code = (api.init)();
            if code != 0 {
                bail!("nvmlInit failed with code {code}");
            }
        }
        Ok(api)
    }

    fn load() -> Result<Self> {
        let mut last_err = String::new();
        for name in NVML_LIB_NAMES {
            match unsafe { Library::new(name) } {
                Ok(lib) => return Self::from_library(lib),
                Err(e) => last_err = format!("{name}: {e}"),
            }
        }
        bail!("NVML unavailable: {last_err}")
    }

    fn mig_device_info(&self, mig_uuid: &str) -> Result<MigDeviceInfo> {
        let uuid = CString::new(mig_uuid)?;
        unsafe {
            let mut device: NvmlDevice = std::ptr::null_mut();
            let code = (self.handle_by_uuid)(uuid.as_ptr(), &mut device);
            if code != 0 {
                bail!("no NVML device for uuid {mig_uuid} (code {code})");
            }

            let mut gpu_instance_id: u32 = 0;
            let code = (self.gpu_instance_id)(device, &mut gpu_instance_id);
            if code != 0 {
                bail!("{mig_uuid} is not a MIG device (code {code})");
            }

            let mut compute_instance_id: u32 = 0;
            let compute_instance_id = ((self.compute_instance_id)(
                device,
                &mut compute_instance_id,
            ) == 0)
                .then_some(compute_instance_id);

            let mut parent: NvmlDevice = std::ptr::null_mut();
            let code = (self.parent_of_mig)(device, &mut parent);
            if code != 0 {
                bail!("no parent device for MIG uuid {mig_uuid} (code {code})");
            }

            let mut buffer = [0 as c_char; NVML_UUID_BUFFER];
            let code = (self.uuid)(parent, buffer.as_mut_ptr(), NVML_UUID_BUFFER as u32);
            if code != 0 {
                bail!("could not read parent uuid for {mig_uuid} (code {code})");
            }
            let parent_uuid = buffer
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8 as char)
                .collect();

            Ok(MigDeviceInfo {
                parent_uuid,
                gpu_instance_id,
                compute_instance_id,
            })
        }
    }
}

/// NVML-backed resolver. The library is loaded on first use and the result
/// (including failure) is cached for the process lifetime.
#[derive(Default)]
pub struct NvmlMigResolver {
    api: OnceLock<Option<NvmlApi>>,
    load_error: Mutex<Option<String>>,
}

impl NvmlMigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn api(&self) -> Option<&NvmlApi> {
        self.api
            .get_or_init(|| match NvmlApi::load() {
                Ok(api) => Some(api),
                Err(e) => {
                    *self.load_error.lock().unwrap() = Some(e.to_string());
                    None
                }
            })
            .as_ref()
    }
}

impl MigResolver for NvmlMigResolver {
    fn device_info(&self, device_id: &str) -> Result<MigDeviceInfo> {
        if let Some(info) = parse_legacy_mig_id(device_id) {
            return Ok(info);
        }
        let Some(mig_uuid) = device_id.strip_prefix("MIG-") else {
            bail!("{device_id} is not a MIG device id");
        };
        let api = self.api().ok_or_else(|| {
            let err = self.load_error.lock().unwrap();
            anyhow!(
                "NVML unavailable: {}",
                err.as_deref().unwrap_or("unknown error")
            )
        })?;
        api.mig_device_info(mig_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_mig_id() {
        let info = parse_legacy_mig_id("MIG-GPU-b8ea3855-276c-c9cb-b366-c6fa655957c5/1/0").unwrap();
        assert_eq!(info.parent_uuid, "GPU-b8ea3855-276c-c9cb-b366-c6fa655957c5");
        assert_eq!(info.gpu_instance_id, 1);
        assert_eq!(info.compute_instance_id, Some(0));
    }

    #[test]
    fn rejects_new_style_and_malformed_ids() {
        assert!(parse_legacy_mig_id("MIG-b8ea3855-276c-c9cb-b366-c6fa655957c5").is_none());
        assert!(parse_legacy_mig_id("GPU-b8ea3855/1/0").is_none());
        assert!(parse_legacy_mig_id("MIG-GPU-b8ea3855/1").is_none());
        assert!(parse_legacy_mig_id("MIG-GPU-b8ea3855/1/0/9").is_none());
    }

    #[test]
    fn resolver_handles_legacy_ids_without_nvml() {
        let resolver = NvmlMigResolver::new();
        let info = resolver
            .device_info("MIG-GPU-b8ea3855-276c-c9cb-b366-c6fa655957c5/3/0")
            .unwrap();
        assert_eq!(info.gpu_instance_id, 3);
    }
}
