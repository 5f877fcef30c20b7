use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::inventory::DeviceFilter;
use crate::transform::kubernetes::DeviceIdType;

/// Field ids grouped by the profiling module; used to gate DCP counters.
#[derive(Debug, Clone, Default)]
pub struct MetricGroup {
    pub field_ids: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the counters CSV (env: DCGM_EXPORTER_COLLECTORS)
    pub collectors_file_path: PathBuf,

    /// Listen address, e.g. "0.0.0.0:9400" (env: DCGM_EXPORTER_LISTEN)
    pub address: String,

    /// Host-engine field update interval (env: DCGM_EXPORTER_INTERVAL)
    pub collect_interval_ms: u64,

    /// Enable the Kubernetes pod mapper (env: DCGM_EXPORTER_KUBERNETES)
    pub kubernetes: bool,

    /// Device-id column used for pod lookups (env:
    /// DCGM_EXPORTER_KUBERNETES_GPU_ID_TYPE, "uid" or "device-name")
    pub kubernetes_gpu_id_type: DeviceIdType,

    /// Allow profiling (DCP) fields (env: DCGM_EXPORTER_COLLECT_DCP)
    pub collect_dcp: bool,

    /// Legacy label namespace: `uuid` key and `pod_name`-style attributes
    /// (env: DCGM_EXPORTER_USE_OLD_NAMESPACE)
    pub use_old_namespace: bool,

    /// Connect to a standalone host engine instead of starting an embedded
    /// one; implied by a remote address being configured
    pub use_remote: bool,

    /// Host-engine address, `host:port` or a Unix socket path
    /// (env: DCGM_EXPORTER_REMOTE_HOSTENGINE_INFO)
    pub remote_address: Option<String>,

    /// GPU / switch / CPU selection (env: DCGM_EXPORTER_GPU_DEVICES,
    /// DCGM_EXPORTER_SWITCH_DEVICES, DCGM_EXPORTER_CPU_DEVICES; "f" for
    /// flex, otherwise "majors[:minors]" with -1 for all)
    pub gpu_filter: DeviceFilter,
    pub switch_filter: DeviceFilter,
    pub cpu_filter: DeviceFilter,

    /// Suppress the Hostname label column (env: DCGM_EXPORTER_NO_HOSTNAME)
    pub no_hostname: bool,

    /// Synthesize fake devices when enumeration fails; unit-test paths only
    /// (env: DCGM_EXPORTER_USE_FAKE_GPUS)
    pub use_fake_gpus: bool,

    /// Kubernetes configmap reference holding the counters list. Retrieval
    /// happens in the launcher, which materializes the payload to a file
    /// and points `collectors_file_path` at it.
    pub configmap_ref: Option<String>,

    /// Profiling metric groups enabled on this node
    /// (env: DCGM_EXPORTER_METRIC_GROUPS, ";"-separated id lists)
    pub metric_groups: Vec<MetricGroup>,

    /// systemd socket activation for the listener
    /// (env: DCGM_EXPORTER_WEB_SYSTEMD_SOCKET)
    pub web_systemd_socket: bool,

    /// Prometheus-toolkit-style web config with a TLS certificate pair
    /// (env: DCGM_EXPORTER_WEB_CONFIG_FILE)
    pub web_config_file: Option<PathBuf>,

    /// Sliding window for the XID error counter, in ms
    /// (env: DCGM_EXPORTER_XID_COUNT_WINDOW_SIZE)
    pub xid_window_ms: i64,

    /// Replace whitespace in model names with "-"
    /// (env: DCGM_EXPORTER_REPLACE_BLANKS_IN_MODEL_NAME)
    pub replace_blanks_in_model_name: bool,

    /// Sliding window for the clock events counter, in ms
    /// (env: DCGM_EXPORTER_CLOCK_EVENTS_COUNT_WINDOW_SIZE)
    pub clock_events_window_ms: i64,

    /// Capture and reclassify native-library log lines
    /// (env: DCGM_EXPORTER_ENABLE_DCGM_LOG)
    pub enable_native_log: bool,

    /// Native-library log level handed to __DCGM_DBG_LVL
    /// (env: DCGM_EXPORTER_DCGM_LOG_LEVEL)
    pub native_log_level: String,

    /// Kubelet pod-resources socket path
    /// (env: DCGM_EXPORTER_POD_RESOURCES_KUBELET_SOCKET)
    pub pod_resources_socket: PathBuf,

    /// HPC job-mapping directory; enables the HPC mapper when set
    /// (env: DCGM_EXPORTER_HPC_JOB_MAPPING_DIR)
    pub hpc_job_mapping_dir: Option<PathBuf>,

    /// Resource names treated as NVIDIA GPUs, in addition to the built-in
    /// ones (env: NVIDIA_RESOURCE_NAMES, comma-separated)
    pub nvidia_resource_names: Vec<String>,

    /// Device plugins exposing shared (virtual) GPUs suffix device ids
    /// with "::<replica>" (env: DCGM_EXPORTER_KUBERNETES_VIRTUAL_GPUS)
    pub kubernetes_virtual_gpus: bool,

    /// Render on a timer into a bounded channel instead of per scrape
    /// (env: DCGM_EXPORTER_PUSH_MODE)
    pub push_mode: bool,
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let remote_address = std::env::var("DCGM_EXPORTER_REMOTE_HOSTENGINE_INFO")
            .ok()
            .filter(|s| !s.is_empty());

        let metric_groups = match std::env::var("DCGM_EXPORTER_METRIC_GROUPS") {
            Ok(raw) => parse_metric_groups(&raw)?,
            Err(_) => Vec::new(),
        };

        let nvidia_resource_names = std::env::var("NVIDIA_RESOURCE_NAMES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            collectors_file_path: std::env::var("DCGM_EXPORTER_COLLECTORS")
                .unwrap_or_else(|_| "/etc/dcgm-exporter/default-counters.csv".into())
                .into(),
            address: std::env::var("DCGM_EXPORTER_LISTEN")
                .unwrap_or_else(|_| "0.0.0.0:9400".into()),
            collect_interval_ms: env_parse("DCGM_EXPORTER_INTERVAL", 30000u64)?,
            kubernetes: env_bool("DCGM_EXPORTER_KUBERNETES", false),
            kubernetes_gpu_id_type: env_parse(
                "DCGM_EXPORTER_KUBERNETES_GPU_ID_TYPE",
                DeviceIdType::Uid,
            )?,
            collect_dcp: env_bool("DCGM_EXPORTER_COLLECT_DCP", true),
            use_old_namespace: env_bool("DCGM_EXPORTER_USE_OLD_NAMESPACE", false),
            use_remote: remote_address.is_some(),
            remote_address,
            gpu_filter: env_parse("DCGM_EXPORTER_GPU_DEVICES", DeviceFilter::all())?,
            switch_filter: env_parse("DCGM_EXPORTER_SWITCH_DEVICES", DeviceFilter::all())?,
            cpu_filter: env_parse("DCGM_EXPORTER_CPU_DEVICES", DeviceFilter::all())?,
            no_hostname: env_bool("DCGM_EXPORTER_NO_HOSTNAME", false),
            use_fake_gpus: env_bool("DCGM_EXPORTER_USE_FAKE_GPUS", false),
            configmap_ref: std::env::var("DCGM_EXPORTER_CONFIGMAP_DATA")
                .ok()
                .filter(|s| !s.is_empty() && s != "none"),
            metric_groups,
            web_systemd_socket: env_bool("DCGM_EXPORTER_WEB_SYSTEMD_SOCKET", false),
            web_config_file: std::env::var("DCGM_EXPORTER_WEB_CONFIG_FILE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            xid_window_ms: env_parse("DCGM_EXPORTER_XID_COUNT_WINDOW_SIZE", 300_000i64)?,
            replace_blanks_in_model_name: env_bool(
                "DCGM_EXPORTER_REPLACE_BLANKS_IN_MODEL_NAME",
                false,
            ),
            clock_events_window_ms: env_parse(
                "DCGM_EXPORTER_CLOCK_EVENTS_COUNT_WINDOW_SIZE",
                300_000i64,
            )?,
            enable_native_log: env_bool("DCGM_EXPORTER_ENABLE_DCGM_LOG", false),
            native_log_level: std::env::var("DCGM_EXPORTER_DCGM_LOG_LEVEL")
                .unwrap_or_else(|_| "NONE".into()),
            pod_resources_socket: std::env::var("DCGM_EXPORTER_POD_RESOURCES_KUBELET_SOCKET")
                .unwrap_or_else(|_| "/var/lib/kubelet/pod-resources/kubelet.sock".into())
                .into(),
            hpc_job_mapping_dir: std::env::var("DCGM_EXPORTER_HPC_JOB_MAPPING_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            nvidia_resource_names,
            kubernetes_virtual_gpus: env_bool("DCGM_EXPORTER_KUBERNETES_VIRTUAL_GPUS", false),
            push_mode: env_bool("DCGM_EXPORTER_PUSH_MODE", false),
        })
    }

    /// Hostname label value: empty when suppressed, else the NODE_NAME
    /// override, else the OS hostname.
    pub fn hostname(&self) -> Result<String> {
        if self.no_hostname {
            return Ok(String::new());
        }
        if let Ok(node_name) = std::env::var("NODE_NAME") {
            if !node_name.is_empty() {
                return Ok(node_name);
            }
        }
        let hostname = nix::unistd::gethostname().context("could not read hostname")?;
        Ok(hostname.to_string_lossy().into_owned())
    }

    /// Field ids allowed through the DCP filter.
    pub fn enabled_dcp_fields(&self) -> std::collections::HashSet<u16> {
        self.metric_groups
            .iter()
            .flat_map(|g| g.field_ids.iter().copied())
            .collect()
    }
}

/// `"1001,1002;1009,1010"` → two groups.
fn parse_metric_groups(raw: &str) -> Result<Vec<MetricGroup>> {
    raw.split(';')
        .filter(|group| !group.trim().is_empty())
        .map(|group| {
            let field_ids = group
                .split(',')
                .filter(|id| !id.trim().is_empty())
                .map(|id| {
                    id.trim()
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid field id {id:?} in metric groups"))
                })
                .collect::<Result<Vec<u16>>>()?;
            Ok(MetricGroup { field_ids })
        })
        .collect()
}

/// Minimal config for tests; override fields via struct update syntax.
#[cfg(test)]
pub(crate) fn base_config() -> Config {
    Config {
        collectors_file_path: "/etc/dcgm-exporter/default-counters.csv".into(),
        address: "0.0.0.0:9400".into(),
        collect_interval_ms: 30000,
        kubernetes: false,
        kubernetes_gpu_id_type: DeviceIdType::Uid,
        collect_dcp: true,
        use_old_namespace: false,
        use_remote: false,
        remote_address: None,
        gpu_filter: DeviceFilter::all(),
        switch_filter: DeviceFilter::all(),
        cpu_filter: DeviceFilter::all(),
        no_hostname: false,
        use_fake_gpus: false,
        configmap_ref: None,
        metric_groups: Vec::new(),
        web_systemd_socket: false,
        web_config_file: None,
        xid_window_ms: 300_000,
        replace_blanks_in_model_name: false,
        clock_events_window_ms: 300_000,
        enable_native_log: false,
        native_log_level: "NONE".into(),
        pod_resources_socket: "/var/lib/kubelet/pod-resources/kubelet.sock".into(),
        hpc_job_mapping_dir: None,
        nvidia_resource_names: Vec::new(),
        kubernetes_virtual_gpus: false,
        push_mode: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_groups_parse_semicolon_separated_lists() {
        let groups = parse_metric_groups("1001,1002;1009").unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].field_ids, vec![1001, 1002]);
        assert_eq!(groups[1].field_ids, vec![1009]);
        assert!(parse_metric_groups("").unwrap().is_empty());
        assert!(parse_metric_groups("1001,x").is_err());
    }

    #[test]
    fn enabled_dcp_fields_flatten_groups() {
        let config = Config {
            metric_groups: vec![
                MetricGroup {
                    field_ids: vec![1001, 1002],
                },
                MetricGroup {
                    field_ids: vec![1002, 1009],
                },
            ],
            ..base_config()
        };
        let enabled = config.enabled_dcp_fields();
        assert_eq!(enabled.len(), 3);
        assert!(enabled.contains(&1009));
    }

    #[test]
    fn hostname_suppressed_by_flag() {
        let config = Config {
            no_hostname: true,
            ..base_config()
        };
        assert_eq!(config.hostname().unwrap(), "");
    }
}
