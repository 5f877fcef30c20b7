//! Kubernetes pod mapper: attach pod/namespace/container attributes to
//! metrics whose device the kubelet reports as allocated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::mig::MigResolver;
use super::podresources::{PodResources, PodResourcesLister};
use super::Transform;
use crate::collectors::{Metric, MetricsByClass};
use crate::inventory::DeviceInventory;

pub const NVIDIA_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const MIG_RESOURCE_PREFIX: &str = "nvidia.com/mig-";
pub const MIG_UUID_PREFIX: &str = "MIG-";

/// Which metric column identifies a device in kubelet listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceIdType {
    #[default]
    Uid,
    DeviceName,
}

impl FromStr for DeviceIdType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "uid" => Self::Uid,
            "device-name" => Self::DeviceName,
            other => anyhow::bail!("invalid Kubernetes GPU id type: {other}"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PodMapperConfig {
    pub device_id_type: DeviceIdType,
    pub use_old_namespace: bool,
    /// Resource names matched exactly, in addition to the MIG prefix.
    pub nvidia_resource_names: Vec<String>,
    /// When set, a missing socket file turns the whole transformation into
    /// a logged no-op.
    pub socket_path: Option<PathBuf>,
}

impl Default for PodMapperConfig {
    fn default() -> Self {
        Self {
            device_id_type: DeviceIdType::Uid,
            use_old_namespace: false,
            nvidia_resource_names: vec![NVIDIA_RESOURCE_NAME.to_string()],
            socket_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PodInfo {
    pod: String,
    namespace: String,
    container: String,
}

pub struct PodMapper {
    config: PodMapperConfig,
    lister: Arc<dyn PodResourcesLister>,
    resolver: Arc<dyn MigResolver>,
    inventory: Arc<DeviceInventory>,
    gke_device_re: Regex,
}

impl PodMapper {
    pub fn new(
        config: PodMapperConfig,
        lister: Arc<dyn PodResourcesLister>,
        resolver: Arc<dyn MigResolver>,
        inventory: Arc<DeviceInventory>,
    ) -> Self {
        Self {
            config,
            lister,
            resolver,
            inventory,
            gke_device_re: Regex::new(r"^nvidia(\d+)/gi(\d+)$").unwrap(),
        }
    }

    fn resource_matches(&self, resource_name: &str) -> bool {
        self.config
            .nvidia_resource_names
            .iter()
            .any(|name| name == resource_name)
            || resource_name.starts_with(MIG_RESOURCE_PREFIX)
    }

    /// Build the device-id → pod map, decoding each id. First matching
    /// decoder wins.
    fn device_to_pod(&self, pods: &[PodResources]) -> HashMap<String, PodInfo> {
        let mut map = HashMap::new();
        for pod in pods {
            for container in &pod.containers {
                for device in &container.devices {
                    if !self.resource_matches(&device.resource_name) {
                        continue;
                    }
                    let info = PodInfo {
                        pod: pod.name.clone(),
                        namespace: pod.namespace.clone(),
                        container: container.name.clone(),
                    };
                    for device_id in &device.device_ids {
                        self.index_device(device_id, &info, &mut map);
                    }
                }
            }
        }
        map
    }

    fn index_device(&self, device_id: &str, info: &PodInfo, map: &mut HashMap<String, PodInfo>) {
        if let Some(mig_uuid) = device_id.strip_prefix(MIG_UUID_PREFIX) {
            match self.resolver.device_info(device_id) {
                Ok(mig) => {
                    if let Some(index) = self.inventory.gpu_index_by_uuid(&mig.parent_uuid) {
                        map.insert(
                            format!("{index}-{}", mig.gpu_instance_id),
                            info.clone(),
                        );
                    }
                }
                Err(e) => debug!(device_id, error = %e, "Could not resolve MIG device"),
            }
            // Index the bare uuid as well: device plugins differ on which
            // form shows up in metrics.
            map.insert(mig_uuid.to_string(), info.clone());
        } else if let Some(caps) = self.gke_device_re.captures(device_id) {
            map.insert(format!("{}-{}", &caps[1], &caps[2]), info.clone());
        } else if let Some((prefix, _)) = device_id.split_once("/vgpu") {
            map.insert(prefix.to_string(), info.clone());
        } else if let Some((prefix, _)) = device_id.split_once("::") {
            map.insert(prefix.to_string(), info.clone());
        } else {
            map.insert(device_id.to_string(), info.clone());
        }
    }

    fn lookup_key(&self, metric: &Metric) -> String {
        if !metric.mig_profile.is_empty() {
            return format!("{}-{}", metric.gpu, metric.gpu_instance_id);
        }
        match self.config.device_id_type {
            DeviceIdType::Uid => metric.gpu_uuid.clone(),
            DeviceIdType::DeviceName => metric.gpu_device.clone(),
        }
    }
}

#[async_trait]
impl Transform for PodMapper {
    fn name(&self) -> &str {
        "pod-mapper"
    }

    async fn process(&self, metrics: &mut MetricsByClass) -> Result<()> {
        if let Some(socket) = &self.config.socket_path {
            if !socket.exists() {
                info!(
                    socket = %socket.display(),
                    "No kubelet pod-resources socket; skipping pod mapping"
                );
                return Ok(());
            }
        }

        let pods = self.lister.list().await?;
        let device_to_pod = self.device_to_pod(&pods);

        let (pod_key, namespace_key, container_key) = if self.config.use_old_namespace {
            ("pod_name", "pod_namespace", "container_name")
        } else {
            ("pod", "namespace", "container")
        };

        for (_class, set) in metrics.iter_mut() {
            for (_counter, class_metrics) in set.iter_mut() {
                for metric in class_metrics.iter_mut() {
                    let Some(info) = device_to_pod.get(&self.lookup_key(metric)) else {
                        continue;
                    };
                    metric.attributes.insert(pod_key, info.pod.clone());
                    metric
                        .attributes
                        .insert(namespace_key, info.namespace.clone());
                    metric
                        .attributes
                        .insert(container_key, info.container.clone());
                }
            }
        }
        Ok(())
    }
}
