//! Raw collector: latest-value reads for every monitored entity of one
//! class, converted to labelled metrics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use super::{exit_on_fatal, Collector, LabelMap, Metric, MetricSet};
use crate::catalog::{Counter, CounterSet, PromType};
use crate::dcgm::types::{EntityClass, FieldValue};
use crate::dcgm::{fields, DcgmApi};
use crate::inventory::{DeviceInventory, MonitoredEntity};
use crate::watcher::WatchList;

#[derive(Debug, Clone, Default)]
pub struct CollectorOpts {
    /// Empty when the hostname column is suppressed.
    pub hostname: String,
    pub replace_blanks_in_model_name: bool,
}

pub struct RawCollector {
    provider: Arc<dyn DcgmApi>,
    inventory: Arc<DeviceInventory>,
    class: EntityClass,
    device_fields: Vec<u16>,
    counters_by_id: HashMap<u16, Counter>,
    opts: CollectorOpts,
    watch_list: Mutex<Option<WatchList>>,
}

impl RawCollector {
    pub fn new(
        provider: Arc<dyn DcgmApi>,
        inventory: Arc<DeviceInventory>,
        counters: &CounterSet,
        watch_list: WatchList,
        opts: CollectorOpts,
    ) -> Self {
        Self {
            provider,
            inventory,
            class: watch_list.class,
            device_fields: watch_list.device_fields.clone(),
            counters_by_id: counters
                .dcgm_counters
                .iter()
                .map(|c| (c.field_id, c.clone()))
                .collect(),
            opts,
            watch_list: Mutex::new(Some(watch_list)),
        }
    }

    fn collect_entity(&self, monitored: &MonitoredEntity, set: &mut MetricSet) -> Result<()> {
        let values = match self.class {
            EntityClass::Link => self.provider.link_latest_values(
                monitored.entity.id,
                monitored.parent_id.unwrap_or(0),
                &self.device_fields,
            ),
            _ => self
                .provider
                .entity_latest_values(monitored.entity, &self.device_fields),
        };
        let values = match values {
            Ok(values) => values,
            Err(e) => {
                exit_on_fatal(&e);
                return Err(e.into());
            }
        };

        // Label-typed fields are projected into a per-entity label map and
        // never emitted as metrics themselves.
        let mut labels = LabelMap::new();
        for sample in &values {
            let Some(counter) = self.counters_by_id.get(&sample.field_id) else {
                continue;
            };
            if counter.prom_type != PromType::Label {
                continue;
            }
            if let Some(value) = stringify(&sample.value) {
                labels.insert(counter.field_name.clone(), value);
            }
        }

        for sample in &values {
            let Some(counter) = self.counters_by_id.get(&sample.field_id) else {
                continue;
            };
            if counter.prom_type == PromType::Label {
                continue;
            }
            let Some(value) = stringify(&sample.value) else {
                continue;
            };

            let mut metric = self.base_metric(counter.clone(), value, monitored);
            metric.labels = labels.clone();

            if sample.field_id == fields::DCGM_FI_DEV_XID_ERRORS {
                if let FieldValue::Int64(code) = sample.value {
                    metric.attributes.insert("err_code", code.to_string());
                    metric.attributes.insert("err_msg", xid_error_text(code));
                }
            }

            set.push(metric);
        }
        Ok(())
    }

    fn base_metric(&self, counter: Counter, value: String, monitored: &MonitoredEntity) -> Metric {
        gpu_metric(counter, value, monitored, &self.opts)
    }
}

/// Build a metric with the entity-class-specific label columns filled in.
pub(crate) fn gpu_metric(
    counter: Counter,
    value: String,
    monitored: &MonitoredEntity,
    opts: &CollectorOpts,
) -> Metric {
    let mut metric = Metric::for_entity(counter, value, monitored.entity);
    metric.parent_id = monitored.parent_id;
    metric.hostname = opts.hostname.clone();

    if matches!(
        monitored.entity.class,
        EntityClass::Gpu | EntityClass::GpuInstance
    ) {
        metric.gpu = monitored.device.gpu_id.to_string();
        metric.gpu_uuid = monitored.device.uuid.clone();
        metric.gpu_device = format!("nvidia{}", monitored.device.gpu_id);
        metric.gpu_model =
            normalize_model_name(&monitored.device.model_name, opts.replace_blanks_in_model_name);
        metric.gpu_pci_bus_id = monitored.device.pci_bus_id.clone();
        if let Some(instance) = &monitored.instance {
            metric.mig_profile = instance.profile_name.clone();
            metric.gpu_instance_id = instance.nvml_instance_id.to_string();
        }
    }
    metric
}

impl Collector for RawCollector {
    fn name(&self) -> &str {
        "raw"
    }

    fn class(&self) -> EntityClass {
        self.class
    }

    fn collect(&self) -> Result<MetricSet> {
        let mut set = MetricSet::default();
        for monitored in self.inventory.monitored_entities(self.class) {
            self.collect_entity(&monitored, &mut set)?;
        }
        Ok(set)
    }

    fn cleanup(&self) {
        if let Some(mut watch_list) = self.watch_list.lock().unwrap().take() {
            watch_list.destroy();
        }
    }
}

/// Uniform value stringification. `None` is the skip sentinel: the datum is
/// blank / not found / not supported / not permissioned and the metric is
/// dropped before emission.
pub fn stringify(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Int64(v) if fields::is_int64_blank(*v) => None,
        FieldValue::Int64(v) => Some(v.to_string()),
        FieldValue::Double(v) if fields::is_fp64_blank(*v) => None,
        FieldValue::Double(v) => Some(format!("{v:.6}")),
        FieldValue::Str(s) if fields::is_str_blank(s) => None,
        FieldValue::Str(s) => Some(s.clone()),
        FieldValue::Blob => None,
    }
}

/// Collapse whitespace runs and join with `-` so the model name is a single
/// label-safe token.
pub fn normalize_model_name(name: &str, replace_blanks: bool) -> String {
    if replace_blanks {
        name.split_whitespace().collect::<Vec<_>>().join("-")
    } else {
        name.to_string()
    }
}

/// Human-readable text for an XID error code. Unknown codes map to a fixed
/// fallback rather than failing the scrape.
pub fn xid_error_text(code: i64) -> &'static str {
    match code {
        8 => "GPU stopped processing",
        13 => "Graphics Engine Exception",
        31 => "GPU memory page fault",
        32 => "Invalid or corrupted push buffer stream",
        38 => "Driver firmware error",
        43 => "GPU stopped processing",
        45 => "Preemptive cleanup, due to previous errors",
        48 => "Double Bit ECC Error",
        61 => "Internal micro-controller breakpoint/warning",
        62 => "Internal micro-controller halt",
        63 => "ECC page retirement or row remapping recording event",
        64 => "ECC page retirement or row remapper recording failure",
        68 => "Video processor exception",
        74 => "NVLink Error",
        79 => "GPU has fallen off the bus",
        92 => "High single-bit ECC error rate",
        94 => "Contained ECC error",
        95 => "Uncontained ECC error",
        119 => "GSP RPC timeout",
        120 => "GSP error",
        _ => "Unknown Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{extract_counters, DcpPolicy};
    use crate::dcgm::mock::MockDcgm;
    use crate::dcgm::types::{DeviceIdentity, EntityPair, LinkState, NvLinkStatus};
    use crate::inventory::{DeviceFilter, GpuInfo, SwitchInfo};
    use crate::watcher::WatchListManager;

    fn parse(catalog: &str) -> CounterSet {
        extract_counters(catalog.as_bytes(), &DcpPolicy::default()).unwrap()
    }

    fn one_gpu_inventory(uuid: &str, model: &str) -> Arc<DeviceInventory> {
        Arc::new(DeviceInventory {
            gpus: vec![GpuInfo {
                device: DeviceIdentity {
                    gpu_id: 0,
                    uuid: uuid.into(),
                    pci_bus_id: String::new(),
                    model_name: model.into(),
                },
                mig_enabled: false,
                instances: vec![],
            }],
            ..Default::default()
        })
    }

    fn collector_for(
        mock: Arc<MockDcgm>,
        inventory: Arc<DeviceInventory>,
        catalog: &str,
        class: EntityClass,
        opts: CollectorOpts,
    ) -> RawCollector {
        let counters = parse(catalog);
        let manager = WatchListManager::new(mock.clone(), 1000);
        let watch_list = manager
            .plan(class, &counters.dcgm_counters, &inventory)
            .unwrap()
            .unwrap();
        RawCollector::new(mock, inventory, &counters, watch_list, opts)
    }

    #[test]
    fn emits_temperature_with_entity_columns() {
        let mock = Arc::new(MockDcgm::new());
        mock.set_latest(
            EntityClass::Gpu,
            0,
            fields::DCGM_FI_DEV_GPU_TEMP,
            FieldValue::Int64(42),
        );
        let inventory = one_gpu_inventory("fake1", "NVIDIA T400 4GB");
        let collector = collector_for(
            mock,
            inventory,
            "DCGM_FI_DEV_GPU_TEMP, gauge, Temperature\n",
            EntityClass::Gpu,
            CollectorOpts {
                hostname: "testhost".into(),
                replace_blanks_in_model_name: true,
            },
        );

        let set = collector.collect().unwrap();
        let metrics = set.metrics_for("DCGM_FI_DEV_GPU_TEMP").unwrap();
        assert_eq!(metrics.len(), 1);
        let m = &metrics[0];
        assert_eq!(m.value, "42");
        assert_eq!(m.gpu, "0");
        assert_eq!(m.gpu_uuid, "fake1");
        assert_eq!(m.gpu_device, "nvidia0");
        assert_eq!(m.gpu_model, "NVIDIA-T400-4GB");
        assert_eq!(m.gpu_pci_bus_id, "");
        assert_eq!(m.hostname, "testhost");
        assert!(m.mig_profile.is_empty());
    }

    #[test]
    fn blank_values_are_skipped() {
        let mock = Arc::new(MockDcgm::new());
        mock.set_latest(
            EntityClass::Gpu,
            0,
            fields::DCGM_FI_DEV_GPU_TEMP,
            FieldValue::Int64(fields::INT64_BLANK + 2),
        );
        let inventory = one_gpu_inventory("GPU-aaa", "NVIDIA A100");
        let collector = collector_for(
            mock,
            inventory,
            "DCGM_FI_DEV_GPU_TEMP, gauge, Temperature\n",
            EntityClass::Gpu,
            CollectorOpts::default(),
        );

        let set = collector.collect().unwrap();
        assert!(set.metrics_for("DCGM_FI_DEV_GPU_TEMP").is_none());
    }

    #[test]
    fn label_fields_are_projected_not_emitted() {
        let mock = Arc::new(MockDcgm::new());
        mock.set_latest(
            EntityClass::Gpu,
            0,
            fields::DCGM_FI_DRIVER_VERSION,
            FieldValue::Str("535.104.05".into()),
        );
        mock.set_latest(
            EntityClass::Gpu,
            0,
            fields::DCGM_FI_DEV_GPU_TEMP,
            FieldValue::Int64(42),
        );
        let inventory = one_gpu_inventory("GPU-aaa", "NVIDIA A100");
        let collector = collector_for(
            mock,
            inventory,
            "DCGM_FI_DRIVER_VERSION, label, Driver version\n\
             DCGM_FI_DEV_GPU_TEMP, gauge, Temperature\n",
            EntityClass::Gpu,
            CollectorOpts::default(),
        );

        let set = collector.collect().unwrap();
        assert!(set.metrics_for("DCGM_FI_DRIVER_VERSION").is_none());
        let m = &set.metrics_for("DCGM_FI_DEV_GPU_TEMP").unwrap()[0];
        assert_eq!(m.labels.get("DCGM_FI_DRIVER_VERSION"), Some("535.104.05"));
    }

    #[test]
    fn xid_metrics_carry_code_and_text_attributes() {
        let mock = Arc::new(MockDcgm::new());
        mock.set_latest(
            EntityClass::Gpu,
            0,
            fields::DCGM_FI_DEV_XID_ERRORS,
            FieldValue::Int64(79),
        );
        let inventory = one_gpu_inventory("GPU-aaa", "NVIDIA A100");
        let collector = collector_for(
            mock,
            inventory,
            "DCGM_FI_DEV_XID_ERRORS, gauge, Last XID error\n",
            EntityClass::Gpu,
            CollectorOpts::default(),
        );

        let set = collector.collect().unwrap();
        let m = &set.metrics_for("DCGM_FI_DEV_XID_ERRORS").unwrap()[0];
        assert_eq!(m.attributes.get("err_code"), Some("79"));
        assert_eq!(m.attributes.get("err_msg"), Some("GPU has fallen off the bus"));
    }

    #[test]
    fn unknown_xid_code_maps_to_unknown_error() {
        assert_eq!(xid_error_text(9999), "Unknown Error");
    }

    #[test]
    fn double_values_use_fixed_precision() {
        assert_eq!(
            stringify(&FieldValue::Double(0.5)).unwrap(),
            "0.500000"
        );
        assert_eq!(stringify(&FieldValue::Int64(7)).unwrap(), "7");
        assert!(stringify(&FieldValue::Str(fields::STR_NOT_FOUND.into())).is_none());
        assert!(stringify(&FieldValue::Blob).is_none());
    }

    #[test]
    fn model_name_untouched_without_flag() {
        assert_eq!(
            normalize_model_name("NVIDIA  T400 4GB", false),
            "NVIDIA  T400 4GB"
        );
        assert_eq!(
            normalize_model_name("NVIDIA  T400 4GB", true),
            "NVIDIA-T400-4GB"
        );
    }

    #[test]
    fn link_class_reads_via_link_path() {
        let mock = Arc::new(MockDcgm::new());
        mock.set_link_latest(
            0,
            3,
            fields::DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX,
            FieldValue::Int64(1024),
        );
        let inventory = Arc::new(DeviceInventory {
            switches: vec![SwitchInfo {
                entity_id: 3,
                links: vec![NvLinkStatus {
                    parent_class: EntityClass::Switch,
                    parent_id: 3,
                    index: 0,
                    state: LinkState::Up,
                }],
            }],
            switch_filter: DeviceFilter::Ranged {
                major: vec![-1],
                minor: vec![-1],
            },
            ..Default::default()
        });
        let collector = collector_for(
            mock,
            inventory,
            "DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX, counter, Link TX bytes\n",
            EntityClass::Link,
            CollectorOpts::default(),
        );

        let set = collector.collect().unwrap();
        let m = &set.metrics_for("DCGM_FI_DEV_NVSWITCH_LINK_THROUGHPUT_TX").unwrap()[0];
        assert_eq!(m.value, "1024");
        assert_eq!(m.entity, EntityPair::new(EntityClass::Link, 0));
        assert_eq!(m.parent_id, Some(3));
    }

    #[test]
    fn cleanup_destroys_the_watch_list_once() {
        let mock = Arc::new(MockDcgm::new());
        mock.set_latest(
            EntityClass::Gpu,
            0,
            fields::DCGM_FI_DEV_GPU_TEMP,
            FieldValue::Int64(42),
        );
        let inventory = one_gpu_inventory("GPU-aaa", "NVIDIA A100");
        let collector = collector_for(
            mock.clone(),
            inventory,
            "DCGM_FI_DEV_GPU_TEMP, gauge, Temperature\n",
            EntityClass::Gpu,
            CollectorOpts::default(),
        );

        collector.cleanup();
        collector.cleanup();
        assert_eq!(mock.destroyed_groups().len(), 1);
        assert_eq!(mock.destroyed_field_groups().len(), 1);
    }
}
