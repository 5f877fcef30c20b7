//! Windowed event collectors: exporter-derived counters computed from
//! samples over a sliding time window rather than read directly.
//!
//! Shared skeleton: a transient field group over the trigger field, one
//! `update_all_fields`, then `values_since(now - window)`. A value parser
//! decomposes each sample into discrete events; a label filler records the
//! event kind on a per-sample label copy. No state is held across scrapes.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rand::RngCore;
use tracing::warn;

use super::raw::{gpu_metric, stringify, CollectorOpts};
use super::{exit_on_fatal, Collector, LabelMap, MetricSet};
use crate::catalog::Counter;
use crate::dcgm::types::{
    DcgmError, EntityClass, EntityPair, FieldGroupHandle, FieldValue, GROUP_ALL_GPUS,
};
use crate::dcgm::{fields, DcgmApi};
use crate::inventory::DeviceInventory;

type ValueParser = Box<dyn Fn(i64) -> Vec<i64> + Send + Sync>;
type LabelFiller = Box<dyn Fn(&mut LabelMap, i64) + Send + Sync>;

/// Clock event reason bits and their exported names.
static CLOCK_EVENT_REASONS: &[(i64, &str)] = &[
    (0x0001, "GPU_IDLE"),
    (0x0002, "CLOCKS_SETTING"),
    (0x0004, "SW_POWER_CAP"),
    (0x0008, "HW_SLOWDOWN"),
    (0x0010, "SYNC_BOOST"),
    (0x0020, "SW_THERMAL"),
    (0x0040, "HW_THERMAL"),
    (0x0080, "HW_POWER_BRAKE"),
    (0x0100, "DISPLAY_CLOCKS"),
];

fn clock_event_name(bit: i64) -> &'static str {
    CLOCK_EVENT_REASONS
        .iter()
        .find(|(mask, _)| *mask == bit)
        .map(|(_, name)| *name)
        .unwrap_or("UNKNOWN")
}

pub struct WindowedCollector {
    provider: Arc<dyn DcgmApi>,
    inventory: Arc<DeviceInventory>,
    counter: Counter,
    window_ms: i64,
    trigger_field: u16,
    label_counters: Vec<Counter>,
    opts: CollectorOpts,
    value_parser: ValueParser,
    label_filler: LabelFiller,
    /// Standing watch on the trigger field so the engine retains samples
    /// across the window. Destroyed at cleanup.
    standing_watch: Mutex<Option<FieldGroupHandle>>,
}

impl WindowedCollector {
    /// XID errors: each sample value is itself the XID code.
    pub fn xid_errors(
        provider: Arc<dyn DcgmApi>,
        inventory: Arc<DeviceInventory>,
        counter: Counter,
        window_ms: i64,
        update_period_us: i64,
        label_counters: Vec<Counter>,
        opts: CollectorOpts,
    ) -> Result<Self> {
        Self::build(
            provider,
            inventory,
            counter,
            window_ms,
            update_period_us,
            fields::DCGM_FI_DEV_XID_ERRORS,
            label_counters,
            opts,
            Box::new(|value| vec![value]),
            Box::new(|labels, event| labels.insert("xid", event.to_string())),
        )
    }

    /// Clock events: the sample is a reason bitmask; each set bit is one
    /// event kind.
    pub fn clock_events(
        provider: Arc<dyn DcgmApi>,
        inventory: Arc<DeviceInventory>,
        counter: Counter,
        window_ms: i64,
        update_period_us: i64,
        label_counters: Vec<Counter>,
        opts: CollectorOpts,
    ) -> Result<Self> {
        Self::build(
            provider,
            inventory,
            counter,
            window_ms,
            update_period_us,
            fields::DCGM_FI_DEV_CLOCKS_EVENT_REASONS,
            label_counters,
            opts,
            Box::new(|value| {
                CLOCK_EVENT_REASONS
                    .iter()
                    .filter(|(mask, _)| value & mask != 0)
                    .map(|(mask, _)| *mask)
                    .collect()
            }),
            Box::new(|labels, event| labels.insert("clock_event", clock_event_name(event))),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        provider: Arc<dyn DcgmApi>,
        inventory: Arc<DeviceInventory>,
        counter: Counter,
        window_ms: i64,
        update_period_us: i64,
        trigger_field: u16,
        label_counters: Vec<Counter>,
        opts: CollectorOpts,
        value_parser: ValueParser,
        label_filler: LabelFiller,
    ) -> Result<Self> {
        let name = format!("{}-watch-{}", counter.field_name, random_suffix());
        let field_group = provider.create_field_group(&name, &[trigger_field])?;
        if let Err(e) = provider.watch_fields(
            field_group,
            GROUP_ALL_GPUS,
            update_period_us,
            window_ms as f64 / 1000.0,
            0,
        ) {
            destroy_field_group(provider.as_ref(), field_group);
            return Err(e.into());
        }

        Ok(Self {
            provider,
            inventory,
            counter,
            window_ms,
            trigger_field,
            label_counters,
            opts,
            value_parser,
            label_filler,
            standing_watch: Mutex::new(Some(field_group)),
        })
    }

    fn collect_window(&self, field_group: FieldGroupHandle) -> Result<MetricSet> {
        if let Err(e) = self.provider.update_all_fields() {
            exit_on_fatal(&e);
            return Err(e.into());
        }

        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        let since_us = now_us - self.window_ms * 1000;

        let (samples, _next) = match self
            .provider
            .values_since(GROUP_ALL_GPUS, field_group, since_us)
        {
            Ok(r) => r,
            Err(e) => {
                exit_on_fatal(&e);
                return Err(e.into());
            }
        };

        // Count events per (entity, kind), first-seen order.
        let mut counts: Vec<((EntityPair, i64), u64)> = Vec::new();
        for entity_sample in &samples {
            if entity_sample.sample.status != 0 {
                continue;
            }
            if entity_sample.sample.field_id != self.trigger_field {
                continue;
            }
            let FieldValue::Int64(value) = entity_sample.sample.value else {
                continue;
            };
            if fields::is_int64_blank(value) {
                continue;
            }
            for event in (self.value_parser)(value) {
                let key = (entity_sample.entity, event);
                match counts.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((key, 1)),
                }
            }
        }

        let label_fields: Vec<u16> = self.label_counters.iter().map(|c| c.field_id).collect();

        let mut set = MetricSet::default();
        for monitored in self.inventory.monitored_entities(EntityClass::Gpu) {
            // Label-counter enrichment (driver version and friends).
            let mut base_labels = LabelMap::new();
            if !label_fields.is_empty() {
                let values = self
                    .provider
                    .entity_latest_values(monitored.entity, &label_fields)
                    .unwrap_or_default();
                for sample in values {
                    let Some(counter) = self
                        .label_counters
                        .iter()
                        .find(|c| c.field_id == sample.field_id)
                    else {
                        continue;
                    };
                    if let Some(value) = stringify(&sample.value) {
                        base_labels.insert(counter.field_name.clone(), value);
                    }
                }
            }
            base_labels.insert("window_size_in_ms", self.window_ms.to_string());

            let gpu_entity = EntityPair::new(EntityClass::Gpu, monitored.device.gpu_id);
            for ((entity, event), count) in &counts {
                if *entity != monitored.entity && *entity != gpu_entity {
                    continue;
                }
                let mut metric = gpu_metric(
                    self.counter.clone(),
                    count.to_string(),
                    &monitored,
                    &self.opts,
                );
                let mut labels = base_labels.clone();
                (self.label_filler)(&mut labels, *event);
                metric.labels = labels;
                set.push(metric);
            }
        }
        Ok(set)
    }
}

impl Collector for WindowedCollector {
    fn name(&self) -> &str {
        &self.counter.field_name
    }

    fn class(&self) -> EntityClass {
        EntityClass::Gpu
    }

    fn collect(&self) -> Result<MetricSet> {
        // Transient field group per scrape, destroyed on every exit path.
        let name = format!("{}-{}", self.counter.field_name, random_suffix());
        let field_group = self
            .provider
            .create_field_group(&name, &[self.trigger_field])?;
        let result = self.collect_window(field_group);
        destroy_field_group(self.provider.as_ref(), field_group);
        result
    }

    fn cleanup(&self) {
        if let Some(field_group) = self.standing_watch.lock().unwrap().take() {
            destroy_field_group(self.provider.as_ref(), field_group);
        }
    }
}

fn destroy_field_group(provider: &dyn DcgmApi, field_group: FieldGroupHandle) {
    match provider.destroy_field_group(field_group) {
        Ok(()) | Err(DcgmError::NotConfigured) => {}
        Err(e) => warn!(error = %e, "Failed to destroy field group"),
    }
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
