//! Metric model and the collector registry.
//!
//! A [`Metric`] lives only within one scrape. Collectors produce an
//! insertion-ordered [`MetricSet`] per entity class; the registry fans out
//! over all registered collectors in parallel and merges their output in
//! registration order, which keeps the rendered exposition deterministic.

pub mod events;
pub mod raw;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::catalog::Counter;
use crate::dcgm::types::{DcgmError, EntityClass, EntityId, EntityPair};

/// String map preserving insertion order; duplicate inserts overwrite in
/// place. Label and attribute maps are per-metric copies, never shared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap(Vec<(String, String)>);

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// One exported sample, fully labelled.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub counter: Counter,
    pub value: String,

    pub entity: EntityPair,
    pub parent_id: Option<EntityId>,

    // Entity label columns for GPU-backed classes.
    pub gpu: String,
    pub gpu_uuid: String,
    pub gpu_device: String,
    pub gpu_model: String,
    pub gpu_pci_bus_id: String,
    pub mig_profile: String,
    pub gpu_instance_id: String,
    pub hostname: String,

    pub labels: LabelMap,
    pub attributes: LabelMap,
}

impl Metric {
    /// A metric with empty label columns, for non-GPU entities.
    pub fn for_entity(counter: Counter, value: String, entity: EntityPair) -> Self {
        Self {
            counter,
            value,
            entity,
            parent_id: None,
            gpu: String::new(),
            gpu_uuid: String::new(),
            gpu_device: String::new(),
            gpu_model: String::new(),
            gpu_pci_bus_id: String::new(),
            mig_profile: String::new(),
            gpu_instance_id: String::new(),
            hostname: String::new(),
            labels: LabelMap::new(),
            attributes: LabelMap::new(),
        }
    }
}

/// Insertion-ordered counter → metrics map for one entity class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSet {
    entries: Vec<(Counter, Vec<Metric>)>,
}

impl MetricSet {
    pub fn push(&mut self, metric: Metric) {
        match self
            .entries
            .iter_mut()
            .find(|(c, _)| c.field_id == metric.counter.field_id)
        {
            Some((_, metrics)) => metrics.push(metric),
            None => self.entries.push((metric.counter.clone(), vec![metric])),
        }
    }

    /// Concatenate another set under the same counters, preserving order.
    pub fn extend(&mut self, other: MetricSet) {
        for (counter, metrics) in other.entries {
            match self
                .entries
                .iter_mut()
                .find(|(c, _)| c.field_id == counter.field_id)
            {
                Some((_, existing)) => existing.extend(metrics),
                None => self.entries.push((counter, metrics)),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Counter, &Vec<Metric>)> {
        self.entries.iter().map(|(c, m)| (c, m))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Counter, &mut Vec<Metric>)> {
        self.entries.iter_mut().map(|(c, m)| (&*c, m))
    }

    pub fn metrics_for(&self, field_name: &str) -> Option<&Vec<Metric>> {
        self.entries
            .iter()
            .find(|(c, _)| c.field_name == field_name)
            .map(|(_, m)| m)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_metrics(&self) -> usize {
        self.entries.iter().map(|(_, m)| m.len()).sum()
    }
}

/// Gather output: entity class → metric set, ordered by first contribution.
#[derive(Debug, Default, PartialEq)]
pub struct MetricsByClass {
    entries: Vec<(EntityClass, MetricSet)>,
}

impl MetricsByClass {
    pub fn merge(&mut self, class: EntityClass, set: MetricSet) {
        match self.entries.iter_mut().find(|(c, _)| *c == class) {
            Some((_, existing)) => existing.extend(set),
            None => self.entries.push((class, set)),
        }
    }

    pub fn get(&self, class: EntityClass) -> Option<&MetricSet> {
        self.entries
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, s)| s)
    }

    pub fn get_mut(&mut self, class: EntityClass) -> Option<&mut MetricSet> {
        self.entries
            .iter_mut()
            .find(|(c, _)| *c == class)
            .map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityClass, &MetricSet)> {
        self.entries.iter().map(|(c, s)| (*c, s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityClass, &mut MetricSet)> {
        self.entries.iter_mut().map(|(c, s)| (*c, s))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A source of metrics for one entity class.
pub trait Collector: Send + Sync {
    /// Stable identity used for registry deduplication.
    fn name(&self) -> &str;
    fn class(&self) -> EntityClass;
    fn collect(&self) -> Result<MetricSet>;
    /// Release provider-side resources. Called once at shutdown.
    fn cleanup(&self);
}

/// A provider connection that is gone cannot recover; the process must die
/// so the supervisor restarts it against a healthy host engine.
pub fn exit_on_fatal(err: &DcgmError) {
    if err.is_fatal() {
        error!(error = %err, "Host-engine connection lost; terminating");
        std::process::exit(1);
    }
}

/// De-duplicating collector registry with parallel gather.
#[derive(Default)]
pub struct Registry {
    collectors: Mutex<Vec<Arc<dyn Collector>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector; re-registering the same (class, name) pair is
    /// a no-op.
    pub fn register(&self, collector: Arc<dyn Collector>) {
        let mut collectors = self.collectors.lock().unwrap();
        let duplicate = collectors
            .iter()
            .any(|c| c.class() == collector.class() && c.name() == collector.name());
        if !duplicate {
            collectors.push(collector);
        }
    }

    pub fn len(&self) -> usize {
        self.collectors.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.lock().unwrap().is_empty()
    }

    /// Run every collector on its own blocking task and merge the results
    /// in registration order. The first failure wins and no map is
    /// returned.
    pub async fn gather(&self) -> Result<MetricsByClass> {
        let collectors: Vec<Arc<dyn Collector>> = self.collectors.lock().unwrap().clone();

        let handles: Vec<_> = collectors
            .into_iter()
            .map(|collector| {
                tokio::task::spawn_blocking(move || (collector.class(), collector.collect()))
            })
            .collect();

        let mut output = MetricsByClass::default();
        for handle in handles {
            let (class, result) = handle.await.context("collector task panicked")?;
            output.merge(class, result?);
        }
        Ok(output)
    }

    /// Run every collector's disposer; errors are logged and suppressed.
    pub fn cleanup(&self) {
        let collectors = self.collectors.lock().unwrap();
        for collector in collectors.iter() {
            collector.cleanup();
        }
        debug!(count = collectors.len(), "Collectors cleaned up");
    }
}
