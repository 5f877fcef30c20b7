//! Prometheus text exposition.
//!
//! Output is byte-deterministic for a deterministic input: counters render
//! in catalog order, metrics in collector order, and label/attribute maps
//! in insertion order. Nothing here sorts.

use std::fmt::Write;

use anyhow::{bail, Result};

use crate::collectors::{Metric, MetricsByClass};
use crate::dcgm::types::EntityClass;

#[derive(Debug, Clone, Default)]
pub struct RenderOpts {
    /// Renders the UUID column key as `uuid` instead of `UUID`.
    pub use_old_namespace: bool,
}

pub fn render(metrics: &MetricsByClass, opts: &RenderOpts) -> Result<String> {
    let mut out = String::new();
    for (class, set) in metrics.iter() {
        for (counter, class_metrics) in set.iter() {
            if class_metrics.is_empty() {
                continue;
            }
            writeln!(out, "# HELP {} {}", counter.field_name, counter.help)?;
            writeln!(out, "# TYPE {} {}", counter.field_name, counter.prom_type)?;
            for metric in class_metrics {
                render_metric(&mut out, class, metric, opts)?;
            }
        }
    }
    Ok(out)
}

fn render_metric(
    out: &mut String,
    class: EntityClass,
    metric: &Metric,
    opts: &RenderOpts,
) -> Result<()> {
    out.push_str(&metric.counter.field_name);
    out.push('{');

    let mut first = true;
    let mut label = |out: &mut String, key: &str, value: &str| {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(value);
        out.push('"');
    };

    match class {
        EntityClass::Gpu | EntityClass::GpuInstance | EntityClass::ComputeInstance => {
            let uuid_key = if opts.use_old_namespace { "uuid" } else { "UUID" };
            label(out, "gpu", &metric.gpu);
            label(out, uuid_key, &metric.gpu_uuid);
            label(out, "pci_bus_id", &metric.gpu_pci_bus_id);
            label(out, "device", &metric.gpu_device);
            label(out, "modelName", &metric.gpu_model);
            if !metric.mig_profile.is_empty() {
                label(out, "GPU_I_PROFILE", &metric.mig_profile);
                label(out, "GPU_I_ID", &metric.gpu_instance_id);
            }
        }
        EntityClass::Switch => {
            label(out, "nvswitch", &metric.entity.id.to_string());
        }
        EntityClass::Link => {
            label(out, "nvlink", &metric.entity.id.to_string());
            label(
                out,
                "nvswitch",
                &metric.parent_id.unwrap_or_default().to_string(),
            );
        }
        EntityClass::Cpu => {
            label(out, "cpu", &metric.entity.id.to_string());
        }
        EntityClass::CpuCore => {
            label(out, "cpucore", &metric.entity.id.to_string());
            label(
                out,
                "cpu",
                &metric.parent_id.unwrap_or_default().to_string(),
            );
        }
        other => bail!("unknown entity class {other}"),
    }

    if !metric.hostname.is_empty() {
        label(out, "Hostname", &metric.hostname);
    }
    for (key, value) in metric.labels.iter() {
        label(out, key, value);
    }
    for (key, value) in metric.attributes.iter() {
        label(out, key, value);
    }

    out.push_str("} ");
    out.push_str(&metric.value);
    out.push('\n');
    Ok(())
}
