mod catalog;
mod collectors;
mod config;
mod dcgm;
mod inventory;
mod render;
mod server;
mod stdout_capture;
mod transform;
mod watcher;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::catalog::{CounterSet, DcpPolicy};
use crate::collectors::events::WindowedCollector;
use crate::collectors::raw::{CollectorOpts, RawCollector};
use crate::collectors::Registry;
use crate::config::Config;
use crate::dcgm::types::EntityClass;
use crate::dcgm::{fields, DcgmApi};
use crate::inventory::{DeviceInventory, InventoryOptions};
use crate::render::RenderOpts;
use crate::server::MetricsPipeline;
use crate::stdout_capture::StdoutCapture;
use crate::transform::hpc::HpcMapper;
use crate::transform::kubernetes::{PodMapper, PodMapperConfig};
use crate::transform::mig::NvmlMigResolver;
use crate::transform::podresources::PodResourcesClient;
use crate::transform::Transform;
use crate::watcher::WatchListManager;

/// Entity classes the watch planner considers, in planning order.
const PLANNED_CLASSES: [EntityClass; 5] = [
    EntityClass::Gpu,
    EntityClass::Switch,
    EntityClass::Link,
    EntityClass::Cpu,
    EntityClass::CpuCore,
];

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Logs go to stderr: stdout belongs to the capture subsystem while the
    // native library is active.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dcgm_exporter=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting DCGM exporter v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(listen = %config.address, interval_ms = config.collect_interval_ms, "Configuration loaded");

    if config.web_systemd_socket {
        warn!("systemd socket activation is not supported; listening on the configured address");
    }

    // Capture native log lines for as long as the host engine is active.
    let mut capture = if config.enable_native_log {
        Some(StdoutCapture::install()?)
    } else {
        None
    };

    let provider = dcgm::connect(&config)?;
    info!("Host engine connected");

    let result = run(&config, provider.clone()).await;

    // Teardown in reverse of bring-up.
    if let Err(e) = provider.shutdown() {
        warn!(error = %e, "Host-engine shutdown failed");
    }
    if let Some(capture) = capture.as_mut() {
        if let Err(e) = capture.release() {
            warn!(error = %e, "Could not release stdout capture");
        }
    }

    result
}

async fn run(config: &Config, provider: Arc<dyn DcgmApi>) -> Result<()> {
    let dcp = DcpPolicy {
        collect_dcp: config.collect_dcp,
        enabled_fields: config.enabled_dcp_fields(),
    };
    let counters = catalog::parse_catalog_file(&config.collectors_file_path, &dcp)?;
    info!(
        raw = counters.dcgm_counters.len(),
        derived = counters.exporter_counters.len(),
        "Counter catalog loaded"
    );

    let inventory = Arc::new(DeviceInventory::build(
        provider.as_ref(),
        &inventory_options(config, &counters, provider.as_ref()),
    )?);

    let registry = Arc::new(Registry::new());
    register_collectors(config, provider, inventory.clone(), &counters, &registry)?;

    let pipeline = Arc::new(MetricsPipeline {
        registry: registry.clone(),
        transforms: build_transforms(config, inventory),
        render_opts: RenderOpts {
            use_old_namespace: config.use_old_namespace,
        },
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    let cached = if config.push_mode {
        let rx = server::spawn_ticker(
            pipeline.clone(),
            config.collect_interval_ms,
            shutdown_rx.clone(),
        );
        let cached = Arc::new(RwLock::new(String::new()));
        let _writer = server::spawn_cache_writer(rx, cached.clone());
        Some(cached)
    } else {
        None
    };

    let app = server::router(pipeline, cached);
    let result = server::serve(
        app,
        &config.address,
        config.web_config_file.as_deref(),
        shutdown_rx,
    )
    .await;

    registry.cleanup();
    result
}

/// Switch and CPU topology is only discovered (and required to exist) when
/// the catalog references fields at those levels.
fn inventory_options(
    config: &Config,
    counters: &CounterSet,
    provider: &dyn DcgmApi,
) -> InventoryOptions {
    let mut want_switches = false;
    let mut want_cpus = false;
    for counter in &counters.dcgm_counters {
        let Ok(meta) = provider.field_meta(counter.field_id) else {
            continue;
        };
        match meta.entity_level {
            EntityClass::Switch | EntityClass::Link => want_switches = true,
            EntityClass::Cpu | EntityClass::CpuCore => want_cpus = true,
            _ => {}
        }
    }
    InventoryOptions {
        gpu_filter: config.gpu_filter.clone(),
        switch_filter: config.switch_filter.clone(),
        cpu_filter: config.cpu_filter.clone(),
        use_fake_gpus: config.use_fake_gpus,
        want_switches,
        want_cpus,
    }
}

fn register_collectors(
    config: &Config,
    provider: Arc<dyn DcgmApi>,
    inventory: Arc<DeviceInventory>,
    counters: &CounterSet,
    registry: &Registry,
) -> Result<()> {
    let opts = CollectorOpts {
        hostname: config.hostname()?,
        replace_blanks_in_model_name: config.replace_blanks_in_model_name,
    };
    let update_period_us = config.collect_interval_ms as i64 * 1000;

    let manager = WatchListManager::new(provider.clone(), config.collect_interval_ms);
    for class in PLANNED_CLASSES {
        let Some(watch_list) = manager.plan(class, &counters.dcgm_counters, &inventory)? else {
            continue;
        };
        registry.register(Arc::new(RawCollector::new(
            provider.clone(),
            inventory.clone(),
            counters,
            watch_list,
            opts.clone(),
        )));
    }

    for counter in &counters.exporter_counters {
        let collector = match counter.field_id {
            fields::DCGM_EXP_XID_ERRORS_COUNT => WindowedCollector::xid_errors(
                provider.clone(),
                inventory.clone(),
                counter.clone(),
                config.xid_window_ms,
                update_period_us,
                counters.label_counters(),
                opts.clone(),
            )?,
            fields::DCGM_EXP_CLOCK_EVENTS_COUNT => WindowedCollector::clock_events(
                provider.clone(),
                inventory.clone(),
                counter.clone(),
                config.clock_events_window_ms,
                update_period_us,
                counters.label_counters(),
                opts.clone(),
            )?,
            other => anyhow::bail!("no collector for derived counter id {other}"),
        };
        registry.register(Arc::new(collector));
    }

    if registry.is_empty() {
        warn!("No collectors registered; /metrics will be empty");
    }
    Ok(())
}

fn build_transforms(config: &Config, inventory: Arc<DeviceInventory>) -> Vec<Box<dyn Transform>> {
    let mut transforms: Vec<Box<dyn Transform>> = Vec::new();

    if config.kubernetes {
        let mut resource_names = vec![transform::kubernetes::NVIDIA_RESOURCE_NAME.to_string()];
        resource_names.extend(config.nvidia_resource_names.iter().cloned());
        transforms.push(Box::new(PodMapper::new(
            PodMapperConfig {
                device_id_type: config.kubernetes_gpu_id_type,
                use_old_namespace: config.use_old_namespace,
                nvidia_resource_names: resource_names,
                socket_path: Some(config.pod_resources_socket.clone()),
            },
            Arc::new(PodResourcesClient::new(&config.pod_resources_socket)),
            Arc::new(NvmlMigResolver::new()),
            inventory,
        )));
    }

    if let Some(job_dir) = &config.hpc_job_mapping_dir {
        transforms.push(Box::new(HpcMapper::new(job_dir)));
    }

    transforms
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Could not install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received interrupt"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });
}
