//! Post-collection transformations, applied after `Gather` and before
//! rendering, in configured order. Each transformation mutates the metric
//! map in place and is idempotent over a single scrape. A failure
//! short-circuits the remaining chain.

pub mod hpc;
pub mod kubernetes;
pub mod mig;
pub mod podresources;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::collectors::MetricsByClass;

#[async_trait]
pub trait Transform: Send + Sync {
    /// Stable name used in logs and error context.
    fn name(&self) -> &str;
    async fn process(&self, metrics: &mut MetricsByClass) -> Result<()>;
}

pub async fn apply_all(
    transforms: &[Box<dyn Transform>],
    metrics: &mut MetricsByClass,
) -> Result<()> {
    for transform in transforms {
        transform
            .process(metrics)
            .await
            .with_context(|| format!("transformation {} failed", transform.name()))?;
    }
    Ok(())
}
