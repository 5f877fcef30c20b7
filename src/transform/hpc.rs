//! HPC job mapper: fan metrics out per job id from a scheduler-maintained
//! directory, one file per GPU index.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::Transform;
use crate::collectors::{Metric, MetricsByClass};

pub struct HpcMapper {
    job_dir: PathBuf,
}

impl HpcMapper {
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_dir: job_dir.into(),
        }
    }

    /// Read the job directory into a GPU-index → job-ids map. Entries that
    /// are not regular files named by a non-negative integer are skipped.
    fn read_job_map(&self) -> Result<HashMap<String, Vec<String>>> {
        let entries = std::fs::read_dir(&self.job_dir)
            .with_context(|| format!("could not read job directory {}", self.job_dir.display()))?;

        let mut map = HashMap::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Unreadable job directory entry; skipping");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.parse::<u32>().is_err() {
                debug!(name, "Job directory entry is not a GPU index; skipping");
                continue;
            }
            match entry.file_type() {
                Ok(file_type) if file_type.is_file() => {}
                _ => {
                    debug!(name, "Job directory entry is not a regular file; skipping");
                    continue;
                }
            }
            let contents = match std::fs::read_to_string(entry.path()) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!(name, error = %e, "Could not read job file; skipping");
                    continue;
                }
            };
            let jobs: Vec<String> = contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            if !jobs.is_empty() {
                map.insert(name, jobs);
            }
        }
        Ok(map)
    }
}

#[async_trait]
impl Transform for HpcMapper {
    fn name(&self) -> &str {
        "hpc-job-mapper"
    }

    async fn process(&self, metrics: &mut MetricsByClass) -> Result<()> {
        let job_map = self.read_job_map()?;
        if job_map.is_empty() {
            return Ok(());
        }

        for (_class, set) in metrics.iter_mut() {
            for (_counter, class_metrics) in set.iter_mut() {
                let mut mapped: Vec<Metric> = Vec::with_capacity(class_metrics.len());
                for metric in class_metrics.drain(..) {
                    match job_map.get(&metric.gpu) {
                        Some(jobs) => {
                            // One copy per job; label maps are deep-copied
                            // by clone so the fan-out never aliases.
                            for job in jobs {
                                let mut copy = metric.clone();
                                copy.attributes.insert("hpc_job", job.clone());
                                mapped.push(copy);
                            }
                        }
                        None => mapped.push(metric),
                    }
                }
                *class_metrics = mapped;
            }
        }
        Ok(())
    }
}
