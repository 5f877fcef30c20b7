//! Metric catalog: the user-supplied list of fields to scrape.
//!
//! The input is a CSV-like file of `field_name, prom_type, help` records.
//! Names resolve against the known-field table, then the legacy-alias
//! table, then the small set of exporter-derived counters. Ordering is
//! preserved end to end because it decides scrape label column order.

use std::collections::HashSet;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, Trim};
use tracing::warn;

use crate::dcgm::fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromType {
    Gauge,
    Counter,
    Histogram,
    Summary,
    /// Not emitted as a metric; projected into other metrics' label columns.
    Label,
}

impl FromStr for PromType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "gauge" => Self::Gauge,
            "counter" => Self::Counter,
            "histogram" => Self::Histogram,
            "summary" => Self::Summary,
            "label" => Self::Label,
            other => bail!("invalid Prometheus metric type: {other}"),
        })
    }
}

impl fmt::Display for PromType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
            Self::Label => "label",
        })
    }
}

/// One metric descriptor from the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    pub field_id: u16,
    pub field_name: String,
    pub prom_type: PromType,
    pub help: String,
}

/// Parsed catalog, split into provider-read and exporter-derived counters.
/// Both lists keep the input order.
#[derive(Debug, Clone, Default)]
pub struct CounterSet {
    pub dcgm_counters: Vec<Counter>,
    pub exporter_counters: Vec<Counter>,
}

impl CounterSet {
    pub fn is_empty(&self) -> bool {
        self.dcgm_counters.is_empty() && self.exporter_counters.is_empty()
    }

    /// Label-typed raw counters, used to enrich derived event metrics.
    pub fn label_counters(&self) -> Vec<Counter> {
        self.dcgm_counters
            .iter()
            .filter(|c| c.prom_type == PromType::Label)
            .cloned()
            .collect()
    }
}

/// Derived counters the exporter computes itself (windowed event counts).
static EXPORTER_COUNTERS: &[(&str, u16)] = &[
    ("DCGM_EXP_XID_ERRORS_COUNT", fields::DCGM_EXP_XID_ERRORS_COUNT),
    (
        "DCGM_EXP_CLOCK_EVENTS_COUNT",
        fields::DCGM_EXP_CLOCK_EVENTS_COUNT,
    ),
];

fn derived_field_id(name: &str) -> Option<u16> {
    EXPORTER_COUNTERS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, id)| *id)
}

/// Policy for the profiling (DCP) field range, derived from configuration.
#[derive(Debug, Clone, Default)]
pub struct DcpPolicy {
    pub collect_dcp: bool,
    /// Field ids present in any enabled metric group.
    pub enabled_fields: HashSet<u16>,
}

impl DcpPolicy {
    fn allows(&self, field_id: u16) -> bool {
        self.collect_dcp && self.enabled_fields.contains(&field_id)
    }
}

pub fn parse_catalog_file(path: &Path, dcp: &DcpPolicy) -> Result<CounterSet> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("could not open collectors file {}", path.display()))?;
    extract_counters(file, dcp)
        .with_context(|| format!("could not parse collectors file {}", path.display()))
}

pub fn extract_counters<R: Read>(input: R, dcp: &DcpPolicy) -> Result<CounterSet> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(Trim::All)
        .flexible(true)
        .from_reader(input);

    let mut set = CounterSet::default();

    for record in reader.records() {
        let record = record.context("malformed CSV record")?;
        if record.len() == 1 && record[0].is_empty() {
            continue;
        }
        if record.len() != 3 {
            bail!("malformed CSV record: {:?}", record);
        }

        let field_name = record[0].to_string();
        let prom_type: PromType = record[1].parse()?;
        let help = record[2].to_string();

        let raw_id = fields::field_by_name(&field_name)
            .map(|def| def.id)
            .or_else(|| fields::legacy_alias(&field_name));

        if let Some(field_id) = raw_id {
            if fields::is_dcp_field(field_id) && !dcp.allows(field_id) {
                warn!(
                    field = %field_name,
                    "Skipping profiling field: DCP metrics are not enabled for it"
                );
                continue;
            }
            set.dcgm_counters.push(Counter {
                field_id,
                field_name,
                prom_type,
                help,
            });
        } else if let Some(field_id) = derived_field_id(&field_name) {
            set.exporter_counters.push(Counter {
                field_id,
                field_name,
                prom_type,
                help,
            });
        } else {
            bail!("could not find DCGM field: {field_name}");
        }
    }

    Ok(set)
}
