//! Periodic container resource snapshots
//!
//! Every period the recorder takes one `docker stats --no-stream` snapshot and
//! appends a row per container to `<out>/docker_stats.csv`. The next snapshot
//! is scheduled only after the previous one finished, so a slow daemon never
//! piles up overlapping calls.

use crate::container::ContainerRuntime;
use crate::error::{Result, SimulationError};
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Go template handed to `docker stats --format`
pub const DOCKER_STATS_FORMAT: &str =
    "{{.Name}}|{{.CPUPerc}}|{{.MemUsage}}|{{.MemPerc}}|{{.NetIO}}|{{.BlockIO}}|{{.PIDs}}";

/// Stats CSV file name inside the output directory
pub const STATS_FILE: &str = "docker_stats.csv";

const CSV_HEADER: &str =
    "timestamp,name,cpu_percent,mem_usage,mem_limit,mem_percent,net_in,net_out,block_in,block_out,pids\n";

/// One container's line of a stats snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRow {
    pub name: String,
    pub cpu_percent: String,
    pub mem_usage: String,
    pub mem_limit: String,
    pub mem_percent: String,
    pub net_in: String,
    pub net_out: String,
    pub block_in: String,
    pub block_out: String,
    pub pids: String,
}

fn split_pair(field: &str) -> (String, String) {
    match field.split_once('/') {
        Some((a, b)) => (a.trim().to_string(), b.trim().to_string()),
        None => (field.trim().to_string(), String::new()),
    }
}

/// Parse one line produced with [`DOCKER_STATS_FORMAT`]
pub fn parse_stats_line(line: &str) -> Result<StatsRow> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() != 7 {
        return Err(SimulationError::value(format!(
            "unexpected stats line '{}'",
            line
        )));
    }

    let (mem_usage, mem_limit) = split_pair(fields[2]);
    let (net_in, net_out) = split_pair(fields[4]);
    let (block_in, block_out) = split_pair(fields[5]);

    Ok(StatsRow {
        name: fields[0].trim().to_string(),
        cpu_percent: fields[1].trim().to_string(),
        mem_usage,
        mem_limit,
        mem_percent: fields[3].trim().to_string(),
        net_in,
        net_out,
        block_in,
        block_out,
        pids: fields[6].trim().to_string(),
    })
}

impl StatsRow {
    fn to_csv(&self, timestamp: &str) -> String {
        let fields: [&str; 11] = [
            timestamp,
            &self.name,
            &self.cpu_percent,
            &self.mem_usage,
            &self.mem_limit,
            &self.mem_percent,
            &self.net_in,
            &self.net_out,
            &self.block_in,
            &self.block_out,
            &self.pids,
        ];
        format!("{}\n", fields.join(","))
    }
}

/// Appends container stats snapshots to a CSV file
pub struct StatsRecorder {
    runtime: Arc<dyn ContainerRuntime>,
    path: PathBuf,
}

impl StatsRecorder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, output: &Path) -> Self {
        Self {
            runtime,
            path: output.join(STATS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take one snapshot; returns the number of rows written
    pub async fn snapshot(&self) -> Result<usize> {
        let raw = self.runtime.stats().await?;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut rows = String::new();
        let mut count = 0;
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match parse_stats_line(line) {
                Ok(row) => {
                    rows.push_str(&row.to_csv(&timestamp));
                    count += 1;
                }
                Err(e) => debug!("Skipping stats line: {}", e),
            }
        }

        let is_new = !tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        if is_new {
            file.write_all(CSV_HEADER.as_bytes()).await?;
        }
        file.write_all(rows.as_bytes()).await?;
        file.flush().await?;

        Ok(count)
    }

    /// Snapshot every `period` while `work` runs, including its cleanup, then
    /// stop. Shutdown requests do not cut recording short.
    pub async fn record_during<F: Future>(self, period: Duration, work: F) -> F::Output {
        let stop = CancellationToken::new();
        let task = self.spawn(period, stop.clone());

        let output = work.await;

        stop.cancel();
        if let Err(e) = task.await {
            warn!("Stats task ended abnormally: {}", e);
        }
        output
    }

    /// Snapshot every `period` until `cancel` fires
    pub fn spawn(self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.snapshot().await {
                    warn!("Failed to record container stats: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
