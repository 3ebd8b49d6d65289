//! `tollgate queues`: per-queue job counts from `/health/queues`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Counts {
    waiting: u64,
    delayed: u64,
    active: u64,
    completed: u64,
    failed: u64,
}

#[derive(Debug, Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Waiting")]
    waiting: u64,
    #[tabled(rename = "Delayed")]
    delayed: u64,
    #[tabled(rename = "Active")]
    active: u64,
    #[tabled(rename = "Completed")]
    completed: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
}

fn rows(queues: BTreeMap<String, Counts>) -> Vec<QueueRow> {
    queues
        .into_iter()
        .map(|(queue, c)| QueueRow {
            queue,
            waiting: c.waiting,
            delayed: c.delayed,
            active: c.active,
            completed: c.completed,
            failed: c.failed,
        })
        .collect()
}

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report = client.get_raw("/health/queues").await?;
    let queues: BTreeMap<String, Counts> = serde_json::from_value(
        report.get("queues").cloned().unwrap_or_default(),
    )
    .context("Unexpected /health/queues payload")?;

    output::print_list(&rows(queues), format)
}
