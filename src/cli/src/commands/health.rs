//! `tollgate health`: query `/health`.

use anyhow::Result;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

pub async fn execute(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.get_raw("/health").await?;

    if !matches!(format, OutputFormat::Table) {
        return output::print_item(&health, format);
    }

    let status = health
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    output::print_header("Server Health");
    output::print_detail("Status", status);
    output::print_detail("API URL", client.base_url());
    for key in ["version", "timestamp"] {
        if let Some(value) = health.get(key).and_then(|v| v.as_str()) {
            output::print_detail(key, value);
        }
    }

    if status == "healthy" {
        output::print_success("Server is up");
        Ok(())
    } else {
        anyhow::bail!("server reported status `{}`", status)
    }
}
