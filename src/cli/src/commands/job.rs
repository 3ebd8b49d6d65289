//! `tollgate job`: enqueue, inspect and remove jobs.

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Clone, Copy, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    Fixed,
    Exponential,
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Enqueue a job
    Enqueue {
        /// Queue name
        queue: String,

        /// JSON payload, e.g. '{"to":"user@example.com"}'
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Higher is served first
        #[arg(long, default_value = "10")]
        priority: i32,

        /// Milliseconds before the job becomes eligible
        #[arg(long, default_value = "5000")]
        delay: i64,

        /// Total attempts, including the first
        #[arg(long, default_value = "3")]
        attempts: u32,

        /// Retry backoff strategy
        #[arg(long, value_enum, default_value = "exponential")]
        backoff: BackoffType,

        /// Backoff base delay in milliseconds
        #[arg(long, default_value = "2000")]
        backoff_delay: i64,
    },

    /// Show a job record
    Get {
        /// Job ID
        id: String,
    },

    /// Remove a job that is not currently active
    Remove {
        /// Job ID
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct Backoff {
    #[serde(rename = "type")]
    kind: BackoffType,
    delay: i64,
}

#[derive(Debug, Serialize)]
struct Options {
    priority: i32,
    delay: i64,
    attempts: u32,
    backoff: Backoff,
}

#[derive(Debug, Serialize)]
struct EnqueueRequest {
    payload: serde_json::Value,
    options: Options,
}

#[derive(Debug, Deserialize, Serialize)]
struct Enqueued {
    id: String,
    queue: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct Removed {
    id: String,
    removed: bool,
}

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Enqueue {
            queue,
            payload,
            priority,
            delay,
            attempts,
            backoff,
            backoff_delay,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let body = EnqueueRequest {
                payload,
                options: Options {
                    priority,
                    delay,
                    attempts,
                    backoff: Backoff {
                        kind: backoff,
                        delay: backoff_delay,
                    },
                },
            };

            let resp: Enqueued = client
                .post(&format!("/api/v1/queues/{}/jobs", queue), &body)
                .await?;

            match format {
                OutputFormat::Table => {
                    output::print_success("Job enqueued");
                    output::print_detail("ID", &resp.id);
                    output::print_detail("Queue", &resp.queue);
                    Ok(())
                }
                _ => output::print_item(&resp, format),
            }
        }

        JobCommands::Get { id } => {
            let job: serde_json::Value = client.get(&format!("/api/v1/jobs/{}", id)).await?;

            if !matches!(format, OutputFormat::Table) {
                return output::print_item(&job, format);
            }

            let field = |key: &str| match job.get(key) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => "-".to_string(),
                Some(other) => other.to_string(),
            };

            output::print_header(&format!("Job: {}", id));
            output::print_detail("Queue", &field("queue"));
            println!("  {}: {}", "State", output::state_label(&field("state")));
            let max_attempts = job
                .pointer("/options/attempts")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());
            output::print_detail(
                "Attempts",
                &format!("{}/{}", field("attempts_made"), max_attempts),
            );
            output::print_detail("Stalled", &field("stalled_count"));
            output::print_detail("Available at", &field("available_at"));
            output::print_detail("Last error", &field("last_error"));
            output::print_detail("Result", &field("result"));
            Ok(())
        }

        JobCommands::Remove { id } => {
            let resp: Removed = client.delete(&format!("/api/v1/jobs/{}", id)).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job {} removed", resp.id));
                    Ok(())
                }
                _ => output::print_item(&resp, format),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_request_wire_names() {
        let body = EnqueueRequest {
            payload: serde_json::json!({"to": "user@example.com"}),
            options: Options {
                priority: 10,
                delay: 5000,
                attempts: 3,
                backoff: Backoff {
                    kind: BackoffType::Exponential,
                    delay: 2000,
                },
            },
        };

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["options"]["backoff"]["type"], "exponential");
        assert_eq!(value["options"]["backoff"]["delay"], 2000);
        assert_eq!(value["options"]["attempts"], 3);
    }
}
