//! Redis-backed [`JobStore`].
//!
//! Key layout, all under the configured prefix:
//!
//! ```text
//! job:{id}                    HASH  scalar job fields, payload and result as JSON text
//! queue:{name}:waiting        ZSET  score -priority, member "{seq:020}:{id}"
//! queue:{name}:delayed        ZSET  score available_at (ms), member id
//! queue:{name}:active         ZSET  score lock_expires_at (ms), member id
//! queue:{name}:completed      ZSET  score finished_at (ms), member id
//! queue:{name}:failed         ZSET  score finished_at (ms), member id
//! queues                      SET   queue registry
//! job-seq                     STRING sequence counter
//! ```
//!
//! Equal scores in the waiting set sort by member, so the zero-padded
//! sequence gives FIFO order within a priority.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use super::job::{Job, JobId, JobOptions, JobState};
use super::store::{job_active, new_lease_token, JobCounts, JobStore};
use crate::clock::offset;
use crate::error::{Result, TollgateError};
use crate::store::RedisStore;

/// KEYS: waiting, delayed, active.
/// ARGV: now ms, worker id, lease token, lease expiry ms, job key prefix.
const CLAIM_NEXT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 1000)
for _, id in ipairs(due) do
    local jk = ARGV[5] .. id
    redis.call('ZREM', KEYS[2], id)
    local rank = redis.call('HGET', jk, 'rank')
    if rank then
        local priority = tonumber(redis.call('HGET', jk, 'priority') or '0')
        redis.call('ZADD', KEYS[1], -priority, rank)
        redis.call('HSET', jk, 'state', 'waiting')
    end
end

local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
    return false
end
redis.call('ZREM', KEYS[1], head[1])
local id = string.sub(head[1], 22)
local jk = ARGV[5] .. id
if redis.call('EXISTS', jk) == 0 then
    return false
end
redis.call('HSET', jk,
    'state', 'active',
    'locked_by', ARGV[2],
    'lock_token', ARGV[3],
    'lock_expires_at', ARGV[4],
    'started_at', ARGV[1])
redis.call('ZADD', KEYS[3], tonumber(ARGV[4]), id)
return redis.call('HGETALL', jk)
"#;

/// KEYS: job, active, target set.
/// ARGV: expected token, job id, target score, target member, field/value pairs...
const FINALIZE: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then
    return 0
end
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[2])
local fields = {}
for i = 5, #ARGV do
    fields[#fields + 1] = ARGV[i]
end
redis.call('HSET', KEYS[1], unpack(fields))
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[4])
return 1
"#;

/// KEYS: job, active. ARGV: token, new expiry ms, job id.
const EXTEND_LEASE: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then
    return 0
end
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'lock_expires_at', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// KEYS: job, waiting, delayed, completed, failed. ARGV: job id.
/// Returns -1 when missing, 0 when active, 1 when removed.
const REMOVE: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return -1
end
if state == 'active' then
    return 0
end
local rank = redis.call('HGET', KEYS[1], 'rank')
if rank then
    redis.call('ZREM', KEYS[2], rank)
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('DEL', KEYS[1])
return 1
"#;

/// Redis implementation of [`JobStore`], sharing the admission store's
/// connection.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    command_timeout: Duration,
    claim_script: Script,
    finalize_script: Script,
    extend_script: Script,
    remove_script: Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisJobStore {
    pub fn new(store: &RedisStore) -> Self {
        Self {
            conn: store.connection(),
            prefix: store.key_prefix().to_string(),
            command_timeout: store.command_timeout(),
            claim_script: Script::new(CLAIM_NEXT),
            finalize_script: Script::new(FINALIZE),
            extend_script: Script::new(EXTEND_LEASE),
            remove_script: Script::new(REMOVE),
        }
    }

    fn job_key_prefix(&self) -> String {
        format!("{}job:", self.prefix)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}job:{}", self.prefix, id)
    }

    fn queue_key(&self, queue: &str, state: JobState) -> String {
        format!("{}queue:{}:{}", self.prefix, queue, state.as_str())
    }

    fn registry_key(&self) -> String {
        format!("{}queues", self.prefix)
    }

    /// The set a job belongs to in its current state, with score and member.
    fn placement(&self, job: &Job) -> Result<(String, f64, String)> {
        let key = self.queue_key(&job.queue, job.state);
        match job.state {
            JobState::Waiting => Ok((key, -(job.options.priority as f64), job.rank())),
            JobState::Delayed => Ok((key, job.available_at.timestamp_millis() as f64, job.id.to_string())),
            JobState::Completed | JobState::Failed => {
                let at = job.finished_at.unwrap_or(job.available_at);
                Ok((key, at.timestamp_millis() as f64, job.id.to_string()))
            }
            JobState::Active => Err(TollgateError::internal(format!(
                "job {} cannot be placed while active",
                job.id
            ))),
        }
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(TollgateError::from),
            Err(_) => Err(TollgateError::store_timeout(operation)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Mapping
// ═══════════════════════════════════════════════════════════════════════════════

fn millis_field(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.timestamp_millis().to_string()).unwrap_or_default()
}

fn text_field(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Hash fields for a job. Absent optionals are stored as empty strings.
pub(crate) fn job_to_fields(job: &Job) -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("id", job.id.to_string()),
        ("queue", job.queue.clone()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("options", serde_json::to_string(&job.options)?),
        ("priority", job.options.priority.to_string()),
        ("rank", job.rank()),
        ("state", job.state.as_str().to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("stalled_count", job.stalled_count.to_string()),
        ("last_error", text_field(&job.last_error)),
        ("created_at", job.created_at.timestamp_millis().to_string()),
        ("available_at", job.available_at.timestamp_millis().to_string()),
        ("locked_by", text_field(&job.locked_by)),
        ("lock_token", text_field(&job.lock_token)),
        ("lock_expires_at", millis_field(job.lock_expires_at)),
        ("started_at", millis_field(job.started_at)),
        ("finished_at", millis_field(job.finished_at)),
        (
            "result",
            match &job.result {
                Some(value) => serde_json::to_string(value)?,
                None => String::new(),
            },
        ),
        ("seq", job.seq.to_string()),
    ])
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| TollgateError::internal(format!("job hash is missing field '{}'", name)))
}

fn optional(fields: &HashMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

fn parse_number<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
    required(fields, name)?
        .parse()
        .map_err(|_| TollgateError::internal(format!("job field '{}' is not numeric", name)))
}

fn parse_time(fields: &HashMap<String, String>, name: &str) -> Result<Option<DateTime<Utc>>> {
    match fields.get(name).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => {
            let ms: i64 = raw
                .parse()
                .map_err(|_| TollgateError::internal(format!("job field '{}' is not a timestamp", name)))?;
            Ok(Utc.timestamp_millis_opt(ms).single())
        }
    }
}

fn parse_required_time(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>> {
    parse_time(fields, name)?
        .ok_or_else(|| TollgateError::internal(format!("job hash is missing field '{}'", name)))
}

pub(crate) fn job_from_fields(fields: &HashMap<String, String>) -> Result<Job> {
    let options: JobOptions = serde_json::from_str(required(fields, "options")?)?;
    Ok(Job {
        id: required(fields, "id")?.parse()?,
        queue: required(fields, "queue")?.to_string(),
        payload: serde_json::from_str(required(fields, "payload")?)?,
        options,
        state: required(fields, "state")?.parse()?,
        attempts_made: parse_number(fields, "attempts_made")?,
        stalled_count: parse_number(fields, "stalled_count")?,
        last_error: optional(fields, "last_error"),
        created_at: parse_required_time(fields, "created_at")?,
        available_at: parse_required_time(fields, "available_at")?,
        locked_by: optional(fields, "locked_by"),
        lock_token: optional(fields, "lock_token"),
        lock_expires_at: parse_time(fields, "lock_expires_at")?,
        started_at: parse_time(fields, "started_at")?,
        finished_at: parse_time(fields, "finished_at")?,
        result: match optional(fields, "result") {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        },
        seq: parse_number(fields, "seq")?,
    })
}

fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        map.insert(k, v);
    }
    map
}

// ═══════════════════════════════════════════════════════════════════════════════
// JobStore Implementation
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl JobStore for RedisJobStore {
    async fn next_sequence(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let key = format!("{}job-seq", self.prefix);
        self.bounded("INCR", async move { conn.incr(&key, 1u64).await })
            .await
    }

    async fn insert(&self, job: &Job) -> Result<()> {
        let fields = job_to_fields(job)?;
        let (set_key, score, member) = self.placement(job)?;
        let job_key = self.job_key(job.id);
        let registry = self.registry_key();
        let queue = job.queue.clone();
        let mut conn = self.conn.clone();

        self.bounded("INSERT", async move {
            redis::pipe()
                .atomic()
                .hset_multiple(&job_key, &fields[..])
                .ignore()
                .zadd(&set_key, &member, score)
                .ignore()
                .sadd(&registry, &queue)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let key = self.job_key(id);
        let fields: HashMap<String, String> =
            self.bounded("HGETALL", async move { conn.hgetall(&key).await }).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(&fields).map(Some)
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let expires_at = offset(now, lease);
        let mut invocation = self.claim_script.prepare_invoke();
        invocation
            .key(self.queue_key(queue, JobState::Waiting))
            .key(self.queue_key(queue, JobState::Delayed))
            .key(self.queue_key(queue, JobState::Active))
            .arg(now.timestamp_millis())
            .arg(worker_id)
            .arg(new_lease_token())
            .arg(expires_at.timestamp_millis())
            .arg(self.job_key_prefix());

        let mut conn = self.conn.clone();
        let claimed: Option<Vec<String>> = self
            .bounded("CLAIM", async move { invocation.invoke_async(&mut conn).await })
            .await?;

        match claimed {
            Some(flat) if !flat.is_empty() => job_from_fields(&pairs_to_map(flat)).map(Some),
            _ => Ok(None),
        }
    }

    async fn finalize(&self, job: &Job, expected_token: &str) -> Result<()> {
        let (set_key, score, member) = self.placement(job)?;
        let mut invocation = self.finalize_script.prepare_invoke();
        invocation
            .key(self.job_key(job.id))
            .key(self.queue_key(&job.queue, JobState::Active))
            .key(set_key)
            .arg(expected_token)
            .arg(job.id.to_string())
            .arg(score)
            .arg(member);
        for (field, value) in job_to_fields(job)? {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let applied: i64 = self
            .bounded("FINALIZE", async move { invocation.invoke_async(&mut conn).await })
            .await?;

        if applied == 1 {
            Ok(())
        } else {
            Err(TollgateError::lease_conflict(job.id))
        }
    }

    async fn extend_lease(&self, id: JobId, token: &str, until: DateTime<Utc>) -> Result<bool> {
        let Some(job) = self.get(id).await? else {
            return Ok(false);
        };
        let mut invocation = self.extend_script.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.queue_key(&job.queue, JobState::Active))
            .arg(token)
            .arg(until.timestamp_millis())
            .arg(id.to_string());

        let mut conn = self.conn.clone();
        let extended: i64 = self
            .bounded("EXTEND_LEASE", async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(extended == 1)
    }

    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let key = self.queue_key(queue, JobState::Active);
        let max = now.timestamp_millis();
        let ids: Vec<String> = self
            .bounded("ZRANGEBYSCORE", async move {
                conn.zrangebyscore(&key, "-inf", max).await
            })
            .await?;

        let mut expired = Vec::with_capacity(ids.len());
        for raw in ids {
            let id: JobId = raw.parse()?;
            if let Some(job) = self.get(id).await? {
                if job.lease_expired(now) {
                    expired.push(job);
                }
            }
        }
        Ok(expired)
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = self.job_key(id);
        let queue: Option<String> = self
            .bounded("HGET", async move { conn.hget(&key, "queue").await })
            .await?;
        let Some(queue) = queue else {
            return Ok(false);
        };

        let mut invocation = self.remove_script.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.queue_key(&queue, JobState::Waiting))
            .key(self.queue_key(&queue, JobState::Delayed))
            .key(self.queue_key(&queue, JobState::Completed))
            .key(self.queue_key(&queue, JobState::Failed))
            .arg(id.to_string());

        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .bounded("REMOVE", async move { invocation.invoke_async(&mut conn).await })
            .await?;

        match outcome {
            1 => Ok(true),
            0 => Err(job_active(id)),
            _ => Ok(false),
        }
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let mut pipe = redis::pipe();
        for state in JobState::ALL {
            pipe.zcard(self.queue_key(queue, state));
        }
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = self
            .bounded("COUNTS", async move { pipe.query_async(&mut conn).await })
            .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = self.registry_key();
        let mut queues: Vec<String> = self
            .bounded("SMEMBERS", async move { conn.smembers(&key).await })
            .await?;
        queues.sort();
        Ok(queues)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
