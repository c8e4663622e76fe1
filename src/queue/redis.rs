use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};
use tracing::debug;

use crate::{
    clients::redis::RedisClient,
    error::QueueError,
    models::{
        job::{JobCounts, JobId, JobOptions, NewJob, QueuedJob, StalledFailure, StalledSweep},
        status::JobState,
    },
    queue::backend::{QueueBackend, STALLED_REASON, deadline_after},
};

// Waiting jobs are scored `priority * 2^32 + id`, so the lowest score is the
// most urgent job and equal priorities keep insertion order. Scores stay exact
// doubles because `JobQueue::add` caps priorities at `MAX_PRIORITY`.

/// How long the token of a finished transition is remembered, so a repeated
/// `complete`/`fail` from the same worker reports success instead of a lost lock.
const SETTLED_TTL_SECS: u64 = 3600;

const ADD_JOB: &str = r#"
local id = redis.call('INCR', KEYS[1])
local jobKey = ARGV[1] .. id
local delayUntil = tonumber(ARGV[8])
local state = 'waiting'
if delayUntil > 0 then
  state = 'delayed'
end
redis.call('HSET', jobKey, 'name', ARGV[2], 'data', ARGV[3], 'opts', ARGV[4],
  'priority', ARGV[5], 'remove_on_fail', ARGV[6], 'timestamp', ARGV[7],
  'attempts_made', 0, 'stalled_count', 0, 'state', state)
if delayUntil > 0 then
  redis.call('ZADD', KEYS[3], delayUntil, id)
else
  redis.call('ZADD', KEYS[2], string.format('%.0f', tonumber(ARGV[5]) * 4294967296 + id), id)
end
return id
"#;

const FETCH_NEXT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, id in ipairs(due) do
  local jobKey = ARGV[1] .. id
  local priority = tonumber(redis.call('HGET', jobKey, 'priority') or '0')
  redis.call('ZREM', KEYS[2], id)
  redis.call('ZADD', KEYS[1], string.format('%.0f', priority * 4294967296 + tonumber(id)), id)
  redis.call('HSET', jobKey, 'state', 'waiting')
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
  return false
end
local id = head[1]
local jobKey = ARGV[1] .. id
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], ARGV[3], id)
redis.call('HSET', jobKey, 'state', 'active', 'lock', ARGV[4], 'processed_on', ARGV[2])
return id
"#;

const EXTEND_LOCK: &str = r#"
if redis.call('HGET', KEYS[2], 'lock') ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
return 1
"#;

const COMPLETE_JOB: &str = r#"
if redis.call('HGET', KEYS[3], 'lock') ~= ARGV[2] then
  if redis.call('GET', KEYS[4]) == ARGV[2] then
    return 0
  end
  return -1
end
redis.call('SET', KEYS[4], ARGV[2], 'EX', ARGV[5])
redis.call('ZREM', KEYS[1], ARGV[1])
if ARGV[3] == '1' then
  redis.call('DEL', KEYS[3])
else
  redis.call('HDEL', KEYS[3], 'lock')
  redis.call('HSET', KEYS[3], 'state', 'completed', 'finished_on', ARGV[4])
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
end
return 1
"#;

const FAIL_JOB: &str = r#"
if redis.call('HGET', KEYS[4], 'lock') ~= ARGV[2] then
  if redis.call('GET', KEYS[5]) == ARGV[2] then
    return 0
  end
  return -1
end
redis.call('SET', KEYS[5], ARGV[2], 'EX', ARGV[7])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[4], 'lock')
redis.call('HINCRBY', KEYS[4], 'attempts_made', 1)
redis.call('HSET', KEYS[4], 'failed_reason', ARGV[3])
if tonumber(ARGV[4]) > 0 then
  redis.call('HSET', KEYS[4], 'state', 'delayed')
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
elseif ARGV[5] == '1' then
  redis.call('DEL', KEYS[4])
else
  redis.call('HSET', KEYS[4], 'state', 'failed', 'finished_on', ARGV[6])
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[1])
end
return 1
"#;

const RECOVER_STALLED: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
local requeued = {}
local failed = {}
for _, id in ipairs(expired) do
  local jobKey = ARGV[1] .. id
  redis.call('ZREM', KEYS[1], id)
  if redis.call('EXISTS', jobKey) == 1 then
    redis.call('HDEL', jobKey, 'lock')
    local stalled = redis.call('HINCRBY', jobKey, 'stalled_count', 1)
    if stalled > tonumber(ARGV[3]) then
      table.insert(failed, id)
      table.insert(failed, redis.call('HGET', jobKey, 'name') or '')
      table.insert(failed, redis.call('HGET', jobKey, 'attempts_made') or '0')
      if redis.call('HGET', jobKey, 'remove_on_fail') == '1' then
        redis.call('DEL', jobKey)
      else
        redis.call('HSET', jobKey, 'state', 'failed', 'finished_on', ARGV[2], 'failed_reason', ARGV[4])
        redis.call('ZADD', KEYS[3], ARGV[2], id)
      end
    else
      local priority = tonumber(redis.call('HGET', jobKey, 'priority') or '0')
      redis.call('HSET', jobKey, 'state', 'waiting')
      redis.call('ZADD', KEYS[2], string.format('%.0f', priority * 4294967296 + tonumber(id)), id)
      table.insert(requeued, id)
    end
  end
end
return {requeued, failed}
"#;

const OBLITERATE: &str = r#"
if ARGV[2] ~= '1' and redis.call('ZCARD', KEYS[3]) > 0 then
  return -1
end
for i = 1, 5 do
  local ids = redis.call('ZRANGE', KEYS[i], 0, -1)
  for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[1] .. id)
  end
  redis.call('DEL', KEYS[i])
end
redis.call('DEL', KEYS[6])
return 1
"#;

struct Scripts {
    add: Script,
    fetch_next: Script,
    extend_lock: Script,
    complete: Script,
    fail: Script,
    recover_stalled: Script,
    obliterate: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            add: Script::new(ADD_JOB),
            fetch_next: Script::new(FETCH_NEXT),
            extend_lock: Script::new(EXTEND_LOCK),
            complete: Script::new(COMPLETE_JOB),
            fail: Script::new(FAIL_JOB),
            recover_stalled: Script::new(RECOVER_STALLED),
            obliterate: Script::new(OBLITERATE),
        }
    }
}

/// Durable backend keeping each queue under `{prefix}:{queue}:*`: sorted sets
/// for waiting, delayed, active, completed and failed ids, and one hash per job.
pub struct RedisBackend {
    connection: MultiplexedConnection,
    prefix: String,
    scripts: Scripts,
}

impl RedisBackend {
    pub fn new(client: &RedisClient, prefix: impl Into<String>) -> Self {
        Self {
            connection: client.connection(),
            prefix: prefix.into(),
            scripts: Scripts::load(),
        }
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn job_prefix(&self, queue: &str) -> String {
        format!("{}:{}:", self.prefix, queue)
    }

    fn job_key(&self, queue: &str, id: JobId) -> String {
        format!("{}:{}:{}", self.prefix, queue, id)
    }

    fn settled_key(&self, queue: &str, id: JobId) -> String {
        format!("{}:{}:settled:{}", self.prefix, queue, id)
    }

    async fn load_job(&self, queue: &str, id: JobId) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(queue, id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        parse_job(id, &fields).map(Some)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn add(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError> {
        let mut conn = self.connection.clone();
        let now = Utc::now();

        let delay_until = job
            .opts
            .delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| deadline_after(now, Duration::from_millis(ms)).timestamp_millis())
            .unwrap_or(0);

        let id: u64 = self
            .scripts
            .add
            .key(self.key(queue, "id"))
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "delayed"))
            .arg(self.job_prefix(queue))
            .arg(&job.name)
            .arg(serde_json::to_string(&job.data)?)
            .arg(serde_json::to_string(&job.opts)?)
            .arg(job.opts.priority)
            .arg(flag(job.opts.remove_on_fail))
            .arg(now.timestamp_millis())
            .arg(delay_until)
            .invoke_async(&mut conn)
            .await?;

        debug!(queue, job_id = id, name = %job.name, "Job stored");

        Ok(JobId(id))
    }

    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        lock_duration: Duration,
    ) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.connection.clone();
        let now = Utc::now();

        let id: Option<String> = self
            .scripts
            .fetch_next
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "active"))
            .arg(self.job_prefix(queue))
            .arg(now.timestamp_millis())
            .arg(deadline_after(now, lock_duration).timestamp_millis())
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        match id {
            Some(id) => self.load_job(queue, parse_id(&id)?).await,
            None => Ok(None),
        }
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        lock_duration: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.connection.clone();

        let extended: i64 = self
            .scripts
            .extend_lock
            .key(self.key(queue, "active"))
            .key(self.job_key(queue, id))
            .arg(id.0)
            .arg(token)
            .arg(deadline_after(Utc::now(), lock_duration).timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(extended == 1)
    }

    async fn complete(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        remove: bool,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();

        let outcome: i64 = self
            .scripts
            .complete
            .key(self.key(queue, "active"))
            .key(self.key(queue, "completed"))
            .key(self.job_key(queue, id))
            .key(self.settled_key(queue, id))
            .arg(id.0)
            .arg(token)
            .arg(flag(remove))
            .arg(Utc::now().timestamp_millis())
            .arg(SETTLED_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        if outcome < 0 {
            return Err(QueueError::LockLost(id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        id: JobId,
        token: &str,
        reason: &str,
        retry_at: Option<DateTime<Utc>>,
        remove: bool,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();

        let outcome: i64 = self
            .scripts
            .fail
            .key(self.key(queue, "active"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "failed"))
            .key(self.job_key(queue, id))
            .key(self.settled_key(queue, id))
            .arg(id.0)
            .arg(token)
            .arg(reason)
            .arg(retry_at.map(|at| at.timestamp_millis().max(1)).unwrap_or(0))
            .arg(flag(remove))
            .arg(Utc::now().timestamp_millis())
            .arg(SETTLED_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;

        if outcome < 0 {
            return Err(QueueError::LockLost(id));
        }
        Ok(())
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledSweep, QueueError> {
        let mut conn = self.connection.clone();

        let (requeued, failed): (Vec<String>, Vec<String>) = self
            .scripts
            .recover_stalled
            .key(self.key(queue, "active"))
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "failed"))
            .arg(self.job_prefix(queue))
            .arg(Utc::now().timestamp_millis())
            .arg(max_stalled_count)
            .arg(STALLED_REASON)
            .invoke_async(&mut conn)
            .await?;

        // `failed` comes back flattened as (id, name, attempts_made) triples.
        let failed = failed
            .chunks(3)
            .map(|entry| match entry {
                [id, name, attempts_made] => Ok(StalledFailure {
                    id: parse_id(id)?,
                    name: name.clone(),
                    attempts_made: attempts_made.parse().unwrap_or(0),
                }),
                _ => Err(QueueError::Corrupt("truncated stalled job entry".to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StalledSweep {
            requeued: requeued
                .iter()
                .map(|id| parse_id(id))
                .collect::<Result<_, _>>()?,
            failed,
        })
    }

    async fn get(&self, queue: &str, id: JobId) -> Result<Option<QueuedJob>, QueueError> {
        self.load_job(queue, id).await
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let mut conn = self.connection.clone();

        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(self.key(queue, "wait"))
                .zcard(self.key(queue, "delayed"))
                .zcard(self.key(queue, "active"))
                .zcard(self.key(queue, "completed"))
                .zcard(self.key(queue, "failed"))
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn obliterate(&self, queue: &str, force: bool) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();

        let outcome: i64 = self
            .scripts
            .obliterate
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "completed"))
            .key(self.key(queue, "failed"))
            .key(self.key(queue, "id"))
            .arg(self.job_prefix(queue))
            .arg(flag(force))
            .invoke_async(&mut conn)
            .await?;

        if outcome < 0 {
            return Err(QueueError::ActiveJobs(queue.to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn parse_id(raw: &str) -> Result<JobId, QueueError> {
    raw.parse::<u64>()
        .map(JobId)
        .map_err(|_| QueueError::Corrupt(format!("invalid job id '{}'", raw)))
}

fn parse_job(id: JobId, fields: &HashMap<String, String>) -> Result<QueuedJob, QueueError> {
    let text = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| QueueError::Corrupt(format!("job {} has no '{}' field", id, name)))
    };
    let number = |name: &str| -> Result<Option<i64>, QueueError> {
        fields
            .get(name)
            .map(|raw| {
                raw.parse::<i64>().map_err(|_| {
                    QueueError::Corrupt(format!("job {} has a non-numeric '{}'", id, name))
                })
            })
            .transpose()
    };
    let timestamp = |name: &str| -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(number(name)?.and_then(DateTime::<Utc>::from_timestamp_millis))
    };

    let state = JobState::from_string(text("state")?)
        .ok_or_else(|| QueueError::Corrupt(format!("job {} has an unknown state", id)))?;
    let opts: JobOptions = serde_json::from_str(text("opts")?)?;

    Ok(QueuedJob {
        id,
        name: text("name")?.clone(),
        data: serde_json::from_str(text("data")?)?,
        opts,
        state,
        attempts_made: number("attempts_made")?.unwrap_or(0) as u32,
        stalled_count: number("stalled_count")?.unwrap_or(0) as u32,
        created_at: timestamp("timestamp")?.unwrap_or_else(Utc::now),
        processed_at: timestamp("processed_on")?,
        finished_at: timestamp("finished_on")?,
        failed_reason: fields.get("failed_reason").cloned(),
    })
}
