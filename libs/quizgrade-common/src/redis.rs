use crate::types::{Attempt, EvaluationJob, FeedbackEmail, Notification, Topic};
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, RedisResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Redis key layout shared by the worker and the external API
/// Keys are deterministic so both sides never drift

pub const ATTEMPT_PREFIX: &str = "quizgrade:attempt";
pub const QUIZ_ATTEMPTS_PREFIX: &str = "quizgrade:quiz";
pub const TOPIC_PREFIX: &str = "quizgrade:topic";
pub const OPEN_ATTEMPTS_KEY: &str = "quizgrade:attempts:open";
pub const MAIL_QUEUE_KEY: &str = "quizgrade:mail";
pub const JOB_QUEUE_KEY: &str = "quizgrade:jobs";

/// Sets `end_time` on attempts that are still open, leaving the rest of the
/// stored document as it is now. KEYS[1] is the open set, KEYS[2..] the
/// attempt documents; ARGV holds (id, JSON end time) pairs. Returns the ids
/// that were closed.
const CLOSE_ATTEMPTS_SCRIPT: &str = r#"
local open_key = KEYS[1]
local closed = {}
for i = 2, #KEYS do
  local id = ARGV[2 * i - 3]
  local end_time = ARGV[2 * i - 2]
  if redis.call('SISMEMBER', open_key, id) == 1 then
    local doc = redis.call('GET', KEYS[i])
    if doc then
      local current = cjson.decode(doc).end_time
      local patched
      if current == cjson.null then
        patched = string.gsub(doc, '"end_time"%s*:%s*null', '"end_time":' .. end_time, 1)
      elseif current == nil then
        patched = string.gsub(doc, '^%s*{', '{"end_time":' .. end_time .. ',', 1)
      end
      if patched then
        redis.call('SET', KEYS[i], patched)
        redis.call('SREM', open_key, id)
        table.insert(closed, id)
      end
    end
  end
end
return closed
"#;

pub fn attempt_key(attempt_id: &Uuid) -> String {
    format!("{}:{}", ATTEMPT_PREFIX, attempt_id)
}

/// Set of attempt ids belonging to a quiz
pub fn quiz_attempts_key(quiz_id: &Uuid) -> String {
    format!("{}:{}:attempts", QUIZ_ATTEMPTS_PREFIX, quiz_id)
}

/// Pub/sub channel for a notification topic
pub fn topic_channel(topic: &Topic) -> String {
    format!("{}:{}", TOPIC_PREFIX, topic)
}

fn encode<T: Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string())))
}

fn decode<T: DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string())))
}

/// Queue the attempt document writes and index updates onto a pipeline
fn queue_attempt_writes(pipe: &mut redis::Pipeline, attempt: &Attempt) -> RedisResult<()> {
    let payload = encode(attempt)?;
    let id = attempt.id.to_string();

    pipe.set(attempt_key(&attempt.id), payload).ignore();
    pipe.sadd(quiz_attempts_key(&attempt.quiz.id), &id).ignore();
    if attempt.is_submitted() {
        pipe.srem(OPEN_ATTEMPTS_KEY, &id).ignore();
    } else {
        pipe.sadd(OPEN_ATTEMPTS_KEY, &id).ignore();
    }
    Ok(())
}

/// Store one attempt and keep the open/per-quiz indexes in sync
pub async fn store_attempt(
    conn: &mut redis::aio::ConnectionManager,
    attempt: &Attempt,
) -> RedisResult<()> {
    store_attempts(conn, std::slice::from_ref(attempt)).await
}

/// Store several attempts in one atomic batch
pub async fn store_attempts(
    conn: &mut redis::aio::ConnectionManager,
    attempts: &[Attempt],
) -> RedisResult<()> {
    if attempts.is_empty() {
        return Ok(());
    }

    let mut pipe = redis::pipe();
    pipe.atomic();
    for attempt in attempts {
        queue_attempt_writes(&mut pipe, attempt)?;
    }
    pipe.query_async::<_, ()>(conn).await
}

/// Close attempts in one atomic step, each at its given end time
///
/// Attempts submitted or closed since they were read are left untouched and
/// are missing from the returned ids.
pub async fn close_attempts(
    conn: &mut redis::aio::ConnectionManager,
    closures: &[(Uuid, DateTime<Utc>)],
) -> RedisResult<Vec<Uuid>> {
    if closures.is_empty() {
        return Ok(Vec::new());
    }

    let script = redis::Script::new(CLOSE_ATTEMPTS_SCRIPT);
    let mut invocation = script.prepare_invoke();
    invocation.key(OPEN_ATTEMPTS_KEY);
    for (attempt_id, end_time) in closures {
        invocation
            .key(attempt_key(attempt_id))
            .arg(attempt_id.to_string())
            .arg(encode(end_time)?);
    }

    let closed: Vec<String> = invocation.invoke_async(conn).await?;
    closed
        .iter()
        .map(|id| {
            Uuid::parse_str(id).map_err(|e| {
                redis::RedisError::from((redis::ErrorKind::TypeError, "invalid attempt id", e.to_string()))
            })
        })
        .collect()
}

pub async fn get_attempt(
    conn: &mut redis::aio::ConnectionManager,
    attempt_id: &Uuid,
) -> RedisResult<Option<Attempt>> {
    let payload: Option<String> = conn.get(attempt_key(attempt_id)).await?;
    payload.map(|data| decode(&data)).transpose()
}

async fn get_attempts_in(
    conn: &mut redis::aio::ConnectionManager,
    set_key: &str,
) -> RedisResult<Vec<Attempt>> {
    let ids: Vec<String> = conn.smembers(set_key).await?;
    let mut attempts = Vec::with_capacity(ids.len());

    for id in ids {
        let payload: Option<String> = conn.get(format!("{}:{}", ATTEMPT_PREFIX, id)).await?;
        // Index entries can outlive their document; skip them
        if let Some(data) = payload {
            attempts.push(decode(&data)?);
        }
    }
    Ok(attempts)
}

/// Attempts that have not been submitted yet
pub async fn get_open_attempts(
    conn: &mut redis::aio::ConnectionManager,
) -> RedisResult<Vec<Attempt>> {
    get_attempts_in(conn, OPEN_ATTEMPTS_KEY).await
}

pub async fn get_quiz_attempts(
    conn: &mut redis::aio::ConnectionManager,
    quiz_id: &Uuid,
) -> RedisResult<Vec<Attempt>> {
    get_attempts_in(conn, &quiz_attempts_key(quiz_id)).await
}

/// Publish a notification on a topic channel
pub async fn publish_notification(
    conn: &mut redis::aio::ConnectionManager,
    topic: &Topic,
    notification: &Notification,
) -> RedisResult<()> {
    let payload = encode(notification)?;
    let _: i64 = conn.publish(topic_channel(topic), payload).await?;
    Ok(())
}

/// Hand a feedback email request to the mail service (RPUSH, FIFO)
pub async fn push_feedback_email(
    conn: &mut redis::aio::ConnectionManager,
    email: &FeedbackEmail,
) -> RedisResult<()> {
    let payload = encode(email)?;
    conn.rpush(MAIL_QUEUE_KEY, payload).await
}

/// Hand a submitted attempt to the grading workers (RPUSH, FIFO)
pub async fn push_evaluation_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &EvaluationJob,
) -> RedisResult<()> {
    let payload = encode(job)?;
    conn.rpush(JOB_QUEUE_KEY, payload).await
}

/// Pop the next evaluation job
/// Uses BLPOP with timeout so callers can check for shutdown between polls
pub async fn pop_evaluation_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<EvaluationJob>> {
    let result: Option<(String, String)> = conn.blpop(JOB_QUEUE_KEY, timeout_seconds).await?;
    result.map(|(_key, payload)| decode(&payload)).transpose()
}
