// Attempt expiry monitor: auto-submits attempts whose time ran out

use crate::queue::EvaluationQueue;
use crate::services::{notify, AttemptStore, NotificationSink};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quizgrade_common::types::{Attempt, EventKind, Notification, Topic};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub struct ExpiryMonitor {
    store: Arc<dyn AttemptStore>,
    notifier: Arc<dyn NotificationSink>,
    queue: Arc<EvaluationQueue>,
    poll_interval: Duration,
    grace_period: Duration,
}

impl ExpiryMonitor {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        notifier: Arc<dyn NotificationSink>,
        queue: Arc<EvaluationQueue>,
        poll_interval: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            queue,
            poll_interval,
            grace_period,
        }
    }

    #[instrument(skip(self, token), fields(interval_secs = self.poll_interval.as_secs()))]
    pub async fn run(&self, token: CancellationToken) {
        info!(grace_secs = self.grace_period.as_secs(), "Expiry monitor started");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick_at(Utc::now()).await {
                        Ok(0) => {}
                        Ok(expired) => info!(expired = expired, "Auto-submitted expired attempts"),
                        // Next tick retries; nothing was persisted
                        Err(e) => error!(error = %format!("{:#}", e), "Expiry sweep failed"),
                    }
                }
            }
        }

        info!("Expiry monitor stopped");
    }

    /// One sweep as of `now`; returns how many attempts were auto-submitted
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let grace = chrono::Duration::from_std(self.grace_period).context("Grace period out of range")?;

        let mut expired: Vec<(Attempt, DateTime<Utc>)> = Vec::new();
        for attempt in self.store.load_open_attempts().await? {
            if attempt.is_submitted() {
                continue;
            }
            let Some(deadline) = attempt.deadline() else {
                warn!(
                    attempt_id = %attempt.id,
                    duration_minutes = attempt.quiz.duration_minutes,
                    "Attempt deadline out of range; skipped"
                );
                continue;
            };
            if deadline.checked_add_signed(grace).is_some_and(|cutoff| cutoff <= now) {
                expired.push((attempt, deadline));
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        // Recorded end is when the attempt should have ended, not the sweep time
        let closures: Vec<(Uuid, DateTime<Utc>)> = expired.iter().map(|(a, deadline)| (a.id, *deadline)).collect();
        let closed: HashSet<Uuid> = self.store.close_attempts(&closures).await?.into_iter().collect();

        let mut submitted = 0;
        for (attempt, deadline) in expired {
            if !closed.contains(&attempt.id) {
                debug!(attempt_id = %attempt.id, "Attempt submitted during sweep; left as is");
                continue;
            }
            submitted += 1;
            info!(attempt_id = %attempt.id, quiz_id = %attempt.quiz.id, deadline = %deadline, "Attempt auto-submitted");

            let notification = Notification::new(EventKind::AttemptAutoSubmitted, attempt.quiz.id, Some(attempt.id))
                .with_message(format!("Time ran out at {}", deadline.to_rfc3339()));
            notify(self.notifier.as_ref(), &Topic::User(attempt.examinee.id), &notification).await;
            notify(self.notifier.as_ref(), &Topic::User(attempt.quiz.examiner_id), &notification).await;

            if let Err(e) = self.queue.enqueue(attempt.job()) {
                error!(attempt_id = %attempt.id, error = %e, "Failed to enqueue evaluation");
            }
        }

        Ok(submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn monitor(store: Arc<MemoryStore>, sink: Arc<RecordingSink>, queue: Arc<EvaluationQueue>) -> ExpiryMonitor {
        ExpiryMonitor::new(store, sink, queue, Duration::from_secs(10), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_grace_period_respected() {
        // 60 minute attempt: deadline 10:00, grace until 10:00:30
        let a = attempt(quiz(60, vec![]), vec![], start(), None);
        let store = MemoryStore::with(vec![a.clone()]);
        let queue = Arc::new(EvaluationQueue::new());
        let m = monitor(store.clone(), RecordingSink::new(), queue.clone());

        let deadline = start() + ChronoDuration::minutes(60);
        assert_eq!(m.tick_at(deadline + ChronoDuration::seconds(10)).await.unwrap(), 0);
        assert!(store.get(a.id).unwrap().end_time.is_none());

        assert_eq!(m.tick_at(deadline + ChronoDuration::seconds(31)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_end_time_is_deadline_not_now() {
        let a = attempt(quiz(60, vec![]), vec![], start(), None);
        let store = MemoryStore::with(vec![a.clone()]);
        let queue = Arc::new(EvaluationQueue::new());
        let m = monitor(store.clone(), RecordingSink::new(), queue.clone());

        let now = start() + ChronoDuration::hours(5);
        m.tick_at(now).await.unwrap();

        assert_eq!(store.get(a.id).unwrap().end_time, Some(start() + ChronoDuration::minutes(60)));
    }

    #[tokio::test]
    async fn test_quiz_end_date_caps_deadline() {
        let mut q = quiz(120, vec![]);
        q.end_date = Some(start() + ChronoDuration::minutes(45));
        let a = attempt(q, vec![], start(), None);
        let store = MemoryStore::with(vec![a.clone()]);
        let m = monitor(store.clone(), RecordingSink::new(), Arc::new(EvaluationQueue::new()));

        m.tick_at(start() + ChronoDuration::minutes(50)).await.unwrap();

        assert_eq!(store.get(a.id).unwrap().end_time, Some(start() + ChronoDuration::minutes(45)));
    }

    #[tokio::test]
    async fn test_expired_attempts_saved_notified_and_enqueued() {
        let expired_a = attempt(quiz(30, vec![]), vec![], start(), None);
        let expired_b = attempt(quiz(30, vec![]), vec![], start(), None);
        let running = attempt(quiz(30, vec![]), vec![], start() + ChronoDuration::hours(1), None);
        let store = MemoryStore::with(vec![expired_a.clone(), expired_b.clone(), running.clone()]);
        let sink = RecordingSink::new();
        let queue = Arc::new(EvaluationQueue::new());
        let m = monitor(store.clone(), sink.clone(), queue.clone());

        let count = m.tick_at(start() + ChronoDuration::minutes(45)).await.unwrap();
        assert_eq!(count, 2);

        // One batch holding both expired attempts
        let batches = store.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(!batches[0].contains(&running.id));

        for a in [&expired_a, &expired_b] {
            assert_eq!(sink.events_for(Topic::User(a.examinee.id)), vec![EventKind::AttemptAutoSubmitted]);
            assert_eq!(sink.events_for(Topic::User(a.quiz.examiner_id)), vec![EventKind::AttemptAutoSubmitted]);
        }

        let token = CancellationToken::new();
        let mut queued = vec![
            queue.dequeue(&token).await.unwrap().attempt_id,
            queue.dequeue(&token).await.unwrap().attempt_id,
        ];
        queued.sort();
        let mut expected = vec![expired_a.id, expired_b.id];
        expected.sort();
        assert_eq!(queued, expected);

        // Already submitted; the next sweep finds nothing
        assert_eq!(m.tick_at(start() + ChronoDuration::minutes(46)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueued_attempt_is_already_persisted() {
        let a = attempt(quiz(30, vec![]), vec![], start(), None);
        let store = MemoryStore::with(vec![a.clone()]);
        let queue = Arc::new(EvaluationQueue::new());
        let m = monitor(store.clone(), RecordingSink::new(), queue.clone());

        m.tick_at(start() + ChronoDuration::hours(1)).await.unwrap();

        let job = queue.dequeue(&CancellationToken::new()).await.unwrap();
        assert!(store.get(job.attempt_id).unwrap().is_submitted());
    }

    #[tokio::test]
    async fn test_out_of_range_duration_does_not_stop_sweep() {
        let broken = attempt(quiz(i64::MAX / 1000, vec![]), vec![], start(), None);
        let expired = attempt(quiz(30, vec![]), vec![], start(), None);
        let store = MemoryStore::with(vec![broken.clone(), expired.clone()]);
        let queue = Arc::new(EvaluationQueue::new());
        let m = monitor(store.clone(), RecordingSink::new(), queue.clone());

        let count = m.tick_at(start() + ChronoDuration::hours(3)).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(store.get(expired.id).unwrap().end_time, Some(start() + ChronoDuration::minutes(30)));
        assert!(store.get(broken.id).unwrap().end_time.is_none());
        let job = queue.dequeue(&CancellationToken::new()).await.unwrap();
        assert_eq!(job.attempt_id, expired.id);
    }

    #[tokio::test]
    async fn test_submission_during_sweep_is_kept() {
        let q = question("python", 5.0, vec![]);
        let draft = solution(&q, "print('draft')");
        let a = attempt(quiz(30, vec![q.clone()]), vec![draft], start(), None);
        let store = MemoryStore::with(vec![a.clone()]);
        let sink = RecordingSink::new();
        let queue = Arc::new(EvaluationQueue::new());
        let m = monitor(store.clone(), sink.clone(), queue.clone());

        // Last-moment submission lands between the scan and the write
        let mut submitted = a.clone();
        submitted.end_time = Some(start() + ChronoDuration::minutes(30) + ChronoDuration::seconds(5));
        submitted.solutions = vec![solution(&q, "print('final')")];
        store.write_after_next_scan(submitted.clone());

        let count = m.tick_at(start() + ChronoDuration::minutes(31)).await.unwrap();

        assert_eq!(count, 0);
        assert_eq!(store.get(a.id).unwrap(), submitted);
        assert!(sink.events_for(Topic::User(a.examinee.id)).is_empty());

        let nothing_queued = tokio::time::timeout(Duration::from_millis(20), queue.dequeue(&CancellationToken::new())).await;
        assert!(nothing_queued.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let store = MemoryStore::with(Vec::new());
        let m = Arc::new(monitor(store, RecordingSink::new(), Arc::new(EvaluationQueue::new())));
        let token = CancellationToken::new();

        let handle = {
            let m = m.clone();
            let token = token.clone();
            tokio::spawn(async move { m.run(token).await })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
