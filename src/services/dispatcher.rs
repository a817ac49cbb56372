//! src/services/dispatcher.rs
//!
//! Dispatcher: delivers creation events to an [`EventHandler`] at least
//! once, with at most `workers` invocations in flight.
//!
//! Events go through a bounded queue shared by the worker tasks. A failed
//! invocation is classified by the [`RetryPolicy`]: transient failures are
//! re-enqueued after a backoff, terminal ones and exhausted budgets end up
//! in the dead-letter list.

use crate::config::DispatcherConfig;
use crate::models::event::ObjectCreatedEvent;
use crate::services::pipeline::{Outcome, PipelineError};
use crate::services::retry::{RetryDecision, RetryPolicy};
use crate::services::traits::EventHandler;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Oldest dead letters are dropped beyond this many.
const DEAD_LETTER_CAPACITY: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,
}

#[derive(Debug, Clone)]
struct Delivery {
    event: ObjectCreatedEvent,
    /// 1 for the first delivery.
    attempt: u32,
}

/// An event that will not be retried any more.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: ObjectCreatedEvent,
    pub error_kind: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

struct Shared {
    /// Submitted events that have not reached a final outcome.
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
}

impl Shared {
    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn dead_letter(&self, delivery: Delivery, err: &PipelineError) {
        let mut letters = self.dead_letters.lock().await;
        if letters.len() == DEAD_LETTER_CAPACITY {
            letters.pop_front();
        }
        letters.push_back(DeadLetter {
            event: delivery.event,
            error_kind: err.kind().to_string(),
            error: err.to_string(),
            attempts: delivery.attempt,
            failed_at: Utc::now(),
        });
    }
}

/// Cloneable submission side of the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Delivery>,
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    /// Queue an event for processing. Waits while the queue is full.
    pub async fn submit(&self, event: ObjectCreatedEvent) -> Result<(), DispatchError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery { event, attempt: 1 };
        if self.tx.send(delivery).await.is_err() {
            self.shared.finish();
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once every submitted event succeeded, was ignored, or was
    /// dead-lettered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of the dead-letter list, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dead_letters.lock().await.iter().cloned().collect()
    }
}

/// Worker group plus its submission handle.
pub struct Dispatcher {
    handle: DispatcherHandle,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `config.workers` workers feeding `handler`.
    pub fn spawn(handler: Arc<dyn EventHandler>, config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
            dead_letters: Mutex::new(VecDeque::new()),
        });
        let handle = DispatcherHandle { tx, shared };
        let rx = Arc::new(Mutex::new(rx));
        let policy = Arc::new(config.retry);

        let workers = config.workers.max(1);
        let mut joins = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                rx: Arc::clone(&rx),
                handler: Arc::clone(&handler),
                policy: Arc::clone(&policy),
                handle: handle.clone(),
            };
            let shutdown_rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker.run(shutdown_rx)));
        }
        info!(workers, queue_capacity = config.queue_capacity, "dispatcher started");

        Self {
            handle,
            shutdown_tx,
            joins,
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Stop accepting events, let workers finish their current invocation,
    /// and wait for them. Queued deliveries and pending retries are dropped.
    pub async fn shutdown(self) {
        self.handle.shared.closed.store(true, Ordering::SeqCst);
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "dispatcher worker panicked");
            }
        }
        let abandoned = self.handle.in_flight();
        if abandoned > 0 {
            warn!(abandoned, "dispatcher stopped with undelivered events");
        }
        info!("dispatcher stopped");
    }
}

struct Worker {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    handler: Arc<dyn EventHandler>,
    policy: Arc<RetryPolicy>,
    handle: DispatcherHandle,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let next = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    _ = shutdown_rx.changed() => None,
                    delivery = rx.recv() => delivery,
                }
            };
            let Some(delivery) = next else {
                break;
            };

            let span = info_span!(
                "dispatch",
                worker = self.id,
                bucket = %delivery.event.bucket,
                key = %delivery.event.key,
                attempt = delivery.attempt,
            );
            self.deliver(delivery).instrument(span).await;
        }
        debug!(worker = self.id, "worker exiting");
    }

    async fn deliver(&self, delivery: Delivery) {
        let shared = &self.handle.shared;
        let err = match self.handler.handle(&delivery.event).await {
            Ok(Outcome::Processed(record)) => {
                debug!(status = %record.status, "delivery complete");
                shared.finish();
                return;
            }
            Ok(Outcome::Ignored(reason)) => {
                debug!(?reason, "delivery ignored");
                shared.finish();
                return;
            }
            Err(err) => err,
        };

        match self.policy.decide(&err, delivery.attempt) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    kind = err.kind(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "delivery failed, retrying"
                );
                let handle = self.handle.clone();
                let retry = Delivery {
                    event: delivery.event,
                    attempt: delivery.attempt + 1,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if handle.tx.send(retry).await.is_err() {
                        debug!("dispatcher closed before retry");
                        handle.shared.finish();
                    }
                });
            }
            RetryDecision::GiveUp => {
                error!(
                    kind = err.kind(),
                    error = %err,
                    "delivery failed permanently, dead-lettering"
                );
                shared.dead_letter(delivery, &err).await;
                shared.finish();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::record::{ImageName, ProcessingRecord};
    use crate::services::metadata_store::MetadataError;
    use crate::services::pipeline::IgnoreReason;
    use crate::services::thumbnail_engine::TransformError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Fails each key a scripted number of times with a scripted error.
    struct ScriptedHandler {
        failures: std::sync::Mutex<HashMap<String, u32>>,
        terminal: bool,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new(failures: &[(&str, u32)], terminal: bool) -> Arc<Self> {
            Arc::new(Self {
                failures: std::sync::Mutex::new(
                    failures.iter().map(|(k, n)| (k.to_string(), *n)).collect(),
                ),
                terminal,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, event: &ObjectCreatedEvent) -> Result<Outcome, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !event.is_object_created() {
                return Ok(Outcome::Ignored(IgnoreReason::NotObjectCreated));
            }
            let fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&event.key) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                return Err(if self.terminal {
                    TransformError::UnsupportedFormat.into()
                } else {
                    PipelineError::MetadataWrite {
                        image_name: event.key.clone(),
                        source: MetadataError::Sqlx(sqlx::Error::PoolTimedOut),
                    }
                });
            }
            let name = ImageName::from_key(&event.key).unwrap();
            Ok(Outcome::Processed(ProcessingRecord::succeeded(
                &name,
                &event.bucket,
                0,
                format!("thumbnails/{}", name),
                "etag".into(),
            )))
        }
    }

    fn config(max_attempts: u32) -> DispatcherConfig {
        DispatcherConfig {
            workers: 3,
            queue_capacity: 8,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(5),
                multiplier: 2.0,
                max_delay: Duration::from_millis(20),
            },
        }
    }

    #[tokio::test]
    async fn processes_all_submitted_events() {
        let handler = ScriptedHandler::new(&[], false);
        let dispatcher = Dispatcher::spawn(handler.clone(), config(3));
        let handle = dispatcher.handle();

        for i in 0..20 {
            handle
                .submit(ObjectCreatedEvent::put("uploads", format!("img-{i}.jpg"), 10))
                .await
                .unwrap();
        }
        handle.wait_idle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 20);
        assert!(handle.dead_letters().await.is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let handler = ScriptedHandler::new(&[("cat.jpg", 2)], false);
        let dispatcher = Dispatcher::spawn(handler.clone(), config(3));
        let handle = dispatcher.handle();

        handle
            .submit(ObjectCreatedEvent::put("uploads", "cat.jpg", 10))
            .await
            .unwrap();
        handle.wait_idle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(handle.dead_letters().await.is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let handler = ScriptedHandler::new(&[("cat.jpg", 10)], false);
        let dispatcher = Dispatcher::spawn(handler.clone(), config(2));
        let handle = dispatcher.handle();

        handle
            .submit(ObjectCreatedEvent::put("uploads", "cat.jpg", 10))
            .await
            .unwrap();
        handle.wait_idle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let letters = handle.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);
        assert_eq!(letters[0].error_kind, "MetadataWriteError");
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        let handler = ScriptedHandler::new(&[("broken.txt", 1)], true);
        let dispatcher = Dispatcher::spawn(handler.clone(), config(5));
        let handle = dispatcher.handle();

        handle
            .submit(ObjectCreatedEvent::put("uploads", "broken.txt", 10))
            .await
            .unwrap();
        handle.wait_idle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let letters = handle.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error_kind, "TransformError");
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let handler = ScriptedHandler::new(&[], false);
        let dispatcher = Dispatcher::spawn(handler, config(1));
        let handle = dispatcher.handle();
        dispatcher.shutdown().await;

        assert_eq!(
            handle
                .submit(ObjectCreatedEvent::put("uploads", "late.jpg", 1))
                .await,
            Err(DispatchError::Closed)
        );
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_without_work() {
        let dispatcher = Dispatcher::spawn(ScriptedHandler::new(&[], false), config(1));
        tokio::time::timeout(Duration::from_secs(1), dispatcher.handle().wait_idle())
            .await
            .unwrap();
        dispatcher.shutdown().await;
    }
}
