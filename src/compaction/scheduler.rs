//! Background job scheduling.
//!
//! A single coordinator task owns every piece of scheduling state: the set
//! of in-flight job keys, jobs parked after a failure, and the worker tasks.
//! It talks to the outside world through channels only. Workers are bounded
//! by a semaphore and run the policy on blocking threads under a child
//! cancellation token, then publish their tries and report back.
//!
//! A scan with nothing in flight publishes an [`IdleReport`]. Parked jobs
//! the policy still offers are listed in it, so `compact_all` fails instead
//! of pretending the table reached a fixed point.

use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch, Semaphore},
    task::{self, JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use super::{
    policy::{Job, JobKey, JobPolicy},
    CompactionError,
};
use crate::{
    catalog::Catalog,
    log::{Log, LogMessage},
    observability::{log_debug, log_error, log_info, log_trace, log_warn},
    option::CompactorOptions,
};

/// Handle of a running compactor.
///
/// Dropping the handle cancels the background tasks without waiting; use
/// [`Compactor::close`] to wait for them.
#[derive(Debug)]
pub struct Compactor {
    shared: Option<Shared>,
}

#[derive(Debug)]
struct Shared {
    wakeup: mpsc::Sender<()>,
    idle: watch::Receiver<IdleReport>,
    /// Incremented by every `compact_all` call.
    requested: Arc<AtomicU64>,
    cancel: CancellationToken,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    ignore_block_signal: bool,
    close_grace: Duration,
}

impl Compactor {
    /// Start a compactor on the current tokio runtime.
    ///
    /// The first scan runs right away; later scans follow job completions,
    /// [`Compactor::signal_block`] and [`Compactor::compact_all`].
    pub fn open(
        policy: Arc<dyn JobPolicy>,
        catalog: Arc<dyn Catalog>,
        log: Arc<dyn Log>,
        options: &CompactorOptions,
    ) -> Self {
        let (wakeup_tx, wakeup_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (available_tx, _) = watch::channel(BTreeSet::new());
        let (idle_tx, idle_rx) = watch::channel(IdleReport::default());
        let requested = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let coordinator = Coordinator {
            policy,
            catalog,
            log,
            permits: Arc::new(Semaphore::new(options.threads)),
            available: available_tx,
            done_tx,
            done_rx,
            wakeup_rx,
            in_flight: HashSet::new(),
            parked: BTreeMap::new(),
            workers: JoinSet::new(),
            worker_keys: HashMap::new(),
            idle: idle_tx,
            requested: Arc::clone(&requested),
            cancel: cancel.clone(),
        };
        log_info!(
            "scheduler",
            "compactor_opened",
            threads = options.threads,
            page_limit = options.page_limit,
        );
        let handle = tokio::spawn(coordinator.run());

        Self {
            shared: Some(Shared {
                wakeup: wakeup_tx,
                idle: idle_rx,
                requested,
                cancel,
                coordinator: Mutex::new(Some(handle)),
                ignore_block_signal: options.ignore_block_signal,
                close_grace: options.close_grace,
            }),
        }
    }

    /// A compactor that never runs anything.
    pub fn noop() -> Self {
        Self { shared: None }
    }

    /// Nudge the compactor after new data landed; wakeups coalesce.
    pub fn signal_block(&self) {
        let Some(shared) = &self.shared else {
            return;
        };
        if shared.ignore_block_signal {
            return;
        }
        let _ = shared.wakeup.try_send(());
    }

    /// Wait until a scan started after this call finds no work left.
    ///
    /// Jobs that failed are retried once by the scan this call triggers; if
    /// the policy still offers a failed job when nothing else is running,
    /// this fails with [`CompactionError::JobFailed`]. Fails with
    /// [`CompactionError::Timeout`] once `timeout` elapses and with
    /// [`CompactionError::Closed`] when the compactor shuts down.
    pub async fn compact_all(&self, timeout: Option<Duration>) -> Result<(), CompactionError> {
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        if shared.cancel.is_cancelled() {
            return Err(CompactionError::Closed);
        }

        let ticket = shared.requested.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(mpsc::error::TrySendError::Closed(())) = shared.wakeup.try_send(()) {
            return Err(CompactionError::Closed);
        }

        let mut idle = shared.idle.clone();
        let wait = async {
            tokio::select! {
                report = idle.wait_for(|report| report.epoch >= ticket) => {
                    let report = report.map_err(|_| CompactionError::Closed)?;
                    match report.failed.first() {
                        Some((key, message)) => Err(CompactionError::JobFailed {
                            key: key.clone(),
                            message: message.clone(),
                        }),
                        None => Ok(()),
                    }
                }
                _ = shared.cancel.cancelled() => Err(CompactionError::Closed),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| CompactionError::Timeout(limit))?,
            None => wait.await,
        }
    }

    /// Cancel running jobs and wait for the background tasks, at most for
    /// the configured grace period.
    pub async fn close(&self) {
        let Some(shared) = &self.shared else {
            return;
        };
        shared.cancel.cancel();
        let handle = shared
            .coordinator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if tokio::time::timeout(shared.close_grace, handle).await.is_err() {
            log_warn!(
                "scheduler",
                "close_grace_exceeded",
                grace_ms = shared.close_grace.as_millis() as u64,
            );
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.cancel.cancel();
        }
    }
}

/// Published by every scan that leaves nothing in flight.
#[derive(Clone, Debug, Default)]
struct IdleReport {
    /// `compact_all` requests issued before the scan started.
    epoch: u64,
    /// Parked jobs the policy still offers, with their last error.
    failed: Vec<(JobKey, String)>,
}

#[derive(Debug)]
enum JobOutcome {
    Published(usize),
    /// The job was no longer available when its worker got a permit.
    Skipped,
}

struct JobDone {
    key: JobKey,
    outcome: Result<JobOutcome, CompactionError>,
}

struct Coordinator {
    policy: Arc<dyn JobPolicy>,
    catalog: Arc<dyn Catalog>,
    log: Arc<dyn Log>,
    permits: Arc<Semaphore>,
    available: watch::Sender<BTreeSet<JobKey>>,
    done_tx: mpsc::UnboundedSender<JobDone>,
    done_rx: mpsc::UnboundedReceiver<JobDone>,
    wakeup_rx: mpsc::Receiver<()>,
    in_flight: HashSet<JobKey>,
    /// Failed jobs and their errors, not retried before the next wakeup.
    parked: BTreeMap<JobKey, String>,
    workers: JoinSet<()>,
    worker_keys: HashMap<task::Id, JobKey>,
    idle: watch::Sender<IdleReport>,
    requested: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Coordinator {
    async fn run(mut self) {
        'scan: loop {
            self.scan().await;
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'scan,
                    done = self.done_rx.recv() => {
                        if let Some(done) = done {
                            self.complete(done);
                        }
                        continue 'scan;
                    }
                    wakeup = self.wakeup_rx.recv() => {
                        if wakeup.is_none() {
                            break 'scan;
                        }
                        self.parked.clear();
                        continue 'scan;
                    }
                    Some(joined) = self.workers.join_next_with_id(), if !self.workers.is_empty() => {
                        if let Some(done) = self.reap(joined) {
                            self.complete(done);
                            continue 'scan;
                        }
                    }
                }
            }
        }

        self.cancel.cancel();
        while self.workers.join_next().await.is_some() {}
        log_debug!("scheduler", "coordinator_stopped");
    }

    async fn scan(&mut self) {
        let epoch = self.requested.load(Ordering::SeqCst);
        let policy = Arc::clone(&self.policy);
        let jobs = match tokio::task::spawn_blocking(move || policy.available_jobs()).await {
            Ok(jobs) => jobs,
            Err(err) => {
                log_error!(
                    "scheduler",
                    "scan_failed",
                    error = %err,
                );
                Vec::new()
            }
        };

        self.available
            .send_replace(jobs.iter().map(|job| job.key.clone()).collect());
        let mut failed = Vec::new();
        for job in jobs {
            if let Some(message) = self.parked.get(&job.key) {
                failed.push((job.key, message.clone()));
                continue;
            }
            if !self.in_flight.contains(&job.key) {
                self.spawn(job);
            }
        }

        if self.in_flight.is_empty() {
            log_trace!(
                "scheduler",
                "compactor_idle",
                epoch,
                failed = failed.len(),
            );
            self.idle.send_modify(|report| {
                if epoch >= report.epoch {
                    *report = IdleReport { epoch, failed };
                }
            });
        }
    }

    fn spawn(&mut self, job: Job) {
        self.in_flight.insert(job.key.clone());
        let worker = Worker {
            policy: Arc::clone(&self.policy),
            catalog: Arc::clone(&self.catalog),
            log: Arc::clone(&self.log),
            permits: Arc::clone(&self.permits),
            available: self.available.subscribe(),
            done: self.done_tx.clone(),
            cancel: self.cancel.child_token(),
        };
        let key = job.key.clone();
        let handle = self.workers.spawn(worker.run(job));
        self.worker_keys.insert(handle.id(), key);
    }

    /// Account for a finished worker task. Workers report through the done
    /// channel themselves; only a task that died without reporting yields a
    /// completion here.
    fn reap(&mut self, joined: Result<(task::Id, ()), JoinError>) -> Option<JobDone> {
        let err = match joined {
            Ok((id, ())) => {
                self.worker_keys.remove(&id);
                return None;
            }
            Err(err) => err,
        };
        let key = self.worker_keys.remove(&err.id())?;
        if !self.in_flight.contains(&key) {
            return None;
        }
        let outcome = if err.is_panic() {
            let message = panic_message(err.into_panic());
            log_error!(
                "scheduler",
                "worker_panicked",
                job = %key,
                error = %message,
            );
            Err(CompactionError::JobPanicked(message))
        } else {
            Err(CompactionError::Cancelled)
        };
        Some(JobDone { key, outcome })
    }

    fn complete(&mut self, done: JobDone) {
        self.in_flight.remove(&done.key);
        if let Err(err) = done.outcome {
            if !err.is_cancelled() {
                self.parked.insert(done.key, err.to_string());
            }
        }
    }
}

struct Worker {
    policy: Arc<dyn JobPolicy>,
    catalog: Arc<dyn Catalog>,
    log: Arc<dyn Log>,
    permits: Arc<Semaphore>,
    available: watch::Receiver<BTreeSet<JobKey>>,
    done: mpsc::UnboundedSender<JobDone>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, job: Job) {
        let run_id = Ulid::new();
        let outcome = self.execute(&job, run_id).await;
        match &outcome {
            Ok(JobOutcome::Published(tries)) => log_info!(
                "scheduler",
                "job_published",
                job = %job.key,
                run_id = %run_id,
                tries = *tries,
            ),
            Ok(JobOutcome::Skipped) => log_debug!(
                "scheduler",
                "job_skipped",
                job = %job.key,
                run_id = %run_id,
            ),
            Err(err) if err.is_cancelled() => log_debug!(
                "scheduler",
                "job_cancelled",
                job = %job.key,
                run_id = %run_id,
            ),
            Err(err) => log_error!(
                "scheduler",
                "job_failed",
                job = %job.key,
                run_id = %run_id,
                error = %err,
            ),
        }
        let _ = self.done.send(JobDone {
            key: job.key,
            outcome,
        });
    }

    async fn execute(&self, job: &Job, run_id: Ulid) -> Result<JobOutcome, CompactionError> {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| CompactionError::Closed)?
            }
            _ = self.cancel.cancelled() => return Err(CompactionError::Cancelled),
        };
        if !self.available.borrow().contains(&job.key) {
            return Ok(JobOutcome::Skipped);
        }
        log_debug!(
            "scheduler",
            "job_started",
            job = %job.key,
            run_id = %run_id,
            inputs = job.inputs.len(),
        );

        let policy = Arc::clone(&self.policy);
        let cancel = self.cancel.clone();
        let blocking_job = job.clone();
        let added = match tokio::task::spawn_blocking(move || {
            policy.execute_job(&blocking_job, &cancel)
        })
        .await
        {
            Ok(result) => result?,
            Err(err) if err.is_panic() => {
                return Err(CompactionError::JobPanicked(panic_message(err.into_panic())))
            }
            Err(_) => return Err(CompactionError::Cancelled),
        };

        // nothing is published once cancelled, even if the job got to finish
        if self.cancel.is_cancelled() {
            return Err(CompactionError::Cancelled);
        }
        let tries = added.len();
        self.catalog.add_tries(&added);
        self.log
            .append_message(LogMessage::TriesAdded(added))
            .await?;
        Ok(JobOutcome::Published(tries))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Notify;

    use super::*;
    use crate::{
        catalog::{AddedTrie, TrieCatalog},
        log::InMemoryLog,
        trie::{TableName, TrieKey, TriePath},
    };

    fn job() -> Job {
        let output = TrieKey {
            level: 1,
            recency: None,
            part: Some(TriePath::from_nibbles([0])),
            block_index: 3,
        };
        Job {
            key: JobKey {
                table: TableName::new("docs"),
                output,
            },
            inputs: (0..4).map(TrieKey::l0).collect(),
            part: TriePath::from_nibbles([0]),
        }
    }

    /// Offers one job until its output is registered; execution waits for
    /// cancellation when `hold` is set.
    #[derive(Debug)]
    struct SingleJob {
        catalog: Arc<TrieCatalog>,
        hold: bool,
        started: Arc<Notify>,
    }

    impl JobPolicy for SingleJob {
        fn available_jobs(&self) -> Vec<Job> {
            let job = job();
            if self.catalog.contains(&job.key.table, &job.key.output) {
                Vec::new()
            } else {
                vec![job]
            }
        }

        fn execute_job(
            &self,
            job: &Job,
            cancel: &CancellationToken,
        ) -> Result<Vec<AddedTrie>, CompactionError> {
            self.started.notify_one();
            while self.hold && !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(vec![AddedTrie {
                table: job.key.table.clone(),
                trie_key: job.key.output.clone(),
                data_file_size: 1,
                row_count: 1,
            }])
        }
    }

    #[derive(Debug, Default)]
    struct AlwaysFails {
        attempts: AtomicUsize,
    }

    impl JobPolicy for AlwaysFails {
        fn available_jobs(&self) -> Vec<Job> {
            vec![job()]
        }

        fn execute_job(
            &self,
            _job: &Job,
            _cancel: &CancellationToken,
        ) -> Result<Vec<AddedTrie>, CompactionError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CompactionError::MissingObject("tables/docs/meta/gone.trie".into()))
        }
    }

    #[derive(Debug)]
    struct PanickingCatalog;

    impl Catalog for PanickingCatalog {
        fn add_tries(&self, _tries: &[AddedTrie]) {
            panic!("catalog unavailable");
        }
    }

    fn single_job(hold: bool) -> (Arc<SingleJob>, Arc<TrieCatalog>, Arc<InMemoryLog>) {
        let catalog = Arc::new(TrieCatalog::new());
        let policy = Arc::new(SingleJob {
            catalog: catalog.clone(),
            hold,
            started: Arc::new(Notify::new()),
        });
        (policy, catalog, Arc::new(InMemoryLog::new()))
    }

    #[tokio::test]
    async fn compact_all_reaches_a_fixed_point() {
        let (policy, catalog, log) = single_job(false);
        let compactor = Compactor::open(
            policy.clone(),
            catalog.clone(),
            log.clone(),
            &CompactorOptions::default(),
        );

        compactor
            .compact_all(Some(Duration::from_secs(10)))
            .await
            .expect("idle");
        assert!(policy.available_jobs().is_empty());
        assert_eq!(log.messages().len(), 1);

        compactor
            .compact_all(Some(Duration::from_secs(10)))
            .await
            .expect("idle");
        assert_eq!(log.messages().len(), 1);
        compactor.close().await;
    }

    #[tokio::test]
    async fn cancelled_job_registers_nothing() {
        let (policy, catalog, log) = single_job(true);
        let compactor = Compactor::open(
            policy.clone(),
            catalog.clone(),
            log.clone(),
            &CompactorOptions::default(),
        );
        policy.started.notified().await;

        compactor.close().await;
        assert!(catalog.tables().is_empty());
        assert!(log.messages().is_empty());
        assert!(matches!(
            compactor.compact_all(None).await,
            Err(CompactionError::Closed)
        ));
    }

    #[tokio::test]
    async fn compact_all_times_out_on_a_busy_compactor() {
        let (policy, catalog, log) = single_job(true);
        let compactor = Compactor::open(policy, catalog, log, &CompactorOptions::default());

        let err = compactor
            .compact_all(Some(Duration::from_millis(50)))
            .await
            .expect_err("busy");
        assert!(matches!(err, CompactionError::Timeout(_)));
        compactor.close().await;
    }

    #[tokio::test]
    async fn failed_jobs_fail_compact_all_and_wait_for_a_wakeup() {
        let policy = Arc::new(AlwaysFails::default());
        let compactor = Compactor::open(
            policy.clone(),
            Arc::new(TrieCatalog::new()),
            Arc::new(InMemoryLog::new()),
            &CompactorOptions::default(),
        );

        let err = compactor
            .compact_all(Some(Duration::from_secs(10)))
            .await
            .expect_err("job failed");
        assert!(
            matches!(&err, CompactionError::JobFailed { key, message }
                if *key == job().key && message.contains("gone.trie")),
            "{err}"
        );
        assert_eq!(policy.available_jobs().len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = policy.attempts.load(Ordering::SeqCst);
        assert!(settled >= 1);
        // parked: no retries without a wakeup
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(policy.attempts.load(Ordering::SeqCst), settled);

        let err = compactor
            .compact_all(Some(Duration::from_secs(10)))
            .await
            .expect_err("job failed again");
        assert!(matches!(err, CompactionError::JobFailed { .. }));
        assert!(policy.attempts.load(Ordering::SeqCst) > settled);
        compactor.close().await;
    }

    #[tokio::test]
    async fn panicking_publication_is_reported() {
        let (policy, _, log) = single_job(false);
        let compactor = Compactor::open(
            policy,
            Arc::new(PanickingCatalog),
            log.clone(),
            &CompactorOptions::default(),
        );

        let err = compactor
            .compact_all(Some(Duration::from_secs(10)))
            .await
            .expect_err("publication panicked");
        assert!(
            matches!(&err, CompactionError::JobFailed { message, .. }
                if message.contains("catalog unavailable")),
            "{err}"
        );
        assert!(log.messages().is_empty());
        compactor.close().await;
    }

    #[tokio::test]
    async fn noop_compactor_is_always_idle() {
        let compactor = Compactor::noop();
        compactor.signal_block();
        compactor.compact_all(None).await.expect("noop");
        compactor.close().await;
    }
}
