//! Lock-guarded job scheduler.
//!
//! Claims the oldest eligible jobs under a distributed lease, bounded by a
//! per-instance job semaphore, and drives each claimed job through its
//! renditions (bounded by a per-job rendition semaphore) to settlement:
//! manifest assembly on success, the retry manager otherwise.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use vtrans_models::{Job, JobId, Settlement};
use vtrans_queue::QueueError;

use crate::context::TranscodeContext;
use crate::error::{WorkerError, WorkerResult};
use crate::executor::RenditionExecutor;
use crate::logging::{job_span, JobLogger};
use crate::manifest::ManifestAssembler;
use crate::metrics;
use crate::ownership::OwnedJob;
use crate::publisher::EventPublisher;
use crate::retry::FailureTracker;
use crate::retry_manager::{RetryDecision, RetryManager, RetryPolicy};

/// Candidates read from the store per page.
const CANDIDATE_PAGE_SIZE: usize = 50;

/// Outbox entries re-published per scheduling pass.
const OUTBOX_SWEEP_LIMIT: usize = 20;

/// Result of trying to claim one candidate.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Arc<OwnedJob>),
    /// Another owner holds the lease
    LockContention,
    /// The record changed between lease acquisition and the claim write
    LostRace,
    /// Terminal, backing off, or gone
    NotEligible,
}

/// How processing of a claimed job ended on this instance.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Requeued { attempts: u32, delay: Duration },
    Failed,
    /// The lease passed to another owner mid-processing
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Requeued { .. } => "requeued",
            JobOutcome::Failed => "failed",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

pub struct Scheduler {
    ctx: Arc<TranscodeContext>,
    executor: Arc<RenditionExecutor>,
    manifests: ManifestAssembler,
    retries: RetryManager,
    publisher: Arc<EventPublisher>,
    job_slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<JobId>>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(ctx: Arc<TranscodeContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor: Arc::new(RenditionExecutor::new(ctx.clone())),
            manifests: ManifestAssembler::new(ctx.clone()),
            retries: RetryManager::new(RetryPolicy::from_config(&ctx.config)),
            publisher: Arc::new(EventPublisher::new(&ctx)),
            job_slots: Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            ctx,
        }
    }

    /// Replace the event publisher.
    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Arc::new(publisher);
        self
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Jobs currently processed by this instance.
    pub fn in_flight(&self) -> Vec<JobId> {
        self.in_flight
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take the lease on a candidate and claim it.
    ///
    /// Lock contention and lost races are expected outcomes, not errors.
    pub async fn try_claim(&self, candidate: &Job) -> WorkerResult<ClaimOutcome> {
        if !candidate.is_claimable(Utc::now()) {
            return Ok(ClaimOutcome::NotEligible);
        }

        let owner = self.ctx.owner_id();
        let acquired = self
            .ctx
            .locks
            .acquire(&candidate.id, owner, self.ctx.config.lease_ttl)
            .await?;
        if !acquired {
            metrics::record_lock_contention();
            return Ok(ClaimOutcome::LockContention);
        }

        let result = self.claim_leased(&candidate.id).await;
        if !matches!(result, Ok(ClaimOutcome::Claimed(_))) {
            if let Err(e) = self.ctx.locks.release(&candidate.id, owner).await {
                warn!(job_id = %candidate.id, "Failed to release lease: {}", e);
            }
        }
        result
    }

    /// Claim write for a job whose lease this instance holds.
    async fn claim_leased(&self, id: &JobId) -> WorkerResult<ClaimOutcome> {
        let now = Utc::now();
        let Some(mut job) = self.ctx.store.get(id).await? else {
            return Ok(ClaimOutcome::NotEligible);
        };
        if !job.is_claimable(now) {
            return Ok(ClaimOutcome::NotEligible);
        }

        let previous_owner = job.owner.clone();
        let reset = match job.claim(self.ctx.owner_id(), now) {
            Ok(reset) => reset,
            Err(e) => {
                debug!(job_id = %id, "Job not claimable: {}", e);
                return Ok(ClaimOutcome::NotEligible);
            }
        };

        match self.ctx.store.compare_and_swap(&job).await {
            Ok(stored) => {
                metrics::record_claim();
                if let Some(previous) = previous_owner {
                    info!(
                        job_id = %id,
                        previous_owner = %previous,
                        reset_renditions = reset,
                        "Reclaimed job after lease expiry"
                    );
                } else {
                    debug!(job_id = %id, attempts = stored.attempts, "Claimed job");
                }
                Ok(ClaimOutcome::Claimed(Arc::new(OwnedJob::new(
                    self.ctx.store.clone(),
                    self.ctx.owner_id(),
                    stored,
                ))))
            }
            Err(e) if e.is_conflict() || matches!(e, QueueError::TerminalState(_)) => {
                metrics::record_cas_conflict("claim");
                debug!(job_id = %id, "Lost claim race: {}", e);
                Ok(ClaimOutcome::LostRace)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One scheduling pass: claim candidates while job slots are free and
    /// start processing them in the background. Returns the number started.
    ///
    /// Pages through the candidates oldest first until every slot is taken
    /// or the candidates run out, so blocked older jobs cannot hide newer
    /// ones.
    pub async fn schedule_once(self: &Arc<Self>) -> WorkerResult<usize> {
        if *self.shutdown.borrow() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut started = 0;
        let mut offset = 0;

        'pages: while self.job_slots.available_permits() > 0 {
            let page = self.ctx.store.candidates(offset, CANDIDATE_PAGE_SIZE).await?;
            let last_page = page.len() < CANDIDATE_PAGE_SIZE;
            offset += page.len();

            for job in page {
                if !job.is_claimable(now) || self.is_in_flight(&job.id) {
                    continue;
                }
                let Ok(permit) = self.job_slots.clone().try_acquire_owned() else {
                    break 'pages;
                };
                match self.try_claim(&job).await {
                    Ok(ClaimOutcome::Claimed(owned)) => {
                        self.spawn_job(owned, permit);
                        started += 1;
                    }
                    Ok(other) => debug!(job_id = %job.id, outcome = ?other, "Skipped candidate"),
                    Err(e) => warn!(job_id = %job.id, "Failed to claim job: {}", e),
                }
            }

            if last_page {
                break;
            }
        }

        Ok(started)
    }

    fn is_in_flight(&self, id: &JobId) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    fn set_in_flight(&self, id: &JobId, running: bool) {
        if let Ok(mut set) = self.in_flight.lock() {
            if running {
                set.insert(id.clone());
            } else {
                set.remove(id);
            }
        }
    }

    fn spawn_job(self: &Arc<Self>, owned: Arc<OwnedJob>, permit: OwnedSemaphorePermit) {
        let id = owned.id().clone();
        self.set_in_flight(&id, true);
        let this = Arc::clone(self);
        let span = job_span(&id);

        tokio::spawn(
            async move {
                let _permit = permit;
                match this.process_claimed(owned).await {
                    Ok(outcome) => debug!(outcome = outcome.as_str(), "Job processing finished"),
                    Err(e) => error!("Job processing failed: {}", e),
                }
                this.set_in_flight(&id, false);
            }
            .instrument(span),
        );
    }

    /// Drive a claimed job to settlement, renewing its lease meanwhile.
    ///
    /// The lease is released afterwards whatever the outcome. Losing the
    /// lease is reported as [`JobOutcome::Abandoned`].
    pub async fn process_claimed(&self, owned: Arc<OwnedJob>) -> WorkerResult<JobOutcome> {
        let logger = JobLogger::new(&owned.snapshot().await, owned.owner());
        let (lost_tx, lost_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(owned.id().clone(), lost_tx);

        let result = self.drive(&owned, &logger, lost_rx).await;

        heartbeat.abort();
        if let Err(e) = self.ctx.locks.release(owned.id(), owned.owner()).await {
            logger.log_warning(&format!("Failed to release lease: {}", e));
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_lease_lost() => JobOutcome::Abandoned,
            Err(e) => {
                logger.log_error(&e.to_string());
                metrics::record_settlement("error");
                return Err(e);
            }
        };

        metrics::record_settlement(outcome.as_str());
        logger.log_settled(&outcome);
        Ok(outcome)
    }

    async fn drive(
        &self,
        owned: &Arc<OwnedJob>,
        logger: &JobLogger,
        mut lease_lost: watch::Receiver<bool>,
    ) -> WorkerResult<JobOutcome> {
        owned.mutate(|j| Ok(j.start_processing(Utc::now())?)).await?;

        let job = owned.snapshot().await;
        let pending = job.pending_renditions();
        logger.log_start(job.attempts, pending.len());

        let rendition_slots = Arc::new(Semaphore::new(self.ctx.config.max_concurrent_renditions));
        let mut tasks = JoinSet::new();
        for rendition_id in pending {
            let executor = self.executor.clone();
            let owned = owned.clone();
            let slots = rendition_slots.clone();
            tasks.spawn(
                async move {
                    let _slot = slots
                        .acquire_owned()
                        .await
                        .map_err(|e| WorkerError::internal(e.to_string()))?;
                    executor.run(&owned, &rendition_id).await
                }
                .in_current_span(),
            );
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(_))) => {}
                    Some(Ok(Err(e))) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return Err(WorkerError::internal(format!("rendition task failed: {}", e)));
                    }
                },
                // The heartbeat only ever signals loss
                _ = lease_lost.changed() => {
                    tasks.abort_all();
                    return Err(WorkerError::lease_lost(owned.id()));
                }
            }
        }

        let job = owned.snapshot().await;
        match job.settlement() {
            Some(Settlement::Succeeded) => match self.manifests.assemble(owned).await {
                Ok(job) => {
                    self.publisher.publish_outcome(&job).await;
                    Ok(JobOutcome::Completed)
                }
                Err(e) if e.is_lease_lost() => Err(e),
                Err(e) => {
                    logger.log_error(&format!("Manifest assembly failed: {}", e));
                    self.settle_failure(owned, Some(format!("manifest: {}", e))).await
                }
            },
            Some(Settlement::Failed { failed, permanent }) => {
                logger.log_progress(&format!(
                    "{} rendition(s) failed, {} permanently",
                    failed, permanent
                ));
                self.settle_failure(owned, None).await
            }
            None => Err(WorkerError::internal(format!(
                "job {} has unsettled renditions",
                job.id
            ))),
        }
    }

    async fn settle_failure(&self, owned: &OwnedJob, extra: Option<String>) -> WorkerResult<JobOutcome> {
        let (job, decision) = self.retries.settle_failure(owned, extra).await?;
        match decision {
            RetryDecision::Requeue { delay } => Ok(JobOutcome::Requeued {
                attempts: job.attempts,
                delay,
            }),
            RetryDecision::Fail { .. } => {
                self.publisher.publish_outcome(&job).await;
                Ok(JobOutcome::Failed)
            }
        }
    }

    /// Renew the lease every `lease_renew_interval` until aborted. Signals
    /// `lost` when renewal is refused or has failed for a full lease TTL.
    fn spawn_heartbeat(&self, job_id: JobId, lost: watch::Sender<bool>) -> JoinHandle<()> {
        let locks = self.ctx.locks.clone();
        let owner = self.ctx.owner_id().to_string();
        let ttl = self.ctx.config.lease_ttl;
        let every = self.ctx.config.lease_renew_interval;

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;

                let mut last_renewed = Instant::now();
                let mut failures = FailureTracker::new(3);
                loop {
                    ticker.tick().await;
                    match locks.renew(&job_id, &owner, ttl).await {
                        Ok(true) => {
                            failures.record_success();
                            last_renewed = Instant::now();
                        }
                        Ok(false) => {
                            warn!(job_id = %job_id, "Lease renewal refused");
                            lost.send_replace(true);
                            return;
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(job_id = %job_id, "Lease renewal failed: {}", e);
                            }
                            if last_renewed.elapsed() >= ttl {
                                warn!(job_id = %job_id, "Lease expired while renewals failed");
                                lost.send_replace(true);
                                return;
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        )
    }

    /// Scheduling loop: sweep the outbox and claim work every poll interval
    /// until [`Scheduler::shutdown`] is called.
    pub async fn run(self: Arc<Self>) {
        info!(
            owner = self.ctx.owner_id(),
            max_concurrent_jobs = self.ctx.config.max_concurrent_jobs,
            max_concurrent_renditions = self.ctx.config.max_concurrent_renditions,
            "Scheduler started"
        );

        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = FailureTracker::new(5);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.publisher.publish_pending(OUTBOX_SWEEP_LIMIT).await {
                warn!("Outbox sweep failed: {}", e);
            }
            match self.schedule_once().await {
                Ok(started) => {
                    failures.record_success();
                    if started > 0 {
                        debug!(started, "Scheduled jobs");
                    }
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!("Scheduling pass failed: {}", e);
                    }
                }
            }
        }

        info!("Scheduler stopped claiming jobs");
    }

    /// Stop claiming new jobs. In-flight jobs keep running.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for in-flight jobs to finish.
    ///
    /// On timeout the leases of unfinished jobs are released so another
    /// instance can pick them up without waiting for expiry. Returns whether
    /// every job finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let slots = self.ctx.config.max_concurrent_jobs as u32;
        match tokio::time::timeout(timeout, self.job_slots.acquire_many(slots)).await {
            Ok(Ok(_all)) => true,
            _ => {
                let unfinished = self.in_flight();
                warn!(unfinished = unfinished.len(), "Shutdown timeout, releasing leases");
                for id in unfinished {
                    if let Err(e) = self.ctx.locks.release(&id, self.ctx.owner_id()).await {
                        warn!(job_id = %id, "Failed to release lease: {}", e);
                    }
                }
                false
            }
        }
    }
}
