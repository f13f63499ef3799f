use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use data_encoding::BASE64;
use tokio::select;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use orchestra_core::{
    ArchitectureDescriptor, CommandKind, DeviceCommand, DeviceStatus, GradientSubmission,
    JobStatus, ModelRecord, ModelStatus, RoundMetrics, RoundRecord, TrainingJobRecord,
    get_architecture,
};
use orchestra_modeling::{
    Evaluator, aggregate_deltas, apply_deltas, build_initial_container,
    cosine_decay_learning_rate, extract_weights, inject_weights, set_learning_rate,
};
use orchestra_store::{
    BlobStore, DeviceRepository, ModelMeta, ModelRepository, TrainingJobRepository,
};

use crate::heartbeat::HeartbeatMonitor;
use crate::scheduler::{SchedulerConfig, select_devices};

const MODEL_FRAMEWORK: &str = "orchestra";

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How long one round waits for gradient uploads.
    pub round_timeout: Duration,
    /// Bucket poll cadence while collecting.
    pub gradient_poll_interval: Duration,
    /// Cadence of the pending/running job pickup loop.
    pub job_poll_interval: Duration,
    /// Device-wait attempts before the job fails.
    pub device_wait_max_attempts: u32,
    /// Re-dispatches of a round whose bucket stayed empty.
    pub dispatch_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            round_timeout: Duration::from_secs(60),
            gradient_poll_interval: Duration::from_secs(2),
            job_poll_interval: Duration::from_secs(5),
            device_wait_max_attempts: 30,
            dispatch_retries: 2,
        }
    }
}

struct JobContext {
    job: TrainingJobRecord,
    model: ModelRecord,
    descriptor: &'static ArchitectureDescriptor,
    scheduler: SchedulerConfig,
}

enum RoundLoopEnd {
    Completed,
    Stopped,
    Cancelled,
    Failed(&'static str),
}

enum DeviceWait {
    Selected(Vec<Uuid>),
    Stopped,
    Cancelled,
    Exhausted,
}

/// Drives every active training job through its rounds: device selection,
/// reservation, command dispatch, gradient collection, aggregation, and
/// checkpointing. One task per job plus one pickup loop.
#[derive(Clone)]
pub struct TrainingCoordinator {
    devices: DeviceRepository,
    models: ModelRepository,
    jobs: TrainingJobRepository,
    blob: BlobStore,
    heartbeat: HeartbeatMonitor,
    evaluator: Arc<Evaluator>,
    config: CoordinatorConfig,
    active_jobs: Arc<Mutex<HashSet<Uuid>>>,
    cancel: CancellationToken,
}

impl TrainingCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        devices: DeviceRepository,
        models: ModelRepository,
        jobs: TrainingJobRepository,
        blob: BlobStore,
        heartbeat: HeartbeatMonitor,
        evaluator: Arc<Evaluator>,
        config: CoordinatorConfig,
        cancel: CancellationToken,
    ) -> Self {
        TrainingCoordinator {
            devices,
            models,
            jobs,
            blob,
            heartbeat,
            evaluator,
            config,
            active_jobs: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    /// The pickup loop: claims `pending` jobs and re-owns `running` jobs
    /// left over from a previous process. Runs until cancelled.
    pub async fn run(&self) {
        info!("training coordinator started");
        let mut tick = interval(self.config.job_poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = self.cancel.cancelled() => {
                    info!("training coordinator stopping");
                    return;
                }
                _ = tick.tick() => {}
            }
            if let Err(err) = self.schedule_pass().await {
                warn!("job pickup pass failed: {err:#}");
            }
        }
    }

    async fn schedule_pass(&self) -> Result<()> {
        for job in self.jobs.list_all(Some(JobStatus::Pending)).await? {
            if !self.claim(job.id) {
                continue;
            }
            if let Err(err) = self.jobs.set_status(job.id, JobStatus::Running).await {
                // Unclaim so a later pass can pick the job up again.
                self.active_jobs.lock().unwrap().remove(&job.id);
                return Err(err.into());
            }
            info!(job_id = %job.id, rounds = job.num_rounds, "training job starting");
            tokio::spawn(self.clone().run_job(job.id, false));
        }

        // Running jobs nobody owns: a previous process died, or an
        // operator retried a failed job.
        for job in self.jobs.list_all(Some(JobStatus::Running)).await? {
            if !self.claim(job.id) {
                continue;
            }
            info!(
                job_id = %job.id,
                resume_round = job.resume_from_round(),
                "re-owning running training job"
            );
            tokio::spawn(self.clone().run_job(job.id, true));
        }
        Ok(())
    }

    fn claim(&self, job_id: Uuid) -> bool {
        self.active_jobs.lock().unwrap().insert(job_id)
    }

    async fn run_job(self, job_id: Uuid, resuming: bool) {
        let ctx = match self.prepare_job(job_id, resuming).await {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(job_id = %job_id, "failed to prepare training job: {err:#}");
                if let Err(e) = self.jobs.set_status(job_id, JobStatus::Failed).await {
                    error!(job_id = %job_id, "could not persist failed status: {e:#}");
                }
                self.active_jobs.lock().unwrap().remove(&job_id);
                return;
            }
        };

        let mut reserved: Vec<Uuid> = Vec::new();
        let result = self.drive_rounds(&ctx, &mut reserved).await;

        // Terminal block: reserved devices are returned on every exit
        // path before anything else happens.
        self.release_devices(&mut reserved).await;

        match result {
            Ok(RoundLoopEnd::Completed) => {
                info!(job_id = %job_id, "training job completed");
            }
            Ok(RoundLoopEnd::Stopped) => {
                info!(job_id = %job_id, "training job stopped");
            }
            Ok(RoundLoopEnd::Cancelled) => {
                info!(job_id = %job_id, "shutdown observed; job resumes on next start");
            }
            Ok(RoundLoopEnd::Failed(reason)) => {
                warn!(job_id = %job_id, reason, "training job failed");
                self.mark_failed(&ctx).await;
            }
            Err(err) => {
                error!(job_id = %job_id, "training job errored: {err:#}");
                self.mark_failed(&ctx).await;
            }
        }
        self.active_jobs.lock().unwrap().remove(&job_id);
    }

    async fn prepare_job(&self, job_id: Uuid, resuming: bool) -> Result<JobContext> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} vanished before startup"))?;

        let model = match job.model_id {
            Some(model_id) => self
                .models
                .get(model_id)
                .await?
                .ok_or_else(|| anyhow!("model {model_id} referenced by job {job_id} not found"))?,
            None => {
                let model = self
                    .models
                    .create(orchestra_store::NewModel {
                        name: format!("fedavg-{}", &job.id.to_string()[..8]),
                        architecture: "mnist".to_string(),
                        parent_model_id: None,
                    })
                    .await?;
                self.jobs.set_model(job.id, model.id).await?;
                model
            }
        };
        let descriptor = get_architecture(&model.architecture)?;

        if self.blob.model_blob(model.id).await?.is_none() {
            if resuming {
                warn!(
                    model_id = %model.id,
                    "global model blob missing on resume; recreating from architecture descriptor"
                );
            }
            let initial = build_initial_container(descriptor, job.learning_rate)?;
            self.blob.set_model_blob(model.id, &initial).await?;
            self.blob
                .set_model_meta(
                    model.id,
                    &ModelMeta {
                        model_id: model.id.to_string(),
                        name: model.name.clone(),
                        version: model.version.max(0) as u32,
                        framework: MODEL_FRAMEWORK.to_string(),
                        size_bytes: initial.len(),
                    },
                )
                .await?;
        }

        self.models.set_status(model.id, ModelStatus::Training).await?;
        let scheduler = SchedulerConfig::from_job_config(job.config.as_ref());

        Ok(JobContext {
            job,
            model,
            descriptor,
            scheduler,
        })
    }

    async fn drive_rounds(
        &self,
        ctx: &JobContext,
        reserved: &mut Vec<Uuid>,
    ) -> Result<RoundLoopEnd> {
        let job = &ctx.job;
        let model_id = ctx.model.id;
        let mut metrics = job.round_metrics.clone();

        for round in job.resume_from_round()..=job.num_rounds {
            if self.cancel.is_cancelled() {
                return Ok(RoundLoopEnd::Cancelled);
            }
            if self.blob.stop_requested(job.id).await? {
                return self.finish_stopped(ctx).await;
            }

            // Checkpoint before any dispatching: a crash from here on
            // re-runs this round.
            self.jobs.checkpoint_round(job.id, round).await?;

            let selected = match self.wait_for_devices(job, &ctx.scheduler, round).await? {
                DeviceWait::Selected(devices) => devices,
                DeviceWait::Stopped => return self.finish_stopped(ctx).await,
                DeviceWait::Cancelled => return Ok(RoundLoopEnd::Cancelled),
                DeviceWait::Exhausted => return Ok(RoundLoopEnd::Failed("device wait exhausted")),
            };

            // Reserve. A device that flipped away since selection is
            // skipped; the round runs with whatever was claimed.
            for device_id in &selected {
                if self
                    .devices
                    .transition_status(*device_id, DeviceStatus::Online, DeviceStatus::Training)
                    .await?
                {
                    reserved.push(*device_id);
                } else {
                    warn!(device_id = %device_id, "device no longer online, skipping reservation");
                }
            }
            let dispatched = reserved.len();
            if dispatched == 0 {
                self.record_skipped_round(ctx, &mut metrics, round, 0, "no_submissions")
                    .await?;
                continue;
            }

            // Write the decayed learning rate into the container the
            // devices are about to download.
            let lr = cosine_decay_learning_rate(job.learning_rate, round, job.num_rounds);
            let current = self
                .blob
                .model_blob(model_id)
                .await?
                .ok_or_else(|| anyhow!("global model blob missing for model {model_id}"))?;
            let with_lr = set_learning_rate(&current, lr)?;
            self.blob.set_model_blob(model_id, &with_lr).await?;

            self.dispatch_round(ctx, round, reserved).await?;

            // Collect, re-dispatching up to dispatch_retries times if the
            // bucket stays completely empty.
            let mut submissions = match self.collect_gradients(model_id, round, dispatched).await? {
                Some(submissions) => submissions,
                None => return Ok(RoundLoopEnd::Cancelled),
            };
            let mut retries = 0;
            while submissions.is_empty() && retries < self.config.dispatch_retries {
                retries += 1;
                warn!(
                    job_id = %job.id,
                    round,
                    attempt = retries,
                    "round produced no gradients, re-dispatching"
                );
                self.blob.clear_gradients(model_id, round).await?;
                self.dispatch_round(ctx, round, reserved).await?;
                submissions = match self.collect_gradients(model_id, round, dispatched).await? {
                    Some(submissions) => submissions,
                    None => return Ok(RoundLoopEnd::Cancelled),
                };
            }
            if submissions.is_empty() {
                self.record_skipped_round(
                    ctx,
                    &mut metrics,
                    round,
                    dispatched as u32,
                    "no_submissions",
                )
                .await?;
                self.release_devices(reserved).await;
                continue;
            }

            let valid = validate_submissions(submissions);
            if valid.is_empty() {
                self.record_skipped_round(
                    ctx,
                    &mut metrics,
                    round,
                    dispatched as u32,
                    "all_submissions_invalid",
                )
                .await?;
                self.release_devices(reserved).await;
                continue;
            }

            // Aggregate and fold into the global weights.
            let deltas: Vec<(Vec<u8>, u32)> = valid
                .iter()
                .map(|v| (v.gradients.clone(), v.num_samples))
                .collect();
            let averaged = aggregate_deltas(&deltas)?;

            let current = self
                .blob
                .model_blob(model_id)
                .await?
                .ok_or_else(|| anyhow!("global model blob missing for model {model_id}"))?;
            let weights = extract_weights(&current)?;
            let updated = apply_deltas(&weights, &averaged);
            let new_blob = inject_weights(&current, &updated)?;

            self.blob.set_model_blob(model_id, &new_blob).await?;
            self.blob
                .set_model_meta(
                    model_id,
                    &ModelMeta {
                        model_id: model_id.to_string(),
                        name: ctx.model.name.clone(),
                        version: round,
                        framework: MODEL_FRAMEWORK.to_string(),
                        size_bytes: new_blob.len(),
                    },
                )
                .await?;
            self.models.set_version(model_id, round as i32).await?;

            // Evaluate server-side when a held-out set exists; otherwise
            // fall back to the device-reported averages.
            let server_eval = self
                .evaluator
                .evaluate(ctx.descriptor, &updated)
                .context("server-side evaluation failed")?;
            let device_metrics: Vec<BTreeMap<String, f64>> =
                valid.iter().map(|v| v.metrics.clone()).collect();
            let (avg_loss, avg_accuracy) = match server_eval {
                Some((loss, accuracy)) => (loss, accuracy),
                None => (
                    mean_metric(&device_metrics, "loss"),
                    mean_metric(&device_metrics, "accuracy"),
                ),
            };

            let record = RoundRecord {
                round,
                participants: valid.len() as u32,
                dispatched: dispatched as u32,
                avg_loss: round4(avg_loss),
                avg_accuracy: round4(avg_accuracy),
                skipped: false,
                reason: None,
                device_metrics,
            };
            metrics.rounds.push(record);
            self.jobs.save_round_metrics(job.id, &metrics).await?;

            let mut scalars = BTreeMap::from([
                ("round".to_string(), round as f64),
                ("avg_loss".to_string(), round4(avg_loss)),
                ("avg_accuracy".to_string(), round4(avg_accuracy)),
            ]);
            if let Some((loss, accuracy)) = server_eval {
                scalars.insert("server_loss".to_string(), round4(loss));
                scalars.insert("server_accuracy".to_string(), round4(accuracy));
            }
            self.blob.publish_latest_metrics(&scalars).await?;

            info!(
                job_id = %job.id,
                round,
                participants = valid.len(),
                dispatched,
                avg_loss = round4(avg_loss),
                avg_accuracy = round4(avg_accuracy),
                "training round completed"
            );

            self.release_devices(reserved).await;
            self.blob.clear_gradients(model_id, round).await?;
        }

        self.jobs.complete(job.id, &metrics).await?;
        self.blob.clear_stop(job.id).await?;
        self.models
            .set_status(model_id, ModelStatus::Trained)
            .await?;
        Ok(RoundLoopEnd::Completed)
    }

    /// Device wait with capped exponential backoff. The stop flag and the
    /// shutdown token are both observed between sleeps.
    async fn wait_for_devices(
        &self,
        job: &TrainingJobRecord,
        scheduler: &SchedulerConfig,
        round: u32,
    ) -> Result<DeviceWait> {
        let min_devices = job.min_devices as usize;
        for attempt in 0..self.config.device_wait_max_attempts {
            if self.cancel.is_cancelled() {
                return Ok(DeviceWait::Cancelled);
            }
            if self.blob.stop_requested(job.id).await? {
                return Ok(DeviceWait::Stopped);
            }

            let online = self.devices.list_all(Some(DeviceStatus::Online)).await?;
            let pool = online.len();
            if let Some(selected) = select_devices(&online, scheduler, min_devices) {
                if selected.len() >= min_devices {
                    return Ok(DeviceWait::Selected(
                        selected.into_iter().map(|d| d.id).collect(),
                    ));
                }
            }

            let delay = Duration::from_secs((10u64 << attempt.min(4)).min(120));
            warn!(
                job_id = %job.id,
                round,
                attempt,
                online = pool,
                required = min_devices,
                backoff_seconds = delay.as_secs(),
                "not enough eligible devices"
            );
            select! {
                _ = self.cancel.cancelled() => return Ok(DeviceWait::Cancelled),
                _ = sleep(delay) => {}
            }
        }
        Ok(DeviceWait::Exhausted)
    }

    async fn dispatch_round(
        &self,
        ctx: &JobContext,
        round: u32,
        reserved: &[Uuid],
    ) -> Result<()> {
        let total = reserved.len();
        for (index, device_id) in reserved.iter().enumerate() {
            // The (index, total) split lets a device partition its local
            // dataset deterministically, so a re-dispatched round cannot
            // double-count samples.
            let command = DeviceCommand::new(CommandKind::StartTraining)
                .with_parameter("job_id", ctx.job.id.to_string())
                .with_parameter("model_id", ctx.model.id.to_string())
                .with_parameter("round", round.to_string())
                .with_parameter("partition_index", index.to_string())
                .with_parameter("partition_total", total.to_string())
                .with_parameter("architecture", ctx.descriptor.key);
            self.heartbeat.queue_command(*device_id, &command).await?;
        }
        info!(job_id = %ctx.job.id, round, devices = total, "training round dispatched");
        Ok(())
    }

    /// Poll the bucket until it holds `expected` submissions or the round
    /// timeout passes, then return whatever was collected. `None` means
    /// shutdown was observed.
    async fn collect_gradients(
        &self,
        model_id: Uuid,
        round: u32,
        expected: usize,
    ) -> Result<Option<Vec<GradientSubmission>>> {
        let deadline = Instant::now() + self.config.round_timeout;
        loop {
            let count = self.blob.gradient_count(model_id, round).await?;
            if count >= expected {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    model_id = %model_id,
                    round,
                    received = count,
                    expected,
                    "round timed out waiting for gradients"
                );
                break;
            }
            select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = sleep(self.config.gradient_poll_interval) => {}
            }
        }
        Ok(Some(self.blob.gradient_submissions(model_id, round).await?))
    }

    async fn record_skipped_round(
        &self,
        ctx: &JobContext,
        metrics: &mut RoundMetrics,
        round: u32,
        dispatched: u32,
        reason: &str,
    ) -> Result<()> {
        warn!(job_id = %ctx.job.id, round, reason, "training round skipped");
        metrics.rounds.push(RoundRecord::skipped(round, dispatched, reason));
        self.jobs.save_round_metrics(ctx.job.id, metrics).await?;
        self.blob.clear_gradients(ctx.model.id, round).await?;
        Ok(())
    }

    async fn finish_stopped(&self, ctx: &JobContext) -> Result<RoundLoopEnd> {
        info!(job_id = %ctx.job.id, "stop flag observed");
        self.jobs.set_status(ctx.job.id, JobStatus::Stopped).await?;
        self.blob.clear_stop(ctx.job.id).await?;
        self.blob
            .clear_all_gradients(ctx.model.id, ctx.job.num_rounds)
            .await?;
        // The model blob and meta are preserved for a later job.
        Ok(RoundLoopEnd::Stopped)
    }

    /// Failure bookkeeping; the model blob is kept so a retry can resume
    /// from the checkpoint.
    async fn mark_failed(&self, ctx: &JobContext) {
        if let Err(err) = self.jobs.set_status(ctx.job.id, JobStatus::Failed).await {
            error!(job_id = %ctx.job.id, "could not persist failed status: {err:#}");
        }
        if let Err(err) = self.blob.clear_stop(ctx.job.id).await {
            warn!(job_id = %ctx.job.id, "could not clear stop flag: {err:#}");
        }
        if let Err(err) = self
            .blob
            .clear_all_gradients(ctx.model.id, ctx.job.num_rounds)
            .await
        {
            warn!(job_id = %ctx.job.id, "could not clear gradient buckets: {err:#}");
        }
    }

    /// Return every still-reserved device to `online`. Errors are logged,
    /// never propagated: this runs on terminal paths.
    async fn release_devices(&self, reserved: &mut Vec<Uuid>) {
        for device_id in reserved.drain(..) {
            match self
                .devices
                .transition_status(device_id, DeviceStatus::Training, DeviceStatus::Online)
                .await
            {
                Ok(_) => {}
                Err(err) => warn!(device_id = %device_id, "failed to release device: {err:#}"),
            }
        }
    }
}

struct ValidSubmission {
    gradients: Vec<u8>,
    num_samples: u32,
    metrics: BTreeMap<String, f64>,
}

/// Drop submissions that cannot contribute to aggregation: zero samples,
/// undecodable base64, or a payload below the 4-byte layer-count header.
fn validate_submissions(submissions: Vec<GradientSubmission>) -> Vec<ValidSubmission> {
    submissions
        .into_iter()
        .filter_map(|sub| {
            if sub.num_samples == 0 {
                warn!(device_id = %sub.device_id, "dropping submission with zero samples");
                return None;
            }
            let gradients = match BASE64.decode(sub.gradients.as_bytes()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(device_id = %sub.device_id, "dropping undecodable submission: {err}");
                    return None;
                }
            };
            if gradients.len() < 4 {
                warn!(
                    device_id = %sub.device_id,
                    size = gradients.len(),
                    "dropping submission below format minimum"
                );
                return None;
            }
            Some(ValidSubmission {
                gradients,
                num_samples: sub.num_samples,
                metrics: sub.metrics,
            })
        })
        .collect()
}

fn mean_metric(metrics: &[BTreeMap<String, f64>], key: &str) -> f64 {
    if metrics.is_empty() {
        return 0.0;
    }
    metrics.iter().filter_map(|m| m.get(key)).sum::<f64>() / metrics.len() as f64
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn submission(samples: u32, gradients: &str) -> GradientSubmission {
        GradientSubmission {
            device_id: "d".to_string(),
            gradients: gradients.to_string(),
            num_samples: samples,
            metrics: BTreeMap::new(),
        }
    }

    #[test]
    fn validation_drops_zero_samples_and_short_payloads() {
        let ok = BASE64.encode(&1u32.to_le_bytes());
        let short = BASE64.encode(&[0u8; 3]);
        let valid = validate_submissions(vec![
            submission(0, &ok),
            submission(5, &short),
            submission(5, "not base64!!"),
            submission(5, &ok),
        ]);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].num_samples, 5);
    }

    #[test]
    fn backoff_is_capped_at_two_minutes() {
        let delays: Vec<u64> = (0u32..8)
            .map(|attempt| (10u64 << attempt.min(4)).min(120))
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 120, 120, 120, 120]);
    }

    #[test]
    fn device_metric_mean_ignores_missing_keys() {
        let metrics = vec![
            BTreeMap::from([("loss".to_string(), 0.5)]),
            BTreeMap::from([("loss".to_string(), 1.5)]),
            BTreeMap::new(),
        ];
        assert_eq!(mean_metric(&metrics, "loss"), 2.0 / 3.0);
        assert_eq!(mean_metric(&[], "loss"), 0.0);
    }

    #[test]
    fn rounding_matches_four_decimals() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(1.0), 1.0);
    }
}
