//! The compression service: job table, per-job pipeline task, and the
//! wiring between the encode runner and the event relay.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use bf_av::encode::{self, EncodeEvent, EncodeParams};
use bf_av::hw::Capabilities;
use bf_av::tools::ToolRegistry;
use bf_av::{bitrate, encoders, probe};
use bf_core::config::Config;
use bf_core::events::{EventPayload, EventRelay, JobState, Subscription};
use bf_core::{Error, JobId, Result};

use crate::job::{EncodePlan, EncodeRequest, Job, JobResult};

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

struct ServiceInner {
    config: Config,
    tools: Arc<ToolRegistry>,
    /// Detected once at startup; never re-probed per job.
    caps: Arc<Capabilities>,
    relay: EventRelay,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

/// The service facade over the whole compression pipeline.
///
/// Cloning is cheap; all clones share the job table and relay. Jobs are
/// fully independent of each other: the relay is the only cross-job shared
/// mutable structure.
#[derive(Clone)]
pub struct CompressionService {
    inner: Arc<ServiceInner>,
}

impl CompressionService {
    pub fn new(config: Config, tools: ToolRegistry, caps: Arc<Capabilities>) -> Self {
        let relay = EventRelay::new(&config.relay);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                tools: Arc::new(tools),
                caps,
                relay,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Validate and register a request, then run it on a spawned task.
    ///
    /// Invalid requests are rejected here with [`Error::InvalidRequest`];
    /// no job record or event channel is created for them.
    pub fn submit(&self, request: EncodeRequest) -> Result<JobId> {
        request.validate()?;

        let id = JobId::new();
        let cancel = CancellationToken::new();
        {
            let mut jobs = self.inner.jobs.write();
            jobs.insert(
                id,
                JobEntry {
                    job: Job::new(id, request),
                    cancel,
                },
            );
        }
        self.inner.relay.publish(
            id,
            EventPayload::Status {
                state: JobState::Queued,
                reason: None,
            },
        );
        tracing::info!(job_id = %id, "job submitted");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_job(inner, id).await;
        });

        Ok(id)
    }

    /// Snapshot the current job record.
    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.inner
            .jobs
            .read()
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// Subscribe to a job's event stream: bounded replay first, then live.
    pub fn subscribe(&self, id: JobId) -> Result<Subscription> {
        self.inner.relay.subscribe(id)
    }

    /// Request cancellation of a running job. A no-op for jobs already in a
    /// terminal state.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let jobs = self.inner.jobs.read();
        let entry = jobs.get(&id).ok_or_else(|| Error::not_found("job", id))?;
        if !entry.job.state.is_terminal() {
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// The capabilities the service was constructed with.
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.caps
    }
}

// ---------------------------------------------------------------------------
// Per-job pipeline
// ---------------------------------------------------------------------------

async fn run_job(inner: Arc<ServiceInner>, id: JobId) {
    if let Err(err) = drive_job(&inner, id).await {
        let reason = match &err {
            Error::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        };
        tracing::warn!(job_id = %id, error = %err, "job failed");
        fail_job(&inner, id, reason);
    }
}

async fn drive_job(inner: &Arc<ServiceInner>, id: JobId) -> Result<()> {
    let (request, cancel) = {
        let jobs = inner.jobs.read();
        let entry = jobs.get(&id).ok_or_else(|| Error::not_found("job", id))?;
        (entry.job.request.clone(), entry.cancel.clone())
    };

    // ---- Probing ----
    set_state(inner, id, JobState::Probing);
    let ffprobe = inner.tools.require("ffprobe")?.path.clone();
    let ffmpeg = inner.tools.require("ffmpeg")?.path.clone();
    let media = probe::probe_media(&ffprobe, &request.source).await?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    inner.relay.publish(
        id,
        EventPayload::Log {
            line: format!(
                "source: {} in {}, {:.1}s, {:.1} MiB",
                media.video_codec.as_deref().unwrap_or("unknown codec"),
                media.container,
                media.duration_secs,
                media.size_bytes as f64 / 1024.0 / 1024.0,
            ),
        },
    );
    with_job(inner, id, |job| job.media = Some(media.clone()));

    // ---- Planning ----
    let (trim_start, trim_end) = request.trim_bounds()?;
    let trim_end = trim_end.map(|end| end.min(media.duration_secs));
    let encode_duration = clip_duration(media.duration_secs, trim_start, trim_end)?;
    let plan = bitrate::compute(
        encode_duration,
        request.target_size_bytes,
        request.audio_bitrate_kbps,
        &inner.config.encode,
    )?;
    if let Some(warning) = &plan.warning {
        inner
            .relay
            .publish(id, EventPayload::Log { line: warning.clone() });
    }

    let selection = encoders::resolve(
        request.codec,
        request.preset,
        request.tune.as_deref(),
        &inner.caps,
        inner.config.encode.preset_rounding,
    );

    let work_dir = inner.config.paths.work_dir.clone();
    std::fs::create_dir_all(&work_dir)?;
    let output = probe::output_path(&work_dir, id, &request.audio_codec);

    let params = EncodeParams {
        input: request.source.clone(),
        output: output.clone(),
        codec: request.codec,
        preset: request.preset,
        selection: selection.clone(),
        video_kbps: plan.invocation_video_kbps(),
        maxrate_kbps: plan.maxrate_kbps,
        bufsize_kbps: plan.bufsize_kbps,
        audio_codec: request.audio_codec.clone(),
        audio_kbps: request.audio_bitrate_kbps as u64,
        duration_secs: encode_duration,
        max_width: request.max_width,
        max_height: request.max_height,
        trim_start_secs: trim_start,
        trim_end_secs: trim_end,
        source_video_codec: media.video_codec.clone(),
    };

    // Persist the plan before the process starts so pollers and late
    // subscribers can reconstruct context.
    with_job(inner, id, |job| {
        job.plan = Some(EncodePlan {
            selection,
            bitrate: plan,
            output,
            audio_codec: request.audio_codec.clone(),
            duration_secs: encode_duration,
        });
    });

    // ---- Encoding ----
    set_state(inner, id, JobState::Encoding);
    let mut last_ratio = 0.0_f64;
    let mut on_event = |event: EncodeEvent| match event {
        EncodeEvent::Log(line) => {
            inner.relay.publish(id, EventPayload::Log { line });
        }
        EncodeEvent::Progress { ratio, fps, speed } => {
            // Progress never goes backwards, whatever the parser saw.
            let ratio = ratio.max(last_ratio);
            last_ratio = ratio;
            with_job(inner, id, |job| job.progress = ratio);
            inner
                .relay
                .publish(id, EventPayload::Progress { ratio, fps, speed });
        }
    };

    let outcome = encode::run_encode(
        &ffmpeg,
        &params,
        &inner.config.encode,
        inner.caps.platform,
        &cancel,
        &mut on_event,
    )
    .await?;

    // ---- Completion ----
    tracing::info!(
        job_id = %id,
        output = %outcome.output.display(),
        bytes = outcome.output_bytes,
        "job completed"
    );
    with_job(inner, id, |job| {
        job.state = JobState::Completed;
        job.progress = 1.0;
        job.result = Some(JobResult {
            output: outcome.output.clone(),
            output_bytes: outcome.output_bytes,
            encoder: outcome.encoder.clone(),
        });
        job.updated_at = chrono::Utc::now();
    });
    inner.relay.publish(
        id,
        EventPayload::Result {
            output: outcome.output.to_string_lossy().into_owned(),
            output_bytes: outcome.output_bytes,
        },
    );

    Ok(())
}

/// Duration of the range that will actually be encoded. The bitrate budget
/// and the progress denominator are both computed over the clip, not the
/// whole source, so a trimmed job still hits its target size.
fn clip_duration(
    source_secs: f64,
    trim_start: Option<f64>,
    trim_end: Option<f64>,
) -> Result<f64> {
    let start = trim_start.unwrap_or(0.0);
    let end = trim_end.unwrap_or(source_secs);
    if source_secs > 0.0 && start >= source_secs {
        return Err(Error::InvalidRequest(format!(
            "start_time ({start}s) is beyond the source duration ({source_secs}s)"
        )));
    }
    Ok(end - start)
}

/// Apply a mutation to a job record, bumping its update timestamp.
fn with_job(inner: &ServiceInner, id: JobId, f: impl FnOnce(&mut Job)) {
    let mut jobs = inner.jobs.write();
    if let Some(entry) = jobs.get_mut(&id) {
        f(&mut entry.job);
        entry.job.updated_at = chrono::Utc::now();
    }
}

/// Move a job to a non-terminal state and publish the transition.
fn set_state(inner: &ServiceInner, id: JobId, state: JobState) {
    with_job(inner, id, |job| job.state = state);
    inner
        .relay
        .publish(id, EventPayload::Status { state, reason: None });
}

/// Move a job to Failed and publish the terminal event.
fn fail_job(inner: &ServiceInner, id: JobId, reason: String) {
    with_job(inner, id, |job| {
        job.state = JobState::Failed;
        job.failure_reason = Some(reason.clone());
    });
    inner.relay.publish(
        id,
        EventPayload::Status {
            state: JobState::Failed,
            reason: Some(reason),
        },
    );
}
