//! End-to-end pipeline tests using stub ffprobe/ffmpeg scripts.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bf_av::encoders::Preset;
use bf_av::hw::{Capabilities, Codec, Platform};
use bf_av::tools::ToolRegistry;
use bf_core::config::Config;
use bf_core::events::{EventPayload, JobState, ProgressEvent};
use bf_pipeline::{CompressionService, EncodeRequest};

const FFPROBE_STUB: &str = r#"#!/bin/sh
cat <<'EOF'
{
  "streams": [
    {"codec_type": "video", "codec_name": "h264"},
    {"codec_type": "audio", "codec_name": "aac", "bit_rate": "128000"}
  ],
  "format": {"format_name": "matroska,webm", "duration": "60.0", "size": "35000000"}
}
EOF
"#;

const FFMPEG_STUB_OK: &str = r#"#!/bin/sh
for last; do :; done
echo "encoder setup line" >&2
echo out_time_us=15000000
echo progress=continue
echo out_time_us=30000000
echo progress=continue
echo out_time_us=60000000
echo progress=end
printf encoded-data > "$last"
"#;

const FFMPEG_STUB_FAIL: &str = r#"#!/bin/sh
echo "Invalid data found when processing input" >&2
exit 2
"#;

const FFMPEG_STUB_HANG: &str = r#"#!/bin/sh
sleep 30
"#;

fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn service_with(dir: &Path, ffmpeg_body: &str) -> CompressionService {
    let mut config = Config::default();
    config.tools.ffprobe_path = Some(write_stub(dir, "ffprobe-stub", FFPROBE_STUB));
    config.tools.ffmpeg_path = Some(write_stub(dir, "ffmpeg-stub", ffmpeg_body));
    config.paths.work_dir = dir.join("work");
    config.encode.progress_interval_secs = 0;

    let tools = ToolRegistry::discover(&config.tools);
    CompressionService::new(config, tools, Arc::new(Capabilities::cpu(Platform::Linux)))
}

fn request(dir: &Path) -> EncodeRequest {
    let source = dir.join("source.mkv");
    std::fs::write(&source, b"fake media").unwrap();
    EncodeRequest {
        source,
        target_size_bytes: 8 * 1024 * 1024,
        codec: Codec::H264,
        audio_codec: "aac".into(),
        audio_bitrate_kbps: 128.0,
        preset: Preset::P4,
        tune: None,
        max_width: None,
        max_height: None,
        start_time: None,
        end_time: None,
    }
}

async fn drain(sub: &mut bf_core::events::Subscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = sub.next().await {
            events.push(event);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("event stream did not terminate");
    events
}

fn states(events: &[ProgressEvent]) -> Vec<JobState> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Status { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn successful_job_runs_the_full_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_OK);

    let id = service.submit(request(dir.path())).unwrap();
    let mut sub = service.subscribe(id).unwrap();
    let events = drain(&mut sub).await;

    // Gapless sequence from the subscription point (seq 0 here).
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
        assert_eq!(event.job_id, id);
    }

    assert_eq!(
        states(&events),
        vec![JobState::Queued, JobState::Probing, JobState::Encoding]
    );

    // Progress is monotonically non-decreasing.
    let ratios: Vec<f64> = events
        .iter()
        .filter_map(|e| match e.payload {
            EventPayload::Progress { ratio, .. } => Some(ratio),
            _ => None,
        })
        .collect();
    assert!(!ratios.is_empty());
    assert!(ratios.windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(*ratios.last().unwrap(), 1.0);

    // Exactly one terminal event, and it is the last one.
    let terminal: Vec<&ProgressEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert!(events.last().unwrap().is_terminal());
    match &events.last().unwrap().payload {
        EventPayload::Result { output, output_bytes } => {
            assert!(output.ends_with(&format!("{id}.mp4")));
            assert_eq!(*output_bytes, "encoded-data".len() as u64);
        }
        other => panic!("unexpected terminal payload: {other:?}"),
    }

    let job = service.get_job(id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 1.0);
    let media = job.media.expect("probe recorded");
    assert_eq!(media.duration_secs, 60.0);
    assert_eq!(media.video_codec.as_deref(), Some("h264"));
    let plan = job.plan.expect("plan persisted");
    assert_eq!(plan.selection.encoder, "libx264");
    let result = job.result.expect("result recorded");
    assert_eq!(result.encoder, "libx264");
    assert!(result.output.exists());
}

#[tokio::test]
async fn failing_encode_publishes_one_failing_status() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_FAIL);

    let id = service.submit(request(dir.path())).unwrap();
    let mut sub = service.subscribe(id).unwrap();
    let events = drain(&mut sub).await;

    let last = events.last().unwrap();
    match &last.payload {
        EventPayload::Status { state, reason } => {
            assert_eq!(*state, JobState::Failed);
            let reason = reason.as_ref().unwrap();
            assert!(reason.contains("Invalid data"), "reason: {reason}");
        }
        other => panic!("unexpected terminal payload: {other:?}"),
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let job = service.get_job(id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure_reason.is_some());
    assert!(job.result.is_none());
}

#[tokio::test]
async fn probe_failure_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_OK);
    // Overwrite the probe stub with a failing one.
    write_stub(dir.path(), "ffprobe-stub", "#!/bin/sh\nexit 1\n");

    let id = service.submit(request(dir.path())).unwrap();
    let mut sub = service.subscribe(id).unwrap();
    let events = drain(&mut sub).await;

    assert_eq!(states(&events), vec![JobState::Queued, JobState::Probing, JobState::Failed]);
    let job = service.get_job(id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure_reason.unwrap().contains("Probe"));
}

#[tokio::test]
async fn cancel_kills_the_encode() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_HANG);

    let id = service.submit(request(dir.path())).unwrap();
    let mut sub = service.subscribe(id).unwrap();

    // Wait for the job to reach Encoding, then cancel.
    let mut events = Vec::new();
    let wait_encoding = async {
        while let Some(event) = sub.next().await {
            let encoding = matches!(
                event.payload,
                EventPayload::Status { state: JobState::Encoding, .. }
            );
            events.push(event);
            if encoding {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait_encoding)
        .await
        .expect("job never reached Encoding");

    service.cancel(id).unwrap();
    events.extend(drain(&mut sub).await);

    let last = events.last().unwrap();
    match &last.payload {
        EventPayload::Status { state, reason } => {
            assert_eq!(*state, JobState::Failed);
            assert_eq!(reason.as_deref(), Some("cancelled"));
        }
        other => panic!("unexpected terminal payload: {other:?}"),
    }
    let job = service.get_job(id).unwrap();
    assert_eq!(job.failure_reason.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn late_subscriber_replays_to_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_OK);

    let id = service.submit(request(dir.path())).unwrap();

    // Wait for completion by polling, without holding a subscription.
    let wait_done = async {
        loop {
            if service.get_job(id).unwrap().state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait_done)
        .await
        .expect("job never finished");

    // A fresh subscriber still gets the whole story, ending with the
    // terminal event, and does not hang.
    let mut sub = service.subscribe(id).unwrap();
    let events = drain(&mut sub).await;
    assert!(events.len() >= 5);
    assert_eq!(events[0].seq, 0);
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn trimmed_job_budgets_over_the_clip() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_OK);

    let mut req = request(dir.path());
    req.start_time = Some("10".into());
    req.end_time = Some("0:40".into());
    let id = service.submit(req).unwrap();
    let mut sub = service.subscribe(id).unwrap();
    let events = drain(&mut sub).await;

    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::Log { line } if line.contains("trimming: start at 10")
    )));
    assert!(events.last().unwrap().is_terminal());

    // The 8 MiB budget is spread over the 30s clip, not the 60s source.
    let job = service.get_job(id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    let plan = job.plan.expect("plan persisted");
    assert_eq!(plan.duration_secs, 30.0);
    assert!((plan.bitrate.total_kbps - 2184.53).abs() < 0.01);
}

#[tokio::test]
async fn start_beyond_source_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_OK);

    let mut req = request(dir.path());
    req.start_time = Some("90".into());
    let id = service.submit(req).unwrap();
    let mut sub = service.subscribe(id).unwrap();
    let events = drain(&mut sub).await;

    let job = service.get_job(id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job
        .failure_reason
        .unwrap()
        .contains("beyond the source duration"));
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn infeasible_target_warns_but_completes() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), FFMPEG_STUB_OK);

    let mut req = request(dir.path());
    // 100 KiB over 60s: audio alone exceeds the budget.
    req.target_size_bytes = 100 * 1024;
    let id = service.submit(req).unwrap();
    let mut sub = service.subscribe(id).unwrap();
    let events = drain(&mut sub).await;

    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::Log { line } if line.contains("quality floor")
    )));
    assert!(events.last().unwrap().is_terminal());
    let job = service.get_job(id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    // The plan keeps the computed (negative) value.
    assert!(job.plan.unwrap().bitrate.video_kbps < 0.0);
}
