mod scenario;

use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use facegate_core::pipeline::face_pipeline::{FacePipeline, PipelineEngines};
use facegate_core::pipeline::pipeline_event::PipelineEvent;
use facegate_core::pipeline::pipeline_logger::LogPipelineLogger;
use facegate_core::shared::config::RecognitionConfig;
use facegate_core::shared::constants::{CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use facegate_core::shared::frame::Frame;

use scenario::Scenario;

/// Replays a recorded face scenario through the recognition pipeline.
#[derive(Parser)]
#[command(name = "facegate")]
struct Cli {
    /// Scenario JSON file.
    scenario: PathBuf,

    /// Recognition config JSON (defaults to the user config dir, then built-in defaults).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Delay between frames in milliseconds.
    #[arg(long, default_value = "33")]
    interval_ms: u64,

    /// How long to keep listening for results after the last frame.
    #[arg(long, default_value = "1000")]
    settle_ms: u64,

    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,

    /// Also print per-frame annotation events.
    #[arg(long)]
    annotations: bool,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    validate(&cli)?;

    let config = load_config(cli.config.as_deref())?;
    let scenario = Scenario::load(&cli.scenario)?;
    let engine = scenario.engine();
    let engines = PipelineEngines {
        detection: Box::new(engine.clone()),
        liveness: Box::new(engine.clone()),
        feature: Box::new(engine.clone()),
    };

    let (pipeline, events) = FacePipeline::new(config, engines, scenario.gallery())?;
    let mut pipeline = pipeline.with_logger(Box::new(LogPipelineLogger::default()));
    let printer = EventPrinter {
        json: cli.json,
        annotations: cli.annotations,
    };

    let (width, height) = scenario.frame_size;
    let interval = Duration::from_millis(cli.interval_ms);
    for index in 0..scenario.frames.len() {
        if scenario.ir {
            pipeline.refresh_ir_frame(Frame::blank_nv21(width, height, index));
        }
        pipeline.process_frame(Frame::blank_nv21(width, height, index))?;
        for event in events.try_iter() {
            printer.print(&event);
        }
        thread::sleep(interval);
    }

    drain_for(&events, Duration::from_millis(cli.settle_ms), &printer);
    pipeline.shutdown();
    for event in events.try_iter() {
        printer.print(&event);
    }

    let calls = engine.calls();
    log::info!(
        "Engine calls: detect {} mask {} liveness {} extract {} compare {}",
        calls.detect,
        calls.mask,
        calls.liveness,
        calls.extract,
        calls.compare
    );
    Ok(())
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if !cli.scenario.exists() {
        return Err(format!("Scenario file not found: {}", cli.scenario.display()).into());
    }
    if let Some(config) = &cli.config {
        if !config.exists() {
            return Err(format!("Config file not found: {}", config.display()).into());
        }
    }
    Ok(())
}

/// Explicit path, then `<config dir>/facegate/config.json`, then defaults.
fn load_config(explicit: Option<&Path>) -> Result<RecognitionConfig, Box<dyn std::error::Error>> {
    if let Some(path) = explicit {
        return Ok(RecognitionConfig::load(path)?);
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            log::info!("Using config {}", path.display());
            Ok(RecognitionConfig::load(&path)?)
        }
        _ => Ok(RecognitionConfig::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Prints whatever arrives within `window`.
fn drain_for(events: &Receiver<PipelineEvent>, window: Duration, printer: &EventPrinter) {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) => printer.print(&event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

struct EventPrinter {
    json: bool,
    annotations: bool,
}

impl EventPrinter {
    fn print(&self, event: &PipelineEvent) {
        if !self.annotations && matches!(event, PipelineEvent::FrameAnnotated { .. }) {
            return;
        }
        if self.json {
            println!("{}", event_json(event));
        } else {
            println!("{}", event_line(event));
        }
    }
}

fn event_line(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::PopulationChanged { present } => {
            format!("population: {}", if *present { "present" } else { "empty" })
        }
        PipelineEvent::FaceCountChanged { count, face_ids } => {
            format!("faces: {count} {face_ids:?}")
        }
        PipelineEvent::OutsideRecognitionArea { face_id } => {
            format!("face {face_id}: outside recognition area")
        }
        PipelineEvent::StableDetection {
            face_id,
            mask,
            frame,
        } => format!("face {face_id}: stable ({mask:?}) at frame {}", frame.index()),
        PipelineEvent::FrameAnnotated { frame_index, faces } => {
            let parts: Vec<_> = faces
                .iter()
                .map(|f| {
                    format!(
                        "{}={:?}/{:?}",
                        f.observation.face_id, f.entry.recognize_status, f.class
                    )
                })
                .collect();
            format!("frame {frame_index}: {}", parts.join(" "))
        }
        PipelineEvent::IdentityMatched {
            face_id,
            identity,
            similarity,
            ..
        } => format!(
            "face {face_id}: matched {} (id {}, similarity {similarity:.3})",
            identity.name, identity.id
        ),
        PipelineEvent::FeatureExtracted { face_id, feature, .. } => format!(
            "face {face_id}: feature extracted ({} bytes)",
            feature.as_bytes().len()
        ),
        PipelineEvent::Error {
            stage,
            code,
            message,
        } => format!("error in {stage}: {message} (code {code})"),
    }
}

fn event_json(event: &PipelineEvent) -> serde_json::Value {
    let kind = event.kind();
    match event {
        PipelineEvent::PopulationChanged { present } => {
            serde_json::json!({ "event": kind, "present": present })
        }
        PipelineEvent::FaceCountChanged { count, face_ids } => {
            serde_json::json!({ "event": kind, "count": count, "face_ids": face_ids })
        }
        PipelineEvent::OutsideRecognitionArea { face_id } => {
            serde_json::json!({ "event": kind, "face_id": face_id })
        }
        PipelineEvent::StableDetection {
            face_id,
            mask,
            frame,
        } => serde_json::json!({
            "event": kind,
            "face_id": face_id,
            "mask": mask,
            "frame": frame.index(),
        }),
        PipelineEvent::FrameAnnotated { frame_index, faces } => {
            serde_json::json!({ "event": kind, "frame": frame_index, "faces": faces })
        }
        PipelineEvent::IdentityMatched {
            face_id,
            identity,
            similarity,
            entry,
            ..
        } => serde_json::json!({
            "event": kind,
            "face_id": face_id,
            "identity": { "id": identity.id, "name": identity.name },
            "similarity": similarity,
            "entry": entry,
        }),
        PipelineEvent::FeatureExtracted {
            face_id,
            feature,
            entry,
            ..
        } => serde_json::json!({
            "event": kind,
            "face_id": face_id,
            "feature_len": feature.as_bytes().len(),
            "entry": entry,
        }),
        PipelineEvent::Error {
            stage,
            code,
            message,
        } => serde_json::json!({
            "event": kind,
            "stage": stage,
            "code": code,
            "message": message,
        }),
    }
}
