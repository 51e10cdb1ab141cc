use std::collections::BTreeMap;
use std::time::Instant;

/// Frame-thread observability sink.
///
/// `FacePipeline` reports per-frame progress, how long its own stages took
/// and a couple of gauges. Worker stages log through the `log` facade
/// instead, since they run off the frame thread.
pub trait PipelineLogger: Send {
    fn frame_processed(&mut self, frames: usize);

    fn stage_timing(&mut self, stage: &str, duration_ms: f64);

    /// Point-in-time reading, e.g. `tracked_faces` or `queue_drops`.
    fn gauge(&mut self, name: &str, value: f64);

    /// Called once on shutdown.
    fn summary(&self) {}
}

pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn frame_processed(&mut self, _frames: usize) {}
    fn stage_timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn gauge(&mut self, _name: &str, _value: f64) {}
}

/// Running count/sum/max of one series. Constant size however long the
/// camera runs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aggregate {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub last: f64,
}

impl Aggregate {
    fn record(&mut self, value: f64) {
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Aggregates stage timings and gauges and writes them through `log`.
///
/// Every `report_every` frames a one-line status goes out at `info`; the
/// full breakdown is written by `summary`.
pub struct LogPipelineLogger {
    report_every: usize,
    stages: BTreeMap<String, Aggregate>,
    gauges: BTreeMap<String, Aggregate>,
    started: Instant,
    frames: usize,
}

impl LogPipelineLogger {
    pub fn new(report_every: usize) -> Self {
        Self {
            report_every: report_every.max(1),
            stages: BTreeMap::new(),
            gauges: BTreeMap::new(),
            started: Instant::now(),
            frames: 0,
        }
    }

    pub fn stage(&self, stage: &str) -> Option<&Aggregate> {
        self.stages.get(stage)
    }

    pub fn gauge_of(&self, name: &str) -> Option<&Aggregate> {
        self.gauges.get(name)
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    fn fps(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }

    fn status_line(&self) -> String {
        let mut line = format!("frame {} ({:.1} fps)", self.frames, self.fps());
        for (name, gauge) in &self.gauges {
            line.push_str(&format!(", {name}={}", gauge.last));
        }
        line
    }

    /// Multi-line breakdown, or `None` before the first frame.
    pub fn report(&self) -> Option<String> {
        if self.frames == 0 {
            return None;
        }
        let mut out = vec![format!(
            "{} frames in {:.1}s ({:.1} fps)",
            self.frames,
            self.started.elapsed().as_secs_f64(),
            self.fps()
        )];
        for (stage, agg) in &self.stages {
            out.push(format!(
                "  {stage:<8} mean {:>7.2}ms  max {:>7.2}ms  n={}",
                agg.mean(),
                agg.max,
                agg.count
            ));
        }
        for (name, agg) in &self.gauges {
            out.push(format!("  {name}: mean {:.1} peak {}", agg.mean(), agg.max));
        }
        Some(out.join("\n"))
    }
}

impl Default for LogPipelineLogger {
    fn default() -> Self {
        Self::new(30)
    }
}

impl PipelineLogger for LogPipelineLogger {
    fn frame_processed(&mut self, frames: usize) {
        self.frames = frames;
        if frames % self.report_every == 0 {
            log::info!("{}", self.status_line());
        }
    }

    fn stage_timing(&mut self, stage: &str, duration_ms: f64) {
        self.stages
            .entry(stage.to_owned())
            .or_default()
            .record(duration_ms);
    }

    fn gauge(&mut self, name: &str, value: f64) {
        self.gauges.entry(name.to_owned()).or_default().record(value);
    }

    fn summary(&self) {
        if let Some(report) = self.report() {
            log::info!("pipeline summary: {report}");
        }
    }
}
