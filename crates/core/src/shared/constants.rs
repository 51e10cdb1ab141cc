/// Scale of the infra-red preview relative to the visible-light preview.
pub const IR_ZOOM_RATIO: f32 = 0.25;

/// Consecutive consistent observations required before a stable detection fires.
pub const STABLE_DETECTION_RUN: usize = 5;

/// Upper bound the engine accepts for simultaneously tracked faces.
pub const MAX_TRACKED_FACES: usize = 10;

pub const LIVENESS_WORKER_NAME: &str = "liveness-worker";
pub const FEATURE_WORKER_NAME: &str = "feature-worker";
pub const RETRY_SCHEDULER_NAME: &str = "retry-scheduler";

pub const CONFIG_DIR_NAME: &str = "facegate";
pub const CONFIG_FILE_NAME: &str = "config.json";
