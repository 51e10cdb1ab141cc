use thiserror::Error;

/// Engine status code meaning success.
pub const ENGINE_OK: i32 = 0;

/// A non-zero status code returned by an engine call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("engine call failed with code {code}: {}", code_text(.code))]
pub struct EngineError {
    pub code: i32,
}

impl EngineError {
    pub fn new(code: i32) -> Self {
        debug_assert_ne!(code, ENGINE_OK, "success is not an error");
        Self { code }
    }

    pub fn describe(&self) -> &'static str {
        describe_code(self.code)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

fn code_text(code: &i32) -> &'static str {
    describe_code(*code)
}

/// Human-readable text for the engine's generic status codes.
pub fn describe_code(code: i32) -> &'static str {
    match code {
        ENGINE_OK => "success",
        1 => "unknown error",
        2 => "invalid parameter",
        3 => "unsupported operation",
        4 => "out of memory",
        5 => "bad state",
        6 => "cancelled by user",
        7 => "operation expired",
        8 => "paused by user",
        9 => "buffer overflow",
        10 => "buffer underflow",
        11 => "no disk space",
        12 => "component does not exist",
        13 => "global data does not exist",
        _ => "unrecognised engine error",
    }
}
