//! Structured test logging.
//!
//! Every test event is written as JSON lines to
//! `target/test-logs/all_tests.jsonl` and, in compact form, to the test
//! writer so `cargo test -- --nocapture` shows it inline.
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     hvr_common::testing::init_global_test_logging();
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::prelude::*;

/// Test execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install the JSONL test subscriber. Safe to call from every test.
///
/// `HVR_TEST_LOG_FILE` overrides the output path and `HVR_TEST_LOG_LEVEL`
/// the filter level (default `debug`).
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("HVR_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "hvr={level},hvr_common={level},hvr_harness={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(test_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom_path) = std::env::var("HVR_TEST_LOG_FILE") {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("all_tests.jsonl")).ok()
}

fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}

/// Logs TEST START on creation and TEST PASS / TEST FAIL on drop.
pub struct TestGuard {
    test_name: String,
    started: Instant,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        init_global_test_logging();
        tracing::info!(target: "test", test = test_name, phase = %TestPhase::Setup, "TEST START");
        Self {
            test_name: test_name.to_string(),
            started: Instant::now(),
        }
    }

    pub fn log(&self, phase: TestPhase, message: &str) {
        tracing::info!(
            target: "test",
            test = %self.test_name,
            phase = %phase,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "{message}"
        );
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        if std::thread::panicking() {
            tracing::error!(target: "test", test = %self.test_name, phase = %TestPhase::Verify, elapsed_ms, "TEST FAIL");
        } else {
            tracing::info!(target: "test", test = %self.test_name, phase = %TestPhase::Verify, elapsed_ms, "TEST PASS");
        }
    }
}
