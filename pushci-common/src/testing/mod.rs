//! Structured test logging.
//!
//! `init_global_test_logging()` installs a subscriber that writes every event
//! as JSONL to `target/test-logs/pushci_tests.jsonl` and a compact copy to the
//! test writer. [`TestLogger`] adds per-test phase markers on top.
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     pushci_common::testing::init_global_test_logging();
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Test execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

/// Initialize global JSONL logging for tests. Safe to call repeatedly.
///
/// `PUSHCI_TEST_LOG_FILE` overrides the output path and
/// `PUSHCI_TEST_LOG_LEVEL` the level (default `debug` for pushci targets).
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("PUSHCI_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "pushci_common={level},pushcid={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom) = std::env::var("PUSHCI_TEST_LOG_FILE") {
        if let Some(parent) = PathBuf::from(&custom).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("pushci_tests.jsonl")).ok()
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

/// Phase-tagged logger for a single test.
pub struct TestLogger {
    test_name: String,
    start: Instant,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        init_global_test_logging();
        let logger = Self {
            test_name: test_name.to_string(),
            start: Instant::now(),
        };
        logger.log(TestPhase::Setup, "TEST START");
        logger
    }

    pub fn log(&self, phase: TestPhase, message: impl AsRef<str>) {
        tracing::info!(
            target: "test",
            test = %self.test_name,
            phase = %phase,
            elapsed_ms = self.start.elapsed().as_millis() as u64,
            "{}",
            message.as_ref()
        );
    }

    pub fn pass(self) {
        self.log(TestPhase::Verify, "TEST PASS");
    }
}
