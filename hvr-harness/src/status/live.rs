//! Status read live from an indicator the tool keeps updated.

use super::StatusSource;
use hvr_common::{StatusReport, StatusSourceError, TerminalStatus};
use regex::Regex;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Matches the normalised "(N ERRORS)" suffix.
static ERROR_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+)ERRORS?\)").expect("invalid error-count pattern"));

const DEFAULT_MAX_UNREADABLE: u32 = 20;
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_WAIT_STEP: Duration = Duration::from_millis(10);

/// Something that exposes the tool's current status text.
pub trait StatusIndicator: Send {
    /// Attach to the indicator. Returns whether it is now connected.
    fn connect(&mut self) -> bool;

    fn is_connected(&self) -> bool;

    fn read_text(&mut self) -> io::Result<String>;
}

/// Maps status text onto a terminal status.
///
/// Text is upper-cased and stripped of whitespace before matching, so
/// `"Tests Passed (2 Errors)"` becomes `TESTSPASSED(2ERRORS)`. Running
/// markers are checked first, then failure markers, then pass markers.
/// Anything unrecognised is treated as still running.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    running: Vec<String>,
    failed: Vec<String>,
    passed: Vec<String>,
    error_count: Regex,
}

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::new(&["RUNNING", "STARTING"], &["FAILED"], &["PASSED"])
    }
}

impl MarkerClassifier {
    pub fn new(running: &[&str], failed: &[&str], passed: &[&str]) -> Self {
        Self {
            running: running.iter().map(|m| normalize(m)).collect(),
            failed: failed.iter().map(|m| normalize(m)).collect(),
            passed: passed.iter().map(|m| normalize(m)).collect(),
            error_count: ERROR_COUNT.clone(),
        }
    }

    /// Replace the error-count pattern. Group 1 must capture the count.
    pub fn with_error_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.error_count = Regex::new(pattern)?;
        Ok(self)
    }

    pub fn classify(&self, text: &str) -> TerminalStatus {
        let normalized = normalize(text);
        let contains_any = |markers: &[String]| markers.iter().any(|m| normalized.contains(m));

        if contains_any(&self.running) {
            return TerminalStatus::StillRunning;
        }
        let report = || {
            StatusReport::with_errors(self.error_count(&normalized)).message(text.trim())
        };
        if contains_any(&self.failed) {
            return TerminalStatus::Failed(report());
        }
        if contains_any(&self.passed) {
            return TerminalStatus::Passed(report());
        }
        TerminalStatus::StillRunning
    }

    fn error_count(&self, normalized: &str) -> u32 {
        self.error_count
            .captures(normalized)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Polls a [`StatusIndicator`] and classifies its text.
pub struct LiveStatusSource {
    name: String,
    indicator: Box<dyn StatusIndicator>,
    classifier: MarkerClassifier,
    max_unreadable: u32,
    consecutive_unreadable: u32,
    reconnect: bool,
}

impl LiveStatusSource {
    pub fn new(name: impl Into<String>, indicator: Box<dyn StatusIndicator>) -> Self {
        Self {
            name: name.into(),
            indicator,
            classifier: MarkerClassifier::default(),
            max_unreadable: DEFAULT_MAX_UNREADABLE,
            consecutive_unreadable: 0,
            reconnect: false,
        }
    }

    #[must_use]
    pub fn classifier(mut self, classifier: MarkerClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Consecutive unreadable polls tolerated before the source errors.
    #[must_use]
    pub fn max_unreadable(mut self, max: u32) -> Self {
        self.max_unreadable = max;
        self
    }

    fn unreadable(&mut self, reason: &str) -> Result<TerminalStatus, StatusSourceError> {
        self.consecutive_unreadable += 1;
        if self.consecutive_unreadable > self.max_unreadable {
            warn!(
                source = %self.name,
                attempts = self.consecutive_unreadable,
                reason,
                "Status indicator unreadable, giving up"
            );
            return Err(StatusSourceError::Unreadable {
                attempts: self.consecutive_unreadable,
            });
        }
        debug!(
            source = %self.name,
            attempts = self.consecutive_unreadable,
            reason,
            "Status indicator unreadable, reconnecting"
        );
        Ok(TerminalStatus::StillRunning)
    }
}

impl StatusSource for LiveStatusSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Result<TerminalStatus, StatusSourceError> {
        // The only place a poll reconnects: once, before reading.
        if self.reconnect || !self.indicator.is_connected() {
            if !self.indicator.connect() {
                return self.unreadable("not connected");
            }
            self.reconnect = false;
        }
        match self.indicator.read_text() {
            Ok(text) => {
                self.consecutive_unreadable = 0;
                let status = self.classifier.classify(&text);
                debug!(source = %self.name, text = %text.trim(), decisive = status.is_decisive(), "Status polled");
                Ok(status)
            }
            Err(e) => {
                self.reconnect = true;
                self.unreadable(&e.to_string())
            }
        }
    }

    fn is_ready(&mut self) -> bool {
        self.indicator.is_connected() || self.indicator.connect()
    }

    fn reset(&mut self) {
        self.consecutive_unreadable = 0;
        self.reconnect = false;
    }
}

// ── Indicators ───────────────────────────────────────────────────────────

/// Status text kept in a plain file the tool rewrites.
pub struct FileIndicator {
    path: PathBuf,
    connected: bool,
}

impl FileIndicator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connected: false,
        }
    }
}

impl StatusIndicator for FileIndicator {
    fn connect(&mut self) -> bool {
        self.connected = self.path.is_file();
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_text(&mut self) -> io::Result<String> {
        let result = std::fs::read_to_string(&self.path);
        if result.is_err() {
            self.connected = false;
        }
        result
    }
}

/// Status text printed by a helper program (e.g. a window-text reader).
///
/// The program must exit within the timeout; a hung helper is killed and
/// the read counts as unreadable.
pub struct CommandIndicator {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    connected: bool,
}

impl CommandIndicator {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            connected: false,
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self) -> io::Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let deadline = Instant::now().checked_add(self.timeout);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} did not exit within {:?}", self.program.display(), self.timeout),
                ));
            }
            std::thread::sleep(COMMAND_WAIT_STEP);
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }
        if status.success() {
            return Ok(stdout);
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        Err(io::Error::other(format!(
            "{} exited with {:?}: {}",
            self.program.display(),
            status.code(),
            stderr.trim()
        )))
    }
}

impl StatusIndicator for CommandIndicator {
    fn connect(&mut self) -> bool {
        self.connected = self.read_text().is_ok();
        self.connected
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_text(&mut self) -> io::Result<String> {
        let result = self.run();
        if result.is_err() {
            self.connected = false;
        }
        result
    }
}
