//! Status read from a result file the tool writes next to its logs.

use super::{MarkerClassifier, StatusSource};
use crate::ini::Ini;
use hvr_common::{StatusReport, StatusSourceError, TerminalStatus};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

const DEFAULT_APPEARANCE_GRACE: Duration = Duration::from_secs(300);
const DEFAULT_MAX_READ_FAILURES: u32 = 30;

/// Turns a result file's contents into a status.
pub trait SidecarParser: Send {
    fn parse(&self, content: &str) -> Result<TerminalStatus, String>;
}

/// Locates the newest file matching a glob and parses it each poll.
///
/// A missing file counts as still running until `appearance_grace` has
/// elapsed since [`reset`](StatusSource::reset). Read and parse errors are
/// treated as transient (the tool may be mid-write) until
/// `max_read_failures` consecutive polls have failed.
pub struct SidecarStatusSource {
    name: String,
    pattern: String,
    parser: Box<dyn SidecarParser>,
    appearance_grace: Duration,
    max_read_failures: u32,
    started: Option<Instant>,
    consecutive_failures: u32,
}

impl SidecarStatusSource {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        parser: Box<dyn SidecarParser>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            parser,
            appearance_grace: DEFAULT_APPEARANCE_GRACE,
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
            started: None,
            consecutive_failures: 0,
        }
    }

    #[must_use]
    pub fn appearance_grace(mut self, grace: Duration) -> Self {
        self.appearance_grace = grace;
        self
    }

    #[must_use]
    pub fn max_read_failures(mut self, max: u32) -> Self {
        self.max_read_failures = max;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Newest matching file by modification time.
    pub fn locate(&self) -> Result<Option<PathBuf>, glob::PatternError> {
        let newest = glob::glob(&self.pattern)?
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .map(|p| {
                let mtime = p
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (mtime, p)
            })
            .max_by_key(|(mtime, _)| *mtime)
            .map(|(_, p)| p);
        Ok(newest)
    }

    fn read_failure(
        &mut self,
        path: PathBuf,
        error: String,
    ) -> Result<TerminalStatus, StatusSourceError> {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.max_read_failures {
            warn!(source = %self.name, path = %path.display(), error = %error, "Result file unreadable, giving up");
            return Err(StatusSourceError::SidecarUnreadable {
                path,
                attempts: self.consecutive_failures,
                last_error: error,
            });
        }
        debug!(
            source = %self.name,
            path = %path.display(),
            attempts = self.consecutive_failures,
            error = %error,
            "Result file not readable yet"
        );
        Ok(TerminalStatus::StillRunning)
    }
}

impl StatusSource for SidecarStatusSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Result<TerminalStatus, StatusSourceError> {
        let started = *self.started.get_or_insert_with(Instant::now);

        let path = match self.locate() {
            Ok(Some(path)) => path,
            Ok(None) => {
                if started.elapsed() > self.appearance_grace {
                    warn!(source = %self.name, pattern = %self.pattern, "Result file never appeared");
                    return Err(StatusSourceError::SidecarMissing {
                        pattern: self.pattern.clone(),
                        grace_secs: self.appearance_grace.as_secs(),
                    });
                }
                return Ok(TerminalStatus::StillRunning);
            }
            Err(e) => {
                return self.read_failure(PathBuf::from(&self.pattern), e.to_string());
            }
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return self.read_failure(path, e.to_string()),
        };
        match self.parser.parse(&content) {
            Ok(status) => {
                self.consecutive_failures = 0;
                Ok(status)
            }
            Err(e) => self.read_failure(path, e),
        }
    }

    fn reset(&mut self) {
        self.started = Some(Instant::now());
        self.consecutive_failures = 0;
    }
}

// ── Log tail ─────────────────────────────────────────────────────────────

/// Classifies the last non-empty line of a log file with status markers.
#[derive(Debug, Clone, Default)]
pub struct MarkerFileParser {
    classifier: MarkerClassifier,
}

impl MarkerFileParser {
    pub fn new(classifier: MarkerClassifier) -> Self {
        Self { classifier }
    }
}

impl SidecarParser for MarkerFileParser {
    fn parse(&self, content: &str) -> Result<TerminalStatus, String> {
        Ok(content
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map_or(TerminalStatus::StillRunning, |line| {
                self.classifier.classify(line)
            }))
    }
}

// ── RunCard ──────────────────────────────────────────────────────────────

const RUNCARD_SECTION: &str = "Test Status";

/// Parser for the SMART watchdog's `RunCard.ini`.
///
/// `test_result` is `ONGOING`, `PASSED` or `FAILED`. Any `err_msg` other
/// than `No Error` or `Pass` (case-insensitive, empty allowed) is a
/// failure even while the run is still ongoing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCardParser;

impl SidecarParser for RunCardParser {
    fn parse(&self, content: &str) -> Result<TerminalStatus, String> {
        let ini = Ini::parse(content);
        let Some(section) = ini.section(RUNCARD_SECTION) else {
            return Err(format!("[{RUNCARD_SECTION}] section not found"));
        };

        let test_result = section
            .get("test_result")
            .map_or("ONGOING", String::as_str)
            .trim()
            .to_ascii_uppercase();
        let err_msg = section
            .get("err_msg")
            .map_or("No Error", String::as_str)
            .trim()
            .to_string();

        let payload = serde_json::Value::Object(
            section
                .iter()
                .map(|(k, v)| {
                    let value = match k.as_str() {
                        "cycle" | "loop" => v
                            .parse::<i64>()
                            .map_or_else(|_| serde_json::Value::from(v.as_str()), serde_json::Value::from),
                        _ => serde_json::Value::from(v.as_str()),
                    };
                    (k.clone(), value)
                })
                .collect(),
        );

        let err_ok = matches!(err_msg.to_ascii_lowercase().as_str(), "no error" | "pass" | "");
        if test_result == "FAILED" || !err_ok {
            let message = if err_ok {
                "test_result FAILED".to_string()
            } else {
                err_msg
            };
            return Ok(TerminalStatus::Failed(
                StatusReport::with_errors(1).message(message).payload(payload),
            ));
        }
        if test_result == "PASSED" {
            return Ok(TerminalStatus::Passed(
                StatusReport::with_errors(0).payload(payload),
            ));
        }
        Ok(TerminalStatus::StillRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runcard(result: &str, err_msg: &str) -> String {
        format!(
            "[Test Status]\nversion = 2.1\ncycle = 4\nloop = 1\ntest_result = {result}\nerr_msg = {err_msg}\n"
        )
    }

    #[test]
    fn runcard_statuses() {
        let p = RunCardParser;
        assert_eq!(
            p.parse(&runcard("ONGOING", "No Error")).unwrap(),
            TerminalStatus::StillRunning
        );
        match p.parse(&runcard("PASSED", "Pass")).unwrap() {
            TerminalStatus::Passed(r) => {
                assert_eq!(r.error_count, 0);
                assert_eq!(r.payload.unwrap()["cycle"], 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        match p.parse(&runcard("FAILED", "No Error")).unwrap() {
            TerminalStatus::Failed(r) => assert_eq!(r.message.as_deref(), Some("test_result FAILED")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runcard_error_message_fails_ongoing_run() {
        match RunCardParser
            .parse(&runcard("ONGOING", "SMART attribute 05 exceeded"))
            .unwrap()
        {
            TerminalStatus::Failed(r) => {
                assert_eq!(r.message.as_deref(), Some("SMART attribute 05 exceeded"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runcard_defaults_when_keys_missing() {
        assert_eq!(
            RunCardParser.parse("[Test Status]\ncycle = 1\n").unwrap(),
            TerminalStatus::StillRunning
        );
        assert!(RunCardParser.parse("[Other]\nx = 1\n").is_err());
    }

    #[test]
    fn log_tail_is_classified() {
        let parser = MarkerFileParser::default();
        assert_eq!(
            parser.parse("").unwrap(),
            TerminalStatus::StillRunning
        );
        assert_eq!(
            parser.parse("10:00 Running (0 Errors)\n").unwrap(),
            TerminalStatus::StillRunning
        );
        assert!(matches!(
            parser.parse("Running\nTests Failed (3 Errors)\n\n").unwrap(),
            TerminalStatus::Failed(r) if r.error_count == 3
        ));
    }

    #[test]
    fn missing_sidecar_is_still_running_within_grace() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/**/RunCard.ini", dir.path().display());
        let mut source = SidecarStatusSource::new("smart", pattern, Box::new(RunCardParser))
            .appearance_grace(Duration::from_secs(60));
        source.reset();
        assert_eq!(source.poll().unwrap(), TerminalStatus::StillRunning);
    }

    #[test]
    fn missing_sidecar_errors_after_grace() {
        let dir = TempDir::new().unwrap();
        let pattern = format!("{}/**/RunCard.ini", dir.path().display());
        let mut source = SidecarStatusSource::new("smart", pattern, Box::new(RunCardParser))
            .appearance_grace(Duration::from_millis(20));
        source.reset();
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            source.poll(),
            Err(StatusSourceError::SidecarMissing { .. })
        ));
    }

    #[test]
    fn newest_sidecar_wins() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("20240101000000");
        let new = dir.path().join("20240102000000");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::create_dir_all(&new).unwrap();
        std::fs::write(old.join("RunCard.ini"), runcard("FAILED", "old failure")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(new.join("RunCard.ini"), runcard("PASSED", "Pass")).unwrap();

        let pattern = format!("{}/**/RunCard.ini", dir.path().display());
        let mut source = SidecarStatusSource::new("smart", pattern, Box::new(RunCardParser));
        assert_eq!(source.locate().unwrap(), Some(new.join("RunCard.ini")));
        assert!(matches!(source.poll().unwrap(), TerminalStatus::Passed(_)));
    }

    #[test]
    fn transient_parse_failures_are_tolerated_then_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("RunCard.ini");
        std::fs::write(&path, "[Partial").unwrap();

        let pattern = format!("{}/RunCard.ini", dir.path().display());
        let mut source = SidecarStatusSource::new("smart", pattern, Box::new(RunCardParser))
            .max_read_failures(2);
        assert_eq!(source.poll().unwrap(), TerminalStatus::StillRunning);
        assert_eq!(source.poll().unwrap(), TerminalStatus::StillRunning);
        assert!(matches!(
            source.poll(),
            Err(StatusSourceError::SidecarUnreadable { attempts: 3, .. })
        ));

        source.reset();
        std::fs::write(&path, runcard("ONGOING", "No Error")).unwrap();
        assert_eq!(source.poll().unwrap(), TerminalStatus::StillRunning);
    }
}
