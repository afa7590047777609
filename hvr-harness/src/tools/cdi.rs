//! Disk-info dumper: exports a text report of every disk and its SMART
//! attributes, then exits.
//!
//! Besides the profile this module carries the report model and the SMART
//! comparisons steps use to check a drive before and after a stress run.

use super::{LaunchPlan, ToolProfile, absolute, ensure_dir, remove_stale, str_param};
use crate::process::ProcessSpec;
use crate::status::{SidecarParser, SidecarStatusSource, StatusSource};
use hvr_common::{LaunchError, ParamType, StatusReport, TerminalStatus, ToolConfig, ToolSchema};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

pub const TOOL: &str = "cdi";

/// Report file the dumper writes next to its executable.
const REPORT_NAME: &str = "DiskInfo.txt";
const DRIVE_LETTER: &str = "Drive Letter";

static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^CrystalDiskInfo (\d+\.\d+\.\d+)").expect("invalid version pattern"));
static OS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^    OS : (.*)$").expect("invalid os pattern"));
static LISTED_DISK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ \((\d+)\) (.*) : (.*) \[(.*)/\d+/.*$").expect("invalid disk-list pattern")
});
static DISK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ \((\d+)\) (.*)$").expect("invalid disk-header pattern"));
static SATA_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-F0-9]{2}) _*(\d*) _*(\d*) _*(\d*) ([A-F0-9]{12}) (.*)$")
        .expect("invalid SATA attribute pattern")
});
static NVME_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-F0-9]{2}) ([A-F0-9]{12}) (.*)$").expect("invalid NVMe attribute pattern")
});

/// Disk-info dumper run in copy-and-exit mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdiProfile;

impl CdiProfile {
    /// Text report the dumper writes for `config`.
    pub fn report_path(config: &ToolConfig) -> PathBuf {
        PathBuf::from(str_param(config, "install_path")).join(REPORT_NAME)
    }

    /// Where the parsed report is saved as JSON.
    pub fn json_path(config: &ToolConfig) -> PathBuf {
        PathBuf::from(str_param(config, "log_path")).join(format!(
            "{}{}",
            str_param(config, "log_prefix"),
            str_param(config, "json_name")
        ))
    }
}

impl ToolProfile for CdiProfile {
    fn name(&self) -> &str {
        TOOL
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(TOOL)
            .param("install_path", ParamType::Str, "./bin/CrystalDiskInfo", None, "install directory")
            .param("executable_name", ParamType::Str, "DiskInfo64.exe", None, "primary executable")
            .param("log_path", ParamType::Str, "./testlog", None, "directory for the JSON report")
            .param("log_prefix", ParamType::Str, "", None, "prefix for report file names")
            .param("json_name", ParamType::Str, "DiskInfo.json", None, "parsed report file name")
            .with_control_defaults(300, 2.0)
    }

    fn process_spec(&self, config: &ToolConfig) -> ProcessSpec {
        ProcessSpec::new(
            str_param(config, "install_path"),
            str_param(config, "executable_name"),
        )
    }

    fn prepare(&self, config: &ToolConfig) -> Result<LaunchPlan, LaunchError> {
        let log_dir = absolute(&str_param(config, "log_path"))?;
        ensure_dir(&log_dir)?;
        let report = absolute(&Self::report_path(config).to_string_lossy())?;
        let json = absolute(&Self::json_path(config).to_string_lossy())?;
        // The dumper appends to an existing report.
        remove_stale(&report)?;
        remove_stale(&json)?;

        Ok(LaunchPlan {
            args: vec!["/CopyExit".into()],
            written: vec![log_dir],
        })
    }

    fn status_source(&self, config: &ToolConfig) -> Box<dyn StatusSource> {
        let pattern = glob::Pattern::escape(&Self::report_path(config).to_string_lossy());
        let grace = config
            .get_duration_secs(hvr_common::config::TIMEOUT_SECONDS)
            .unwrap_or(Duration::from_secs(300));
        let parser = DiskReportParser::default().save_json(Self::json_path(config));
        Box::new(
            SidecarStatusSource::new("cdi-report", pattern, Box::new(parser))
                .appearance_grace(grace),
        )
    }
}

// ── Report model ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DiskInfoError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid disk report {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("drive '{0}' not found in disk report")]
    DriveNotFound(String),

    #[error("SMART {key}: {actual} != {expected}")]
    Unexpected { key: String, actual: u64, expected: u64 },

    #[error("SMART {key} changed: {before} -> {after}")]
    Changed { key: String, before: u64, after: u64 },

    #[error("SMART {key}: {after} - {before} = {delta} != {expected}")]
    Delta {
        key: String,
        before: u64,
        after: u64,
        delta: i128,
        expected: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfoReport {
    pub version: Option<String>,
    pub os: Option<String>,
    /// Controller name to the disks attached to it.
    pub controllers: BTreeMap<String, Vec<String>>,
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// 1-based position in the disk list.
    pub index: u32,
    pub model: String,
    pub size: String,
    pub physical_drive_id: String,
    /// `key : value` lines of the disk's section.
    pub attributes: BTreeMap<String, String>,
    pub smart: Vec<SmartAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartAttribute {
    pub id: String,
    pub name: String,
    pub raw: u64,
    /// Normalised columns; NVMe reports only carry the raw value.
    pub current: Option<u32>,
    pub worst: Option<u32>,
    pub threshold: Option<u32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Controllers,
    DiskList,
    Drive,
    Smart,
    /// Raw hex dumps, not kept.
    Dump,
}

impl DiskInfoReport {
    /// Parse the dumper's text report. Unrecognised lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut report = Self::default();
        let mut section = Section::Header;
        let mut controller: Option<String> = None;
        let mut current: Option<u32> = None;

        for line in text.lines().filter(|l| !l.is_empty()) {
            let line = line.trim_end_matches('\r');
            if let Some(next) = section_marker(line) {
                section = next;
                continue;
            }
            if let Some(c) = VERSION.captures(line) {
                report.version = Some(c[1].to_string());
                continue;
            }
            if let Some(c) = OS.captures(line) {
                report.os = Some(c[1].to_string());
                continue;
            }

            match section {
                Section::Controllers => {
                    if let Some(name) = line.strip_prefix(" + ") {
                        controller = Some(name.to_string());
                        report.controllers.entry(name.to_string()).or_default();
                    } else if let (Some(disk), Some(name)) =
                        (line.strip_prefix("   - "), controller.as_ref())
                    {
                        report
                            .controllers
                            .entry(name.clone())
                            .or_default()
                            .push(disk.to_string());
                    }
                    continue;
                }
                Section::DiskList => {
                    if let Some(c) = LISTED_DISK.captures(line) {
                        report.disks.push(Disk {
                            index: c[1].parse().unwrap_or_default(),
                            model: c[2].to_string(),
                            size: c[3].to_string(),
                            physical_drive_id: c[4].to_string(),
                            ..Disk::default()
                        });
                    } else if line.starts_with("-----") {
                        section = Section::Drive;
                    }
                    continue;
                }
                _ => {}
            }

            if let Some(c) = DISK_HEADER.captures(line) {
                section = Section::Drive;
                current = c[1].parse().ok();
                continue;
            }
            let Some(disk) = current.and_then(|i| report.disks.iter_mut().find(|d| d.index == i))
            else {
                continue;
            };

            match section {
                Section::Drive => {
                    let mut parts = line.splitn(2, " : ").map(str::trim);
                    if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
                        disk.attributes.insert(key.to_string(), value.to_string());
                    }
                }
                Section::Smart => {
                    if let Some(attribute) = parse_attribute(line) {
                        disk.smart.push(attribute);
                    }
                }
                _ => {}
            }
        }
        report
    }

    /// Every listed disk has its section written.
    pub fn is_complete(&self) -> bool {
        !self.disks.is_empty() && self.disks.iter().all(|d| !d.attributes.is_empty())
    }

    /// Disk mounted at `drive_letter` (e.g. `C:`).
    pub fn disk_for_drive(&self, drive_letter: &str) -> Result<&Disk, DiskInfoError> {
        let wanted = drive_letter.trim().to_ascii_uppercase();
        self.disks
            .iter()
            .find(|d| {
                d.attributes
                    .get(DRIVE_LETTER)
                    .is_some_and(|letters| letters.to_ascii_uppercase().contains(&wanted))
            })
            .ok_or_else(|| DiskInfoError::DriveNotFound(drive_letter.to_string()))
    }

    /// Raw values of the named SMART attributes. Absent attributes are left out.
    pub fn smart_values(
        &self,
        drive_letter: &str,
        names: &[&str],
    ) -> Result<BTreeMap<String, u64>, DiskInfoError> {
        let disk = self.disk_for_drive(drive_letter)?;
        Ok(names
            .iter()
            .filter_map(|name| disk.smart_value(name).map(|v| (name.to_string(), v)))
            .collect())
    }

    pub fn load_json(path: &Path) -> Result<Self, DiskInfoError> {
        let text = std::fs::read_to_string(path).map_err(|source| DiskInfoError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| DiskInfoError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_json(&self, path: &Path) -> Result<(), DiskInfoError> {
        let io_err = |source| DiskInfoError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| DiskInfoError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, text).map_err(io_err)
    }
}

impl Disk {
    pub fn smart_value(&self, name: &str) -> Option<u64> {
        self.smart.iter().find(|a| a.name == name).map(|a| a.raw)
    }
}

fn section_marker(line: &str) -> Option<Section> {
    let marker = line.strip_prefix("-- ")?;
    if marker.starts_with("Controller Map") {
        Some(Section::Controllers)
    } else if marker.starts_with("Disk List") {
        Some(Section::DiskList)
    } else if marker.starts_with("S.M.A.R.T. ") {
        Some(Section::Smart)
    } else if ["IDENTIFY_DEVICE ", "SMART_READ_DATA ", "SMART_READ_THRESHOLD "]
        .iter()
        .any(|m| marker.starts_with(m))
    {
        Some(Section::Dump)
    } else {
        None
    }
}

fn parse_attribute(line: &str) -> Option<SmartAttribute> {
    if let Some(c) = SATA_ATTRIBUTE.captures(line) {
        return Some(SmartAttribute {
            id: c[1].to_string(),
            current: c[2].parse().ok(),
            worst: c[3].parse().ok(),
            threshold: c[4].parse().ok(),
            raw: u64::from_str_radix(&c[5], 16).ok()?,
            name: c[6].trim().to_string(),
        });
    }
    let c = NVME_ATTRIBUTE.captures(line)?;
    Some(SmartAttribute {
        id: c[1].to_string(),
        current: None,
        worst: None,
        threshold: None,
        raw: u64::from_str_radix(&c[2], 16).ok()?,
        name: c[3].trim().to_string(),
    })
}

// ── SMART checks ─────────────────────────────────────────────────────────

/// Every named attribute equals `expected`. A missing attribute never does.
pub fn expect_smart_value(
    report: &DiskInfoReport,
    drive_letter: &str,
    names: &[&str],
    expected: u64,
) -> Result<(), DiskInfoError> {
    let disk = report.disk_for_drive(drive_letter)?;
    for name in names {
        match disk.smart_value(name) {
            Some(actual) if actual == expected => {
                info!(drive = drive_letter, key = *name, actual, "SMART check passed");
            }
            actual => {
                error!(drive = drive_letter, key = *name, ?actual, expected, "SMART check failed");
                return Err(DiskInfoError::Unexpected {
                    key: name.to_string(),
                    actual: actual.unwrap_or_default(),
                    expected,
                });
            }
        }
    }
    Ok(())
}

/// The named attributes are unchanged between two snapshots. Missing reads as 0.
pub fn compare_no_increase(
    before: &DiskInfoReport,
    after: &DiskInfoReport,
    drive_letter: &str,
    names: &[&str],
) -> Result<(), DiskInfoError> {
    let (old, new) = (before.disk_for_drive(drive_letter)?, after.disk_for_drive(drive_letter)?);
    for name in names {
        let b = old.smart_value(name).unwrap_or_default();
        let a = new.smart_value(name).unwrap_or_default();
        if a != b {
            error!(drive = drive_letter, key = *name, before = b, after = a, "SMART value changed");
            return Err(DiskInfoError::Changed {
                key: name.to_string(),
                before: b,
                after: a,
            });
        }
        info!(drive = drive_letter, key = *name, value = a, "SMART value unchanged");
    }
    Ok(())
}

/// The named attributes rose by exactly `expected_delta`. Missing reads as 0.
pub fn compare_increase(
    before: &DiskInfoReport,
    after: &DiskInfoReport,
    drive_letter: &str,
    expected_delta: i64,
    names: &[&str],
) -> Result<(), DiskInfoError> {
    let (old, new) = (before.disk_for_drive(drive_letter)?, after.disk_for_drive(drive_letter)?);
    for name in names {
        let b = old.smart_value(name).unwrap_or_default();
        let a = new.smart_value(name).unwrap_or_default();
        let delta = i128::from(a) - i128::from(b);
        if delta != i128::from(expected_delta) {
            error!(drive = drive_letter, key = *name, before = b, after = a, expected_delta, "SMART delta mismatch");
            return Err(DiskInfoError::Delta {
                key: name.to_string(),
                before: b,
                after: a,
                delta,
                expected: expected_delta,
            });
        }
        info!(drive = drive_letter, key = *name, before = b, after = a, "SMART delta as expected");
    }
    Ok(())
}

// ── Status ───────────────────────────────────────────────────────────────

/// Passes once every listed disk's section is in the report, optionally
/// saving the parsed report as JSON at that point.
#[derive(Debug, Clone, Default)]
pub struct DiskReportParser {
    json_out: Option<PathBuf>,
}

impl DiskReportParser {
    #[must_use]
    pub fn save_json(mut self, path: impl Into<PathBuf>) -> Self {
        self.json_out = Some(path.into());
        self
    }
}

impl SidecarParser for DiskReportParser {
    fn parse(&self, content: &str) -> Result<TerminalStatus, String> {
        let report = DiskInfoReport::parse(content);
        if !report.is_complete() {
            return Ok(TerminalStatus::StillRunning);
        }
        if let Some(path) = &self.json_out {
            report.save_json(path).map_err(|e| e.to_string())?;
            debug!(path = %path.display(), "Disk report saved");
        }
        let models: Vec<&str> = report.disks.iter().map(|d| d.model.as_str()).collect();
        Ok(TerminalStatus::Passed(
            StatusReport::with_errors(0)
                .message(format!("{} disk(s) reported", report.disks.len()))
                .payload(json!({ "version": report.version, "disks": models })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvr_common::Overrides;

    const REPORT: &str = "\
----------------------------------------------------------------------------
CrystalDiskInfo 9.2.3 (C) 2008-2024 hiyohiyo
----------------------------------------------------------------------------

    OS : Windows 11 Pro 23H2 [10.0 Build 22631] (x64)

-- Controller Map ----------------------------------------------------------
 + Standard NVM Express Controller [SCSI]
   - Samsung SSD 980 PRO 1TB

-- Disk List ---------------------------------------------------------------
 (01) Samsung SSD 980 PRO 1TB : 1000.2 GB [0/0/0, sq] - nv

----------------------------------------------------------------------------
 (01) Samsung SSD 980 PRO 1TB
----------------------------------------------------------------------------
           Model : Samsung SSD 980 PRO 1TB
   Serial Number : S5GXNF0R123456
    Drive Letter : C:
   Health Status : Good (100 %)

-- S.M.A.R.T. --------------------------------------------------------------
ID RawValues(6) Attribute Name
01 000000000000 Critical Warning
0C 00000000002A Power Cycles
0E 000000000005 Unsafe Shutdowns

-- IDENTIFY_DEVICE ---------------------------------------------------------
      0    1    2    3
000: 144D 144D 5330 4735
";

    fn with_smart(power_cycles: u64, unsafe_shutdowns: u64) -> DiskInfoReport {
        let text = REPORT
            .replace("00000000002A", &format!("{power_cycles:012X}"))
            .replace("000000000005", &format!("{unsafe_shutdowns:012X}"));
        DiskInfoReport::parse(&text)
    }

    #[test]
    fn parses_nvme_report() {
        let report = DiskInfoReport::parse(REPORT);
        assert_eq!(report.version.as_deref(), Some("9.2.3"));
        assert!(report.os.as_deref().unwrap().starts_with("Windows 11"));
        assert_eq!(
            report.controllers["Standard NVM Express Controller [SCSI]"],
            ["Samsung SSD 980 PRO 1TB"]
        );

        let disk = &report.disks[0];
        assert_eq!(disk.index, 1);
        assert_eq!(disk.size, "1000.2 GB");
        assert_eq!(disk.physical_drive_id, "0");
        assert_eq!(disk.attributes["Serial Number"], "S5GXNF0R123456");
        assert_eq!(disk.smart.len(), 3);
        assert_eq!(disk.smart_value("Power Cycles"), Some(42));
        assert_eq!(disk.smart[1].current, None);
        assert!(report.is_complete());
    }

    #[test]
    fn parses_sata_attributes() {
        let a = parse_attribute("05 100 100 _10 000000000003 Reallocated Sectors Count").unwrap();
        assert_eq!(a.id, "05");
        assert_eq!((a.current, a.worst, a.threshold), (Some(100), Some(100), Some(10)));
        assert_eq!(a.raw, 3);
        assert_eq!(a.name, "Reallocated Sectors Count");
        assert!(parse_attribute("ID Cur Wor Thr RawValues(6) Attribute Name").is_none());
    }

    #[test]
    fn listed_disk_without_section_is_incomplete() {
        let cut = REPORT
            .split("\n (01) Samsung SSD 980 PRO 1TB\n")
            .next()
            .unwrap();
        let report = DiskInfoReport::parse(cut);
        assert_eq!(report.disks.len(), 1);
        assert!(!report.is_complete());
        assert_eq!(DiskReportParser::default().parse(cut).unwrap(), TerminalStatus::StillRunning);
    }

    #[test]
    fn smart_values_by_drive() {
        let report = DiskInfoReport::parse(REPORT);
        let values = report
            .smart_values("c:", &["Power Cycles", "Unsafe Shutdowns", "Temperature"])
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["Unsafe Shutdowns"], 5);
        assert!(matches!(
            report.smart_values("D:", &["Power Cycles"]),
            Err(DiskInfoError::DriveNotFound(_))
        ));
    }

    #[test]
    fn smart_comparisons() {
        let before = with_smart(42, 5);
        let after = with_smart(55, 5);

        compare_no_increase(&before, &after, "C:", &["Unsafe Shutdowns"]).unwrap();
        let err = compare_no_increase(&before, &after, "C:", &["Power Cycles"]).unwrap_err();
        assert!(matches!(err, DiskInfoError::Changed { before: 42, after: 55, .. }));

        compare_increase(&before, &after, "C:", 13, &["Power Cycles"]).unwrap();
        let err = compare_increase(&before, &after, "C:", 1, &["Power Cycles", "Unsafe Shutdowns"])
            .unwrap_err();
        assert!(matches!(err, DiskInfoError::Delta { delta: 13, expected: 1, .. }));
        // A counter going backwards is a negative delta, not an overflow.
        let err = compare_increase(&after, &before, "C:", 0, &["Power Cycles"]).unwrap_err();
        assert!(matches!(err, DiskInfoError::Delta { delta: -13, .. }));

        expect_smart_value(&before, "C:", &["Critical Warning"], 0).unwrap();
        assert!(expect_smart_value(&before, "C:", &["Temperature"], 0).is_err());
    }

    #[test]
    fn parser_saves_json_when_complete() {
        let dir = tempfile::TempDir::new().unwrap();
        let json_path = dir.path().join("logs").join("Before_DiskInfo.json");
        let parser = DiskReportParser::default().save_json(&json_path);

        match parser.parse(REPORT).unwrap() {
            TerminalStatus::Passed(r) => {
                assert_eq!(r.error_count, 0);
                assert_eq!(r.payload.unwrap()["disks"][0], "Samsung SSD 980 PRO 1TB");
            }
            other => panic!("unexpected {other:?}"),
        }
        let saved = DiskInfoReport::load_json(&json_path).unwrap();
        assert_eq!(saved, DiskInfoReport::parse(REPORT));
    }

    #[test]
    fn rerun_ignores_previous_report() {
        let dir = tempfile::TempDir::new().unwrap();
        let install = dir.path().join("cdi");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join(REPORT_NAME), REPORT).unwrap();
        let overrides: Overrides = [
            ("install_path".to_string(), install.display().to_string().into()),
            ("log_path".to_string(), dir.path().join("logs").display().to_string().into()),
            ("log_prefix".to_string(), "After_".into()),
        ]
        .into();
        let cfg = CdiProfile.schema().validate(&overrides).unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(CdiProfile::json_path(&cfg), "{}").unwrap();

        let plan = CdiProfile.prepare(&cfg).unwrap();
        assert_eq!(plan.args, ["/CopyExit"]);
        assert!(!install.join(REPORT_NAME).exists());
        assert!(!CdiProfile::json_path(&cfg).exists());

        let mut source = CdiProfile.status_source(&cfg);
        source.reset();
        assert_eq!(source.poll().unwrap(), TerminalStatus::StillRunning);

        std::fs::write(install.join(REPORT_NAME), REPORT).unwrap();
        assert!(matches!(source.poll().unwrap(), TerminalStatus::Passed(_)));
        assert!(CdiProfile::json_path(&cfg).is_file());
    }
}
