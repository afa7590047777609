//! Minimal INI reading and writing for vendor tool files.
//!
//! Section names keep their case; keys are matched case-insensitively and
//! stored lower-cased. Comments (`;` or `#`) are dropped on rewrite.

use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ini {
    sections: Vec<(String, BTreeMap<String, String>)>,
}

impl Ini {
    /// Parse INI text. Lines outside any section are ignored.
    pub fn parse(text: &str) -> Self {
        let mut ini = Self::default();
        let mut current: Option<usize> = None;
        for line in text.lines() {
            let line = line.trim().trim_start_matches('\u{feff}');
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(ini.section_index(name.trim()));
                continue;
            }
            let Some(idx) = current else {
                continue;
            };
            let (key, value) = match line.split_once(['=', ':']) {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (line, ""),
            };
            ini.sections[idx]
                .1
                .insert(key.to_ascii_lowercase(), value.to_string());
        }
        ini
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.iter().any(|(name, _)| name == section)
    }

    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, String>> {
        self.sections
            .iter()
            .find(|(name, _)| name == section)
            .map(|(_, entries)| entries)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let idx = self.section_index(section);
        self.sections[idx]
            .1
            .insert(key.to_ascii_lowercase(), value.into());
    }

    fn section_index(&mut self, section: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|(name, _)| name == section) {
            return idx;
        }
        self.sections.push((section.to_string(), BTreeMap::new()));
        self.sections.len() - 1
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, (name, entries)) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "[{name}]");
            for (key, value) in entries {
                let _ = writeln!(out, "{key} = {value}");
            }
        }
        out
    }
}
