use super::StatusSource;
use hvr_common::{StatusSourceError, TerminalStatus};
use tracing::warn;

struct Member {
    source: Box<dyn StatusSource>,
    retired: Option<StatusSourceError>,
}

/// Polls several sources in order; the first decisive answer wins.
///
/// A member that errors is retired for the rest of the run. The composite
/// only fails once every member has been retired.
pub struct CompositeStatusSource {
    name: String,
    members: Vec<Member>,
}

impl CompositeStatusSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, source: Box<dyn StatusSource>) -> Self {
        self.members.push(Member {
            source,
            retired: None,
        });
        self
    }

    pub fn active_members(&self) -> usize {
        self.members.iter().filter(|m| m.retired.is_none()).count()
    }
}

impl StatusSource for CompositeStatusSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Result<TerminalStatus, StatusSourceError> {
        for member in self.members.iter_mut().filter(|m| m.retired.is_none()) {
            match member.source.poll() {
                Ok(TerminalStatus::StillRunning) => {}
                Ok(decisive) => return Ok(decisive),
                Err(e) => {
                    warn!(
                        source = %self.name,
                        member = member.source.name(),
                        error = %e,
                        "Status source member failed, retiring it"
                    );
                    member.retired = Some(e);
                }
            }
        }

        if self.active_members() == 0 {
            let reasons = self
                .members
                .iter()
                .filter_map(|m| {
                    m.retired
                        .as_ref()
                        .map(|e| format!("{}: {e}", m.source.name()))
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StatusSourceError::Exhausted(reasons));
        }
        Ok(TerminalStatus::StillRunning)
    }

    fn is_ready(&mut self) -> bool {
        self.members
            .iter_mut()
            .filter(|m| m.retired.is_none())
            .any(|m| m.source.is_ready())
    }

    fn reset(&mut self) {
        for member in &mut self.members {
            member.retired = None;
            member.source.reset();
        }
    }
}
