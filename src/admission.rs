use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::config::EvalConfig;
use crate::models::EvaluationRecord;

// Client-local "last reset" instant, stamped after a successful clear and
// read by the login admission check. Lives outside the record store; the
// record set stays the source of truth.
pub struct ResetMarker {
    path: PathBuf,
}

impl ResetMarker {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("last_reset"),
        }
    }

    // Overwrites any prior marker; only the next reset replaces it.
    pub fn stamp(&self, instant: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, instant.to_rfc3339())
            .with_context(|| format!("failed to write reset marker {}", self.path.display()))
    }

    pub fn read(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .context(format!("failed to read reset marker {}", self.path.display()))
            }
        };
        let instant = DateTime::parse_from_rfc3339(raw.trim())
            .with_context(|| format!("malformed reset marker {}", self.path.display()))?;
        Ok(Some(instant.with_timezone(&Utc)))
    }
}

// Whoever has not yet rated every other roster member is admitted. A finished
// evaluator is blocked unless an admin reset happened after their latest
// submission.
pub fn is_admitted(
    config: &EvalConfig,
    evaluator: &str,
    records: &[EvaluationRecord],
    last_reset: Option<DateTime<Utc>>,
) -> bool {
    let own: Vec<&EvaluationRecord> = records
        .iter()
        .filter(|r| r.evaluator == evaluator)
        .collect();

    if own.len() < config.targets_for(evaluator).len() {
        return true;
    }

    let latest = own.iter().map(|r| r.timestamp).max();
    match (last_reset, latest) {
        (Some(reset), Some(latest)) => reset > latest,
        _ => false,
    }
}
