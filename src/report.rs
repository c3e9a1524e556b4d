use std::fmt;

use serde::Serialize;

use crate::scope::ScopePath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// An image file named by a placeholder is absent or unreadable.
    MissingResource,
    /// The rewritten unit broke a rule of the target format.
    BackendWriteFailure,
    /// The unit holds content that cannot be rewritten without loss.
    UnitStructureUnsupported,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::MissingResource => "missing resource",
            FailureKind::BackendWriteFailure => "backend write failure",
            FailureKind::UnitStructureUnsupported => "unsupported unit structure",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Failure {
    pub location: ScopePath,
    pub kind: FailureKind,
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.location, self.kind, self.reason)
    }
}

/// Outcome of one engine pass over a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReport {
    pub units_scanned: usize,
    pub units_rewritten: usize,
    pub text_substitutions_applied: usize,
    pub images_replaced: usize,
    pub failures: Vec<Failure>,
}

impl ProcessingReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &Failure> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }

    pub(crate) fn fail(&mut self, location: ScopePath, kind: FailureKind, reason: impl Into<String>) {
        let failure = Failure {
            location,
            kind,
            reason: reason.into(),
        };
        log::warn!("{failure}");
        self.failures.push(failure);
    }
}

impl fmt::Display for ProcessingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} units scanned, {} rewritten, {} substitutions, {} images, {} failures",
            self.units_scanned,
            self.units_rewritten,
            self.text_substitutions_applied,
            self.images_replaced,
            self.failures.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{ScopeKind, UnitPosition};

    #[test]
    fn serializes_counters_in_camel_case() {
        let mut report = ProcessingReport {
            units_scanned: 4,
            units_rewritten: 1,
            ..Default::default()
        };
        report.fail(
            ScopePath {
                scope: ScopeKind::Body,
                tables: vec![],
                position: UnitPosition::Paragraph { index: 2 },
            },
            FailureKind::MissingResource,
            "image file logo.png does not exist",
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["unitsScanned"], 4);
        assert_eq!(json["failures"][0]["kind"], "MissingResource");
        assert_eq!(json["failures"][0]["location"]["position"]["index"], 2);
        assert_eq!(report.failures_of(FailureKind::MissingResource).count(), 1);
        assert_eq!(
            report.failures[0].to_string(),
            "body/p[2]: missing resource (image file logo.png does not exist)"
        );
    }
}
