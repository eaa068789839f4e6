//! Error types for the revision engine

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::object::ObjectId;

/// Result type for revision engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or committing revisions
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Name collision within a directory scope
    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    /// Missing path or tree entry
    #[error("Path not found: {0}")]
    NotFound(String),

    /// Stale base revision, or the branch moved before the push
    #[error("Working copy is not up-to-date: {0}")]
    OutOfDate(String),

    /// File added without any content
    #[error("Added file without content: {0}")]
    IncompleteData(String),

    /// Presented lock token does not match the current lock
    #[error("Bad lock token for path: {0}")]
    BadLockToken(String),

    /// Filter used while writing disagrees with the filter used for reading
    #[error("Invalid writer filter for {path}: expected {expected}, actual {actual}")]
    FilterMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Declared properties disagree with rule-derived properties
    #[error("{0}")]
    PropertyMismatch(PropertyReport),

    /// Referenced LFS object is absent from the content store
    #[error("Forbidden content: LFS object {0} is not available")]
    ForbiddenContent(String),

    /// State machine misuse or broken repository invariant
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether reopening a fresh transaction against the new head may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::OutOfDate(_))
    }
}

/// Batched property validation failures.
///
/// Paths sharing the same expected/actual difference are grouped under one
/// entry so the rendered message stays readable for large commits. Past the
/// limit only a count of further paths is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyReport {
    mismatches: BTreeMap<String, BTreeSet<String>>,
    config_files: Vec<String>,
    limit: Option<usize>,
    recorded: usize,
    omitted: usize,
}

impl PropertyReport {
    pub fn new(config_files: &[&str]) -> Self {
        Self {
            config_files: config_files.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Keep details for at most `limit` paths
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Record a mismatch for `path`
    pub fn add(
        &mut self,
        path: &str,
        expected: &BTreeMap<String, String>,
        actual: &BTreeMap<String, String>,
    ) {
        if self.limit.is_some_and(|limit| self.recorded >= limit) {
            self.omitted += 1;
            return;
        }
        self.recorded += 1;
        let mut delta = String::from("Expected:\n");
        for (name, value) in expected {
            delta.push_str(&format!("  {} = \"{}\"\n", name, value));
        }
        delta.push_str("Actual:\n");
        for (name, value) in actual {
            delta.push_str(&format!("  {} = \"{}\"\n", name, value));
        }
        self.mismatches
            .entry(delta)
            .or_default()
            .insert(path.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.mismatches.is_empty() && self.omitted == 0
    }

    /// Mismatching paths left out of the report
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    /// All paths named in the report
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .mismatches
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect();
        paths.sort();
        paths
    }
}

impl fmt::Display for PropertyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (delta, paths) in &self.mismatches {
            if !first {
                writeln!(f)?;
            }
            first = false;
            writeln!(f, "Invalid svn properties on files:")?;
            for path in paths {
                writeln!(f, "  {}", path)?;
            }
            write!(f, "{}", delta)?;
        }
        if self.omitted > 0 {
            writeln!(f)?;
            writeln!(f, "... and {} more files with invalid svn properties", self.omitted)?;
        }
        writeln!(f)?;
        writeln!(f, "----------------")?;
        writeln!(
            f,
            "Subversion properties must be consistent with Git config files:"
        )?;
        for file in &self.config_files {
            writeln!(f, "  {}", file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_report_groups_identical_deltas() {
        let mut report = PropertyReport::new(&[".gitattributes"]);
        let expected = props(&[("svn:eol-style", "LF")]);
        let actual = props(&[]);
        report.add("/a.txt", &expected, &actual);
        report.add("/b.txt", &expected, &actual);

        let message = report.to_string();
        assert_eq!(message.matches("Invalid svn properties").count(), 1);
        assert!(message.contains("  /a.txt\n  /b.txt\n"));
        assert!(message.contains("svn:eol-style = \"LF\""));
        assert!(message.contains("  .gitattributes"));
        assert_eq!(report.paths(), vec!["/a.txt", "/b.txt"]);
    }

    #[test]
    fn test_report_counts_paths_past_limit() {
        let mut report = PropertyReport::new(&[".gitattributes"]).with_limit(1);
        let expected = props(&[("svn:eol-style", "LF")]);
        let actual = props(&[]);
        report.add("/a.txt", &expected, &actual);
        report.add("/b.txt", &expected, &actual);
        report.add("/c.txt", &actual, &expected);

        assert_eq!(report.paths(), vec!["/a.txt"]);
        assert_eq!(report.omitted(), 2);
        assert!(report.to_string().contains("... and 2 more files"));

        let mut hidden = PropertyReport::new(&[]).with_limit(0);
        hidden.add("/a.txt", &expected, &actual);
        assert!(!hidden.is_empty());
        assert!(hidden.paths().is_empty());
    }

    #[test]
    fn test_only_out_of_date_is_retryable() {
        assert!(Error::OutOfDate("/a".into()).is_retryable());
        assert!(!Error::NotFound("/a".into()).is_retryable());
        assert!(!Error::PropertyMismatch(PropertyReport::default()).is_retryable());
    }
}
