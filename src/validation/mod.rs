//! Structural checks for generated artifacts.

mod code;
mod rule;

use serde::{Deserialize, Serialize};

pub use code::{SAFE_STUB, finalize_code, repair_code, validate_code};
pub use rule::{REQUIRED_FIELDS, validate_rule};

/// Verdict of one validation pass. Built once and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn from_findings(issues: Vec<String>, suggestions: Vec<String>) -> Self {
        Self { is_valid: issues.is_empty(), issues, suggestions }
    }

    pub fn valid() -> Self {
        Self { is_valid: true, ..Self::default() }
    }

    /// Issues joined into one line, for logs and failure records.
    pub fn summary(&self) -> String {
        self.issues.join("; ")
    }
}
