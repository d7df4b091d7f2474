//! Test-case suite definitions.
//!
//! A suite is a YAML file of natural-language inputs with optional
//! expected-intent oracles. Cases may carry a stable `id`, which the
//! tracker prefers over input text when aligning records across
//! sessions.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A suite of test cases loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSuite {
    pub cases: Vec<TestCase>,

    #[serde(default)]
    pub metadata: SuiteMetadata,
}

/// Suite-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// One test case: an input phrase and its optional oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    /// Stable identifier for cross-session alignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The natural-language input fed to the assistant.
    pub input: String,

    /// What a correct handling of the input should accomplish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_intent: Option<String>,
}

/// Errors loading a case suite.
#[derive(Debug, thiserror::Error)]
pub enum CaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CaseSuite {
    /// Loads and validates a suite from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CaseError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let suite: Self = serde_yaml::from_str(&content)?;
        suite.validate()?;
        Ok(suite)
    }

    /// Validates the suite.
    pub fn validate(&self) -> Result<(), CaseError> {
        if self.cases.is_empty() {
            return Err(CaseError::Validation(
                "Case suite must contain at least one case".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for case in &self.cases {
            if case.input.trim().is_empty() {
                return Err(CaseError::Validation(
                    "Case input must not be empty".to_string(),
                ));
            }
            if let Some(id) = &case.id
                && !ids.insert(id)
            {
                return Err(CaseError::Validation(format!("Duplicate case id: '{id}'")));
            }
        }

        Ok(())
    }
}
