//! Error classification vocabulary.
//!
//! A classification is the input to recovery strategy selection. Tier 3
//! derives one from every failed step and hands it to the recovery provider.

use serde::{Deserialize, Serialize};

/// How bad an error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Error,
    Critical,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// What kind of error it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Transient,
    Resource,
    Logic,
    Security,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "TRANSIENT"),
            ErrorCategory::Resource => write!(f, "RESOURCE"),
            ErrorCategory::Logic => write!(f, "LOGIC"),
            ErrorCategory::Security => write!(f, "SECURITY"),
            ErrorCategory::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// How much of the recovery can happen without a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recoverability {
    Automatic,
    Partial,
    Manual,
    None,
}

/// Classification of a runtime error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub severity: Severity,
    pub category: ErrorCategory,
    pub recoverability: Recoverability,
    #[serde(default)]
    pub security_risk: bool,
    #[serde(default)]
    pub data_risk: bool,
    #[serde(default)]
    pub multiple_components_affected: bool,
}

impl ErrorClassification {
    /// A classification with automatic recoverability and no risk flags.
    pub fn new(severity: Severity, category: ErrorCategory) -> Self {
        Self {
            severity,
            category,
            recoverability: Recoverability::Automatic,
            security_risk: false,
            data_risk: false,
            multiple_components_affected: false,
        }
    }

    pub fn with_recoverability(mut self, recoverability: Recoverability) -> Self {
        self.recoverability = recoverability;
        self
    }

    pub fn with_security_risk(mut self, security_risk: bool) -> Self {
        self.security_risk = security_risk;
        self
    }

    pub fn with_data_risk(mut self, data_risk: bool) -> Self {
        self.data_risk = data_risk;
        self
    }

    pub fn with_multiple_components(mut self, affected: bool) -> Self {
        self.multiple_components_affected = affected;
        self
    }

    /// Key used for strategy events and outcome statistics, e.g. `ERROR:TRANSIENT`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.severity, self.category)
    }
}
