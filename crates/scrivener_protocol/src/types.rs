//! Run and per-file result types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use crate::defaults::PER_FILE_ERROR_MAX_CHARS;

// ============================================================================
// Canonical Enums
// ============================================================================

/// Workflow run status - lifecycle of one workflow invocation.
/// This is the CANONICAL definition - stored as SCREAMING_SNAKE_CASE strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run created, no job has started yet
    #[default]
    Queued,
    /// At least one job of the run has been picked up
    Running,
    /// Every unit succeeded
    Completed,
    /// Some units succeeded, some failed
    CompletedWithErrors,
    /// Every unit failed
    Failed,
    /// Cancelled externally
    Cancelled,
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 4] = [
        RunStatus::Completed,
        RunStatus::CompletedWithErrors,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Final status for a run given its terminal per-unit counts.
    ///
    /// `failed == 0` wins over `completed == 0`, so an empty run completes.
    pub fn from_counts(completed: i64, failed: i64) -> Self {
        if failed == 0 {
            RunStatus::Completed
        } else if completed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::CompletedWithErrors
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(RunStatus::Queued),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(RunStatus::CompletedWithErrors),
            "FAILED" => Ok(RunStatus::Failed),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Invalid run status: '{}'", s)),
        }
    }
}

/// Status of one file inside a fan-out run.
///
/// `Pending`, `Processing` and `Retrying` are transient and may be overwritten;
/// `Completed` and `Failed` are terminal for that index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileResultStatus {
    #[default]
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl FileResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileResultStatus::Pending => "pending",
            FileResultStatus::Processing => "processing",
            FileResultStatus::Retrying => "retrying",
            FileResultStatus::Completed => "completed",
            FileResultStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileResultStatus::Completed | FileResultStatus::Failed)
    }
}

impl fmt::Display for FileResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FileResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(FileResultStatus::Pending),
            "processing" => Ok(FileResultStatus::Processing),
            "retrying" => Ok(FileResultStatus::Retrying),
            "completed" => Ok(FileResultStatus::Completed),
            "failed" => Ok(FileResultStatus::Failed),
            _ => Err(format!("Invalid file result status: '{}'", s)),
        }
    }
}

/// Output format of a workflow's generated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Text,
    Json,
    Html,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
            OutputFormat::Html => "html",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "text/markdown",
            OutputFormat::Text => "text/plain",
            OutputFormat::Json => "application/json",
            OutputFormat::Html => "text/html",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Token usage
// ============================================================================

/// Token counts reported by a provider for one or more calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), |acc, usage| acc + usage)
    }
}

impl<'a> Sum<&'a TokenUsage> for TokenUsage {
    fn sum<I: Iterator<Item = &'a TokenUsage>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

// ============================================================================
// Per-file results
// ============================================================================

/// Outcome of one file of a fan-out run, stored inside the run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerFileResult {
    pub index: u32,
    pub file_name: String,
    pub status: FileResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Display only; the queue owns the real attempt count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl PerFileResult {
    fn base(index: u32, file_name: impl Into<String>, status: FileResultStatus) -> Self {
        Self {
            index,
            file_name: file_name.into(),
            status,
            prompt: None,
            response: None,
            token_usage: None,
            output_asset_id: None,
            error_message: None,
            retry_attempt: None,
            max_retries: None,
            warnings: Vec::new(),
        }
    }

    pub fn processing(index: u32, file_name: impl Into<String>) -> Self {
        Self::base(index, file_name, FileResultStatus::Processing)
    }

    pub fn retrying(
        index: u32,
        file_name: impl Into<String>,
        error: &str,
        retry_attempt: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            error_message: Some(truncate_message(error, PER_FILE_ERROR_MAX_CHARS)),
            retry_attempt: Some(retry_attempt),
            max_retries: Some(max_retries),
            ..Self::base(index, file_name, FileResultStatus::Retrying)
        }
    }

    pub fn completed(
        index: u32,
        file_name: impl Into<String>,
        prompt: String,
        response: String,
        token_usage: TokenUsage,
        output_asset_id: String,
    ) -> Self {
        Self {
            prompt: Some(prompt),
            response: Some(response),
            token_usage: Some(token_usage),
            output_asset_id: Some(output_asset_id),
            ..Self::base(index, file_name, FileResultStatus::Completed)
        }
    }

    pub fn failed(
        index: u32,
        file_name: impl Into<String>,
        error: &str,
        attempts_made: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            error_message: Some(truncate_message(error, PER_FILE_ERROR_MAX_CHARS)),
            retry_attempt: Some(attempts_made),
            max_retries: Some(max_retries),
            ..Self::base(index, file_name, FileResultStatus::Failed)
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Cut a human-readable message to at most `max_chars` characters.
///
/// Only the first line is kept so stack traces never reach users.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= max_chars {
        return first_line.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut truncated: String = first_line.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::CompletedWithErrors,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::CompletedWithErrors.is_terminal());
        assert!(FileResultStatus::Failed.is_terminal());
        assert!(!FileResultStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_status_from_counts() {
        assert_eq!(RunStatus::from_counts(3, 0), RunStatus::Completed);
        assert_eq!(RunStatus::from_counts(0, 3), RunStatus::Failed);
        assert_eq!(RunStatus::from_counts(2, 1), RunStatus::CompletedWithErrors);
    }

    #[test]
    fn test_token_usage_sum() {
        let usages = [TokenUsage::new(10, 20, 30), TokenUsage::new(15, 25, 40)];
        let total: TokenUsage = usages.iter().sum();
        assert_eq!(total, TokenUsage::new(25, 45, 70));
    }

    #[test]
    fn test_truncate_message_keeps_first_line() {
        let msg = "provider exploded\n    at frame 1\n    at frame 2";
        assert_eq!(truncate_message(msg, 100), "provider exploded");

        let long = "x".repeat(50);
        let cut = truncate_message(&long, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_per_file_result_serialization_skips_empty_fields() {
        let result = PerFileResult::processing(2, "b.pdf");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"status\":\"processing\""));
        assert!(!json.contains("response"));
        let back: PerFileResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
