//! Diagnostic classifier for failed script runs.
//!
//! Turns a captured `RunOutcome` into a structured `Diagnosis` that drives
//! the correction loop's next action. Recognition is heuristic text
//! matching over interpreter stderr, organized as an ordered list of
//! pluggable matchers so new failure categories can be added without
//! touching the controller.

use crate::types::RunOutcome;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Number of trailing stderr lines kept in `raw_excerpt`.
///
/// Enough for a full Python traceback in the common case without shipping
/// megabytes of output back to the model.
const EXCERPT_TAIL_LINES: usize = 20;

/// Failure categories, ordered roughly by how mechanical the recovery is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisCategory {
    /// Import/module-not-found failure; recoverable by installing a package.
    MissingDependency,
    /// Any other interpreter-raised exception; recoverable via a model fix.
    SyntaxOrRuntimeError,
    /// The run hit its wall-clock limit; no stderr is informative.
    Timeout,
    /// Output matched no known pattern; the model gets the raw tail.
    Unknown,
}

impl DiagnosisCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingDependency => "missing_dependency",
            Self::SyntaxOrRuntimeError => "syntax_or_runtime_error",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

/// Structured interpretation of a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: DiagnosisCategory,
    /// Normalized one-line (or short) description fed back to the model.
    pub detail: String,
    /// Module name extracted from a missing-import failure.
    pub suggested_dependency: Option<String>,
    /// Source line from the innermost `File "...", line N` frame.
    pub error_line: Option<u32>,
    /// Tail of the captured failure output.
    pub raw_excerpt: String,
}

impl Diagnosis {
    /// Human-readable summary for history entries and fix prompts.
    pub fn summary(&self) -> String {
        match self.category {
            DiagnosisCategory::MissingDependency => format!(
                "missing dependency: {}",
                self.suggested_dependency.as_deref().unwrap_or("<unknown>")
            ),
            DiagnosisCategory::Timeout => self.detail.clone(),
            _ => self.detail.clone(),
        }
    }
}

/// One recognition rule. Matchers are consulted in order; the first to
/// produce a diagnosis wins.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn try_match(&self, text: &str) -> Option<Diagnosis>;
}

/// Matches `ModuleNotFoundError: No module named 'X'`.
pub struct ModuleNotFoundMatcher {
    re: Regex,
}

impl ModuleNotFoundMatcher {
    pub fn new() -> Self {
        Self {
            re: Regex::new(r"ModuleNotFoundError: No module named '([^']+)'")
                .expect("static regex"),
        }
    }
}

impl Default for ModuleNotFoundMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher for ModuleNotFoundMatcher {
    fn name(&self) -> &'static str {
        "module_not_found"
    }

    fn try_match(&self, text: &str) -> Option<Diagnosis> {
        let caps = self.re.captures(text)?;
        let module = caps.get(1)?.as_str().to_string();
        Some(Diagnosis {
            category: DiagnosisCategory::MissingDependency,
            detail: format!("No module named '{module}'"),
            suggested_dependency: Some(module),
            error_line: None,
            raw_excerpt: String::new(),
        })
    }
}

/// Matches `ImportError: ... 'x.y.z'`, keeping the last dotted segment as
/// the candidate module name.
pub struct ImportErrorMatcher {
    re: Regex,
}

impl ImportErrorMatcher {
    pub fn new() -> Self {
        Self {
            re: Regex::new(r"ImportError:.*'([^']+)'").expect("static regex"),
        }
    }
}

impl Default for ImportErrorMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher for ImportErrorMatcher {
    fn name(&self) -> &'static str {
        "import_error"
    }

    fn try_match(&self, text: &str) -> Option<Diagnosis> {
        let caps = self.re.captures(text)?;
        let dotted = caps.get(1)?.as_str();
        let module = dotted.rsplit('.').next().unwrap_or(dotted).to_string();
        Some(Diagnosis {
            category: DiagnosisCategory::MissingDependency,
            detail: format!("ImportError involving '{dotted}'"),
            suggested_dependency: Some(module),
            error_line: None,
            raw_excerpt: String::new(),
        })
    }
}

/// Matches the final `SomeError: message` line of a traceback.
pub struct ExceptionMatcher {
    re: Regex,
}

impl ExceptionMatcher {
    pub fn new() -> Self {
        Self {
            re: Regex::new(
                r"(?m)^([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*(?:Error|Exception)):\s?(.*)$",
            )
            .expect("static regex"),
        }
    }
}

impl Default for ExceptionMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher for ExceptionMatcher {
    fn name(&self) -> &'static str {
        "exception"
    }

    fn try_match(&self, text: &str) -> Option<Diagnosis> {
        // The innermost exception is the last matching line.
        let caps = self.re.captures_iter(text).last()?;
        let exc_type = caps.get(1).map_or("", |m| m.as_str());
        let message = caps.get(2).map_or("", |m| m.as_str());
        let detail = if message.is_empty() {
            exc_type.to_string()
        } else {
            format!("{exc_type}: {message}")
        };
        Some(Diagnosis {
            category: DiagnosisCategory::SyntaxOrRuntimeError,
            detail,
            suggested_dependency: None,
            error_line: None,
            raw_excerpt: String::new(),
        })
    }
}

/// Ordered classifier over pluggable matchers.
///
/// Pure with respect to persisted state: reads only the outcome, performs
/// no I/O.
pub struct Classifier {
    matchers: Vec<Box<dyn Matcher>>,
    line_re: Regex,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.matchers.iter().map(|m| m.name()).collect();
        f.debug_struct("Classifier").field("matchers", &names).finish()
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ModuleNotFoundMatcher::new()),
            Box::new(ImportErrorMatcher::new()),
            Box::new(ExceptionMatcher::new()),
        ])
    }
}

impl Classifier {
    /// Create a classifier with an explicit matcher order.
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self {
            matchers,
            line_re: Regex::new(r#"File ".*?", line (\d+)"#).expect("static regex"),
        }
    }

    /// Classify a failed, non-cancelled outcome.
    ///
    /// Timeouts short-circuit with a synthetic diagnosis before any text
    /// matching, so the controller has a uniform entry point.
    pub fn classify(&self, outcome: &RunOutcome) -> Diagnosis {
        if outcome.timed_out {
            return Diagnosis {
                category: DiagnosisCategory::Timeout,
                detail: format!(
                    "script exceeded its time limit after {} ms and was terminated",
                    outcome.duration_ms
                ),
                suggested_dependency: None,
                error_line: None,
                raw_excerpt: String::new(),
            };
        }

        let text = outcome.failure_text();
        let excerpt = tail_excerpt(&text, EXCERPT_TAIL_LINES);
        let error_line = self.extract_error_line(&text);

        for matcher in &self.matchers {
            if let Some(mut diagnosis) = matcher.try_match(&text) {
                diagnosis.error_line = error_line;
                diagnosis.raw_excerpt = excerpt;
                return diagnosis;
            }
        }

        Diagnosis {
            category: DiagnosisCategory::Unknown,
            detail: format!("script failed with exit code {}", outcome.exit_code),
            suggested_dependency: None,
            error_line,
            raw_excerpt: excerpt,
        }
    }

    /// Innermost traceback frame wins, matching Python's reporting order.
    fn extract_error_line(&self, text: &str) -> Option<u32> {
        self.line_re
            .captures_iter(text)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Last `max_lines` lines of a text blob.
fn tail_excerpt(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
