//! Prompt assembly for the model backend.
//!
//! Builds the generation, correction, and package-resolution prompts, and
//! strips Markdown fences from model output before it is written to disk.

use crate::diagnose::Diagnosis;
use regex::Regex;

/// Build the prompt for generating a project's initial source.
pub fn build_generate_prompt(request: &str, dependencies: &[String]) -> String {
    let deps_note = if dependencies.is_empty() {
        "Use only the Python standard library unless the task clearly needs more.".to_string()
    } else {
        format!(
            "The following packages are installed and may be used: {}.",
            dependencies.join(", ")
        )
    };

    format!(
        r#"Write a complete, runnable Python script that satisfies this request:

{request}

{deps_note}

**Instructions:** Output ONLY the complete Python code block. Do not add explanations outside the code."#
    )
}

/// Build the correction prompt for a failed run.
///
/// Mirrors the shape the model saw on previous turns: the error text, the
/// offending line when known, and strict output instructions.
pub fn build_fix_prompt(diagnosis: &Diagnosis, extra_context: Option<&str>) -> String {
    let error_text = if diagnosis.raw_excerpt.is_empty() {
        diagnosis.detail.clone()
    } else {
        diagnosis.raw_excerpt.clone()
    };

    let line_info = diagnosis
        .error_line
        .map(|line| format!(" (near line {line})"))
        .unwrap_or_default();

    let extra = extra_context
        .map(|ctx| format!("\n**Additional context:**\n```text\n{ctx}\n```\n"))
        .unwrap_or_default();

    format!(
        r#"The following Python code failed with an error. Fix the code based on the error provided.

**Error Message:**
```text
{error_text}
```
**Context:** The error occurred{line_info}.
{extra}
**Instructions:** Output ONLY the complete, corrected Python code block. Do not add explanations outside the code."#
    )
}

/// Build the prompt asking the model to map a module name to a pip package.
pub fn build_resolve_package_prompt(module: &str, error_message: &str) -> String {
    format!(
        r#"You are a Python package expert. A user encountered the following import error:
```text
{error_message}
```
The error indicates that the module '{module}' could not be found.
**TASK:** Determine the correct **pip package name** that typically provides this module '{module}'.
**Examples:**
 - If module is 'cv2', package is 'opencv-python'.
 - If module is 'bs4', package is 'beautifulsoup4'.
 - If module is 'yaml', package is 'PyYAML'.
 - If module is 'sklearn', package is 'scikit-learn'.
 - If module is 'requests', package is 'requests'.
**Output:** Respond with ONLY the correct pip package name (e.g., `opencv-python`). If you are unsure or the module doesn't correspond to a common package, respond with `UNKNOWN`."#
    )
}

/// Extract Python source from model output.
///
/// Tries a ```python fence first, then any fence, then accepts raw text
/// that plausibly starts like Python. Always returns trimmed text.
pub fn extract_code(output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        return String::new();
    }

    let python_fence = Regex::new(r"(?s)```python\s*(.+?)\s*```").expect("static regex");
    if let Some(caps) = python_fence.captures(output) {
        return caps[1].trim().to_string();
    }

    let plain_fence = Regex::new(r"(?s)```\s*(.+?)\s*```").expect("static regex");
    if let Some(caps) = plain_fence.captures(output) {
        return caps[1].trim().to_string();
    }

    output.to_string()
}

/// Parse the model's answer to a package-resolution prompt.
///
/// Returns None for `UNKNOWN` or answers that cannot be a package name.
pub fn parse_package_answer(answer: &str) -> Option<String> {
    let name = answer.trim().trim_matches('`').trim();
    if name.is_empty() || name.eq_ignore_ascii_case("UNKNOWN") || name.contains(char::is_whitespace)
    {
        return None;
    }
    Some(name.to_string())
}
