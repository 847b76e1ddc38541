//! Error messages with actionable suggestions.

use std::path::Path;
use tambour_core::{Diagnostic, JobError, JobErrorCause, Remedy, RunnerError};

/// Build an error message for file read errors.
pub fn file_read_error(path: &str, err: &std::io::Error) -> String {
    use std::io::ErrorKind;

    let mut msg = format!("Failed to read '{}'", path);

    match err.kind() {
        ErrorKind::NotFound => {
            msg.push_str(": file not found");

            if let Some(suggestions) = find_similar_files(path) {
                if !suggestions.is_empty() {
                    msg.push_str(&format!(".\n\nDid you mean: {}?", suggestions.join(", ")));
                }
            }
        }
        ErrorKind::PermissionDenied => {
            msg.push_str(": permission denied. Check file permissions.");
        }
        _ => {
            msg.push_str(&format!(": {}", err));
        }
    }

    msg
}

/// Build an error message for an unknown `--layout` value.
pub fn unknown_layout_error(name: &str, available: &[&str]) -> String {
    let mut msg = format!("Unknown layout '{}': not a profile name or a readable file", name);

    if let Some(suggestion) = available
        .iter()
        .find(|candidate| levenshtein(name, candidate) <= 2)
    {
        msg.push_str(&format!(".\n\nDid you mean '{}'?", suggestion));
    } else {
        msg.push_str(&format!(".\n\nAvailable layouts: {}", available.join(", ")));
    }

    msg
}

/// Describe a failed conversion and what to do about it.
pub fn job_failure_message(input: &str, err: &JobError) -> String {
    let mut msg = format!("Failed to convert '{}': {}", input, err);

    let hint = match (&err.cause, err.remedy()) {
        (JobErrorCause::Format(_), _) => {
            "The file is not an EMB variant this layout understands. \
             Check the file, or select a matching layout with --layout."
        }
        (JobErrorCause::Encode(_), _) => {
            "The design cannot be represented in DST. Edit the design and try again."
        }
        (_, Remedy::RetryLater) => "This may be transient. Try again.",
        _ => "",
    };
    if !hint.is_empty() {
        msg.push_str("\n\n");
        msg.push_str(hint);
    }

    msg
}

/// Describe a refused request.
pub fn runner_error_message(err: &RunnerError) -> String {
    format!("{}. {}.", err, capitalize(&err.remedy().to_string()))
}

/// One line per decode diagnostic.
pub fn diagnostic_lines(input: &str, diagnostics: &[Diagnostic]) -> Vec<String> {
    diagnostics
        .iter()
        .map(|d| format!("warning: {}: {}", input, d))
        .collect()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Simple Levenshtein distance for short strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Find similar files in the same directory (for "did you mean" suggestions).
fn find_similar_files(path: &str) -> Option<Vec<String>> {
    let path = Path::new(path);
    let filename = path.file_name()?.to_str()?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let entries = std::fs::read_dir(parent).ok()?;
    let mut suggestions = Vec::new();

    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if levenshtein(filename, name) <= 2 && name != filename {
                suggestions.push(name.to_string());
            }
        }
    }

    suggestions.sort();
    suggestions.truncate(3);
    Some(suggestions)
}
