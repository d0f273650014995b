//! Classification of runtime output lines.
//!
//! Heuristic only. A misclassified line changes the log level it is reported
//! at and nothing else.

use tracing::{debug, error, info, warn};

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

impl StreamOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOrigin::Stdout => "stdout",
            StreamOrigin::Stderr => "stderr",
        }
    }
}

/// Level assigned to a line of runtime output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    /// Download/verification progress.
    Progress,
    /// Plain output with no recognisable signal.
    Output,
}

const ERROR_WORDS: &[&str] = &["error", "failed", "panic", "fatal"];
const WARNING_WORDS: &[&str] = &["warn", "deprecated"];
const PROGRESS_WORDS: &[&str] = &["pulling", "verifying", "downloading", "writing manifest"];
const INFO_WORDS: &[&str] = &["listening", "starting", "success", "loaded", "info"];

/// Classify one output line.
pub fn classify(line: &str, origin: StreamOrigin) -> LogLevel {
    let lower = line.to_ascii_lowercase();

    if let Some(level) = structured_level(&lower) {
        return level;
    }

    if ERROR_WORDS.iter().any(|w| lower.contains(w)) {
        return LogLevel::Error;
    }
    if WARNING_WORDS.iter().any(|w| lower.contains(w)) {
        return LogLevel::Warning;
    }
    if lower.contains('%') || PROGRESS_WORDS.iter().any(|w| lower.contains(w)) {
        return LogLevel::Progress;
    }
    if INFO_WORDS.iter().any(|w| lower.contains(w)) {
        return LogLevel::Info;
    }

    match origin {
        StreamOrigin::Stdout => LogLevel::Info,
        // The runtime writes ordinary chatter to stderr.
        StreamOrigin::Stderr => LogLevel::Output,
    }
}

/// Explicit `level=X` markers, as emitted by the runtime's structured logger.
fn structured_level(lower: &str) -> Option<LogLevel> {
    let idx = lower.find("level=")?;
    let value: String = lower[idx + 6..]
        .trim_start_matches('"')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();

    match value.as_str() {
        "error" | "fatal" | "panic" => Some(LogLevel::Error),
        "warn" | "warning" => Some(LogLevel::Warning),
        "info" | "debug" | "trace" => Some(LogLevel::Info),
        _ => None,
    }
}

/// Remove ANSI escape sequences (cursor movement, colours).
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // CSI: parameters then a final byte in '@'..='~'
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        } else {
            chars.next();
        }
    }

    out
}

/// Emit `line` through tracing at its classified level.
pub fn emit(source: &str, pid: Option<u32>, origin: StreamOrigin, line: &str) -> LogLevel {
    let level = classify(line, origin);
    let stream = origin.as_str();
    match level {
        LogLevel::Error => error!(source, pid, stream, "{}", line),
        LogLevel::Warning => warn!(source, pid, stream, "{}", line),
        LogLevel::Info => info!(source, pid, stream, "{}", line),
        LogLevel::Progress | LogLevel::Output => debug!(source, pid, stream, "{}", line),
    }
    level
}
