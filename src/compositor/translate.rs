//! Translation of native diagnostics into [`ErrorKind`]s.
//!
//! Classification is pattern based and first-match-wins. The table is open:
//! callers may append rules for diagnostics the built-in table does not know.

use std::process::ExitStatus;
use std::sync::LazyLock;

use regex::Regex;

use super::error::{CompositorError, ErrorKind};

/// Built-in rules, in priority order.
static DEFAULT_RULES: LazyLock<Vec<TranslationRule>> = LazyLock::new(|| {
    [
        (r"(?i)no such file or directory", ErrorKind::NotFound),
        (r"(?i)\bos error 2\b", ErrorKind::NotFound),
        (r"(?i)\b(file|path|source) does not exist\b", ErrorKind::NotFound),
        (r"(?i)no video stream found", ErrorKind::UnsupportedMedia),
        (r"(?i)no audio stream found", ErrorKind::UnsupportedMedia),
        (r"(?i)invalid data found when processing input", ErrorKind::UnsupportedMedia),
        (r"(?i)\b(decoder|codec) not found\b", ErrorKind::UnsupportedMedia),
        (r"(?i)unsupported (codec|pixel format|format|container)", ErrorKind::UnsupportedMedia),
        (r"(?i)\btimed out\b", ErrorKind::Timeout),
    ]
    .into_iter()
    .map(|(pattern, kind)| TranslationRule {
        pattern: Regex::new(pattern).unwrap(),
        kind,
    })
    .collect()
});

/// Maps a diagnostic pattern to an error kind.
#[derive(Debug, Clone)]
pub struct TranslationRule {
    pattern: Regex,
    kind: ErrorKind,
}

impl TranslationRule {
    pub fn new(pattern: &str, kind: ErrorKind) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            kind,
        })
    }

    pub fn matches(&self, message: &str) -> bool {
        self.pattern.is_match(message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Pattern table that classifies native worker messages.
#[derive(Debug, Clone)]
pub struct ErrorTranslator {
    rules: Vec<TranslationRule>,
}

impl Default for ErrorTranslator {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }
}

impl ErrorTranslator {
    /// A translator with the built-in rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// A translator with no rules; everything maps to `Unknown`.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. Rules added later have lower priority.
    pub fn with_rule(mut self, pattern: &str, kind: ErrorKind) -> Result<Self, regex::Error> {
        self.push(TranslationRule::new(pattern, kind)?);
        Ok(self)
    }

    pub fn push(&mut self, rule: TranslationRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[TranslationRule] {
        &self.rules
    }

    /// Classify a raw diagnostic.
    pub fn translate(&self, raw_message: &str) -> ErrorKind {
        self.rules
            .iter()
            .find(|rule| rule.matches(raw_message))
            .map(TranslationRule::kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Build the caller-facing error for a failure frame.
    pub fn to_error(&self, message: String, backtrace: Option<String>) -> CompositorError {
        let kind = self.translate(&message);
        let err = CompositorError::new(kind, message);
        match backtrace {
            Some(bt) => err.with_backtrace(bt),
            None => err,
        }
    }
}

/// Describe why a worker stopped producing output.
///
/// Always `WorkerCrashed`; the exit condition and the tail of the worker's
/// stderr become the message.
pub fn translate_exit(status: Option<ExitStatus>, stderr_tail: &str) -> CompositorError {
    let mut message = match status {
        Some(status) => describe_status(status),
        None => "compositor closed its output stream".to_string(),
    };
    let tail = stderr_tail.trim();
    if !tail.is_empty() {
        message.push_str(": ");
        message.push_str(tail);
    }
    CompositorError::crashed(message)
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("compositor exited with code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            // SIGKILL without a request from us is almost always the OOM killer.
            if signal == 9 {
                return "compositor was killed by signal 9 (SIGKILL), possibly out of memory"
                    .to_string();
            }
            return format!("compositor was killed by signal {signal}");
        }
    }

    "compositor exited".to_string()
}
