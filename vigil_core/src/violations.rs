//! Content-security-policy violation intake
//!
//! Violations are kept in a fixed-capacity FIFO. Classification looks at
//! what was blocked, never at any severity the reporter claims. The module
//! also validates audio data URIs and sanitizes user input before it is
//! placed in a URL or script context.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::logging::{LogCategory, LogLevel};
use crate::monitoring::AlertSink;
use crate::Result;

/// One reported policy violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CspViolation {
    pub document_uri: String,
    pub violated_directive: String,
    pub effective_directive: String,
    pub original_policy: String,
    pub blocked_uri: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

/// Browser `csp-report` body
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct ReportBody {
    document_uri: String,
    violated_directive: String,
    effective_directive: String,
    original_policy: String,
    blocked_uri: String,
    status_code: u16,
}

#[derive(Debug, Deserialize)]
struct ReportEnvelope {
    #[serde(rename = "csp-report")]
    report: ReportBody,
}

impl CspViolation {
    /// Create a violation stamped now
    pub fn new(
        document_uri: impl Into<String>,
        violated_directive: impl Into<String>,
        effective_directive: impl Into<String>,
        blocked_uri: impl Into<String>,
    ) -> Self {
        Self {
            document_uri: document_uri.into(),
            violated_directive: violated_directive.into(),
            effective_directive: effective_directive.into(),
            original_policy: String::new(),
            blocked_uri: blocked_uri.into(),
            status_code: 0,
            timestamp: Utc::now(),
        }
    }

    /// Parse a report body, with or without the `csp-report` envelope
    pub fn from_report_json(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)?;
        let report = if value.get("csp-report").is_some() {
            serde_json::from_value::<ReportEnvelope>(value)?.report
        } else {
            serde_json::from_value::<ReportBody>(value)?
        };

        let effective_directive = if report.effective_directive.is_empty() {
            report.violated_directive.clone()
        } else {
            report.effective_directive
        };

        Ok(Self {
            document_uri: report.document_uri,
            violated_directive: report.violated_directive,
            effective_directive,
            original_policy: report.original_policy,
            blocked_uri: report.blocked_uri,
            status_code: report.status_code,
            timestamp: Utc::now(),
        })
    }

    /// Whether the violation points at a likely injection
    pub fn is_critical(&self) -> bool {
        is_critical(self)
    }
}

/// Classify a violation
///
/// Critical when the blocked URI embeds base64 audio, when an inline script
/// was blocked, or when the blocked URI mentions `eval`.
pub fn is_critical(violation: &CspViolation) -> bool {
    let blocked = violation.blocked_uri.as_str();

    if let Some(rest) = blocked.find("data:audio/").map(|at| &blocked[at..]) {
        let media_type = rest.split(',').next().unwrap_or(rest);
        if media_type.contains(";base64") {
            return true;
        }
    }

    let script_directive = matches!(
        violation.effective_directive.as_str(),
        "script-src" | "script-src-elem"
    );
    if script_directive && blocked == "inline" {
        return true;
    }

    blocked.contains("eval")
}

/// Audio media types allowed in a data URI
pub const ALLOWED_AUDIO_TYPES: [&str; 3] = ["audio/wav", "audio/ogg", "audio/webm"];

/// Kind of threat a rejected resource represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    Xss,
    Injection,
    MaliciousResource,
    Unknown,
}

/// Outcome of validating a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat: Option<ThreatKind>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            valid: true,
            reason: None,
            threat: None,
        }
    }

    pub fn rejected(reason: impl Into<String>, threat: ThreatKind) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            threat: Some(threat),
        }
    }
}

/// Validate an audio data URI
///
/// Base64 MPEG audio is always rejected as an injection. Other `data:audio/`
/// URIs must name one of [`ALLOWED_AUDIO_TYPES`]. Anything that is not an
/// audio data URI is left to the policy and reported valid.
pub fn validate_audio_data_uri(data_uri: &str) -> ValidationResult {
    if data_uri.starts_with("data:audio/mpeg;base64") {
        return ValidationResult::rejected(
            "data:audio/mpeg;base64 is blocked as a likely injection",
            ThreatKind::Injection,
        );
    }

    let Some(rest) = data_uri.strip_prefix("data:") else {
        return ValidationResult::allowed();
    };
    if !rest.starts_with("audio/") {
        return ValidationResult::allowed();
    }

    let media_type = rest.split([';', ',']).next().unwrap_or(rest);
    if media_type.len() <= "audio/".len() {
        return ValidationResult::rejected("Invalid audio media type", ThreatKind::MaliciousResource);
    }
    if !ALLOWED_AUDIO_TYPES.contains(&media_type) {
        return ValidationResult::rejected(
            format!("Audio type not allowed: {}", media_type),
            ThreatKind::MaliciousResource,
        );
    }

    ValidationResult::allowed()
}

/// Where sanitized user input is going to be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputContext {
    #[default]
    Html,
    Url,
    Script,
}

/// Make user input safe for the given context
///
/// HTML context escapes markup characters. URL context returns the
/// normalized URL, or an empty string when it does not parse or uses the
/// `javascript:` or `data:` scheme. Script context never passes user input
/// through.
pub fn sanitize_user_input(input: &str, context: InputContext) -> String {
    match context {
        InputContext::Html => escape_html(input),
        InputContext::Url => match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "javascript" | "data") => {
                debug!(scheme = url.scheme(), "Rejected user URL");
                String::new()
            }
            Ok(url) => url.to_string(),
            Err(_) => String::new(),
        },
        InputContext::Script => String::new(),
    }
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Bounded store of recent violations
pub struct ViolationIntake {
    capacity: usize,
    violations: Mutex<VecDeque<CspViolation>>,
    audio_sources: RwLock<HashSet<String>>,
    alert_sink: Arc<dyn AlertSink>,
}

impl ViolationIntake {
    pub fn new(capacity: usize, alert_sink: Arc<dyn AlertSink>) -> Self {
        Self {
            capacity: capacity.max(1),
            violations: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            audio_sources: RwLock::new(HashSet::new()),
            alert_sink,
        }
    }

    /// Record a violation, escalating it once if critical
    ///
    /// Returns whether the violation was classified critical.
    pub fn on_violation(&self, violation: CspViolation) -> bool {
        let critical = is_critical(&violation);

        warn!(
            directive = %violation.violated_directive,
            blocked_uri = %violation.blocked_uri,
            document_uri = %violation.document_uri,
            critical,
            "CSP violation reported"
        );
        metrics::counter!("vigil_csp_violations_total", 1, "critical" => if critical { "true" } else { "false" });

        let metadata = if critical {
            serde_json::to_value(&violation).ok()
        } else {
            None
        };
        let message = format!(
            "Critical CSP violation: {} - {}",
            violation.violated_directive, violation.blocked_uri
        );

        {
            let mut violations = self.violations.lock();
            violations.push_back(violation);
            while violations.len() > self.capacity {
                violations.pop_front();
            }
        }

        if let Some(metadata) = metadata {
            self.alert_sink
                .raise(LogLevel::Critical, LogCategory::CspViolation, &message, metadata);
        }

        critical
    }

    /// The `n` most recent violations, oldest first
    pub fn recent_violations(&self, n: usize) -> Vec<CspViolation> {
        let violations = self.violations.lock();
        let skip = violations.len().saturating_sub(n);
        violations.iter().skip(skip).cloned().collect()
    }

    /// Retained violations classified critical
    pub fn critical_violations(&self) -> Vec<CspViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| is_critical(v))
            .cloned()
            .collect()
    }

    pub fn critical_count(&self) -> usize {
        self.violations.lock().iter().filter(|v| is_critical(v)).count()
    }

    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every retained violation
    pub fn clear_violations(&self) {
        self.violations.lock().clear();
    }

    /// Trust audio served from `source` and anything under it
    pub fn whitelist_audio_source(&self, source: impl Into<String>) {
        let source = source.into();
        debug!(source = %source, "Audio source whitelisted");
        self.audio_sources.write().insert(source);
    }

    /// Whether `source` starts with a whitelisted audio source
    pub fn is_audio_source_whitelisted(&self, source: &str) -> bool {
        self.audio_sources
            .read()
            .iter()
            .any(|prefix| !prefix.is_empty() && source.starts_with(prefix.as_str()))
    }
}
