//! Target validation
//!
//! Structural checks run on every load, plus filesystem checks that look at
//! the paths a target will write to. Errors abort startup, warnings are
//! logged.

mod files;
mod lint;

pub use files::validate_paths;
pub use lint::lint_target;

use std::fmt;

use crate::TargetConfig;

/// Kind of problem found during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Certificate,
    Account,
    Files,
    Server,
    Timing,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Certificate => "certificate",
            ErrorCategory::Account => "account",
            ErrorCategory::Files => "files",
            ErrorCategory::Server => "server",
            ErrorCategory::Timing => "timing",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Collected errors and warnings for one target.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// All error messages joined into one line.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Structural validation of a single target.
pub fn validate_target(config: &TargetConfig) -> ValidationResult {
    let mut result = ValidationResult::new();
    let cert = &config.certificate;

    if cert.dns_names.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            "at least one entry in dns-names is required",
        ));
    }
    for name in &cert.dns_names {
        if name.trim().is_empty() || name.contains(char::is_whitespace) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("invalid dns name '{}'", name),
            ));
        }
    }
    if let Err(e) = cert.curve() {
        result.add_error(ValidationError::new(ErrorCategory::Certificate, e.to_string()));
    }

    match url::Url::parse(&cert.acme_directory) {
        Ok(url) if matches!(url.scheme(), "https" | "http") => {}
        Ok(url) => result.add_error(ValidationError::new(
            ErrorCategory::Account,
            format!("acme-directory must be an http(s) url, got scheme '{}'", url.scheme()),
        )),
        Err(e) => result.add_error(ValidationError::new(
            ErrorCategory::Account,
            format!("invalid acme-directory '{}': {}", cert.acme_directory, e),
        )),
    }
    if cert.acme_account_file.as_os_str().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Account,
            "acme-account-file is required",
        ));
    }
    for contact in &cert.acme_mail_contacts {
        if !contact.contains('@') || contact.starts_with("mailto:") {
            result.add_error(ValidationError::new(
                ErrorCategory::Account,
                format!("invalid contact address '{}'", contact),
            ));
        }
    }

    if cert.poll_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            "poll-interval-secs must be greater than zero",
        ));
    }
    if cert.authorization_timeout_secs == Some(0) {
        result.add_error(ValidationError::new(
            ErrorCategory::Timing,
            "authorization-timeout-secs must be greater than zero when set",
        ));
    }

    if config.files.cert_file.as_os_str().is_empty() {
        result.add_error(ValidationError::new(ErrorCategory::Files, "cert-file is required"));
    }
    match config.mode {
        crate::ServerMode::Haproxy if !config.files.single_file => {
            result.add_error(ValidationError::new(
                ErrorCategory::Server,
                "haproxy mode requires single-file: true",
            ));
        }
        _ => {}
    }
    if !config.files.single_file {
        match &config.files.key_file {
            None => result.add_error(ValidationError::new(
                ErrorCategory::Files,
                "key-file is required when single-file is false",
            )),
            Some(key) if key == &config.files.cert_file => result.add_error(ValidationError::new(
                ErrorCategory::Files,
                "key-file must differ from cert-file",
            )),
            Some(_) => {}
        }
    }

    result
}
