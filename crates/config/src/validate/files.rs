//! Filesystem validation
//!
//! Checks that the directories a target writes into exist and that the
//! configured paths are not occupied by something other than a file.

use std::path::Path;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{ServerMode, TargetConfig};

/// Validate the paths referenced by a target.
pub fn validate_paths(config: &TargetConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    check_writable_file(&config.files.cert_file, "cert-file", &mut result);
    if let Some(key) = config.files.split_key_file() {
        check_writable_file(key, "key-file", &mut result);
    }
    check_writable_file(&config.certificate.acme_account_file, "acme-account-file", &mut result);

    let account = &config.certificate.acme_account_file;
    if !account.exists() && !config.certificate.register_acme {
        result.add_warning(ValidationWarning::new(format!(
            "account file {:?} does not exist and register-acme is disabled, run 'certkeeper account register' first",
            account
        )));
    }

    if config.mode == ServerMode::Haproxy {
        if let Some(socket) = &config.haproxy.haproxy_socket {
            if !socket.exists() {
                result.add_warning(ValidationWarning::new(format!(
                    "haproxy socket {:?} does not exist yet",
                    socket
                )));
            }
        }
    }

    if let Some(hook) = &config.deploy_hook.executable {
        if !hook.is_file() {
            result.add_error(ValidationError::new(
                ErrorCategory::Server,
                format!("deploy hook not found: {:?}", hook),
            ));
        }
    }

    result
}

fn check_writable_file(path: &Path, key: &str, result: &mut ValidationResult) {
    if path.as_os_str().is_empty() {
        return;
    }

    if path.is_dir() {
        result.add_error(ValidationError::new(
            ErrorCategory::Files,
            format!("{} {:?} is a directory", key, path),
        ));
        return;
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return,
    };
    if !parent.is_dir() {
        result.add_error(ValidationError::new(
            ErrorCategory::Files,
            format!("directory for {} does not exist: {:?}", key, parent),
        ));
    }
}
