//! Target linting
//!
//! Settings that are legal but probably not what the operator meant.

use super::{ValidationResult, ValidationWarning};
use crate::{ServerMode, TargetConfig};

/// Lint a target for suspicious combinations.
pub fn lint_target(config: &TargetConfig) -> ValidationResult {
    let mut result = ValidationResult::new();
    let name = config.name();
    let timing = &config.timing;

    if timing.renewal_due_cert == 0 && timing.renewal_due_ocsp == 0 {
        result.add_warning(ValidationWarning::new(format!(
            "target '{}' has renewal-due-cert and renewal-due-ocsp set to 0, nothing will be renewed",
            name
        )));
    }

    if config.mode == ServerMode::Nginx && timing.renewal_due_ocsp > 0 {
        result.add_warning(ValidationWarning::new(format!(
            "target '{}' sets renewal-due-ocsp but nginx fetches OCSP responses itself, the setting is ignored",
            name
        )));
    }

    if config.mode == ServerMode::Haproxy && config.haproxy.haproxy_socket.is_none() {
        result.add_warning(ValidationWarning::new(format!(
            "target '{}' has no haproxy-socket, files are written but haproxy is not updated",
            name
        )));
    }

    if config.mode == ServerMode::Haproxy && config.nginx.reload_nginx {
        result.add_warning(ValidationWarning::new(format!(
            "target '{}' sets reload-nginx in haproxy mode, the setting is ignored",
            name
        )));
    }

    if config.certificate.register_acme && !config.certificate.accept_acme_tos {
        result.add_warning(ValidationWarning::new(format!(
            "target '{}' enables register-acme without accept-acme-tos, registration will fail if the CA publishes terms of service",
            name
        )));
    }

    if config.certificate.must_staple && timing.renewal_due_ocsp == 0 && config.mode == ServerMode::Haproxy {
        result.add_warning(ValidationWarning::new(format!(
            "target '{}' requests must-staple but never refreshes OCSP responses",
            name
        )));
    }

    if timing.run_interval_minutes > 0
        && timing.renewal_due_cert > 0
        && timing.run_interval_minutes > u64::from(timing.renewal_due_cert) * 24 * 60
    {
        result.add_warning(ValidationWarning::new(format!(
            "target '{}' runs less often than renewal-due-cert, the certificate may expire between runs",
            name
        )));
    }

    result
}
