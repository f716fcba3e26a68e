use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;
use tracing::info;

// Pre-compiled regex patterns for credential stripping
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
        .expect("Invalid email regex pattern")
});
static JWT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+")
        .expect("Invalid JWT regex pattern")
});
static BEARER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").expect("Invalid bearer regex pattern")
});
// Presigned links authenticate through their query string
static URL_QUERY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(https?://[^\s?#"'<>]+)\?[^\s"'<>]*"#).expect("Invalid URL regex pattern")
});

/// Initialize Sentry crash reporting
///
/// # Environment Variables
/// - `SENTRY_DSN`: Sentry Data Source Name (required)
/// - `SENTRY_ENVIRONMENT`: Environment name (default: "development")
/// - `SENTRY_RELEASE`: Release version (default: from Cargo.toml)
/// - `SENTRY_TRACES_SAMPLE_RATE`: Performance monitoring sample rate (default: 0.1)
///
/// Returns `None` when no DSN is configured. The guard must be kept alive
/// for the lifetime of the process.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("Sentry DSN not configured - crash reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });
    let traces_sample_rate = env::var("SENTRY_TRACES_SAMPLE_RATE")
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .unwrap_or(0.1);

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            traces_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    info!(
        "Sentry crash reporting initialized (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

/// Strip credentials from an event before it leaves the machine.
///
/// Document links, tokens and user addresses are replaced; only error text,
/// stack traces and operational metadata are sent.
fn before_send_filter(
    mut event: sentry::protocol::Event<'static>,
) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = redact(message);
    }

    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = redact(value);
        }
    }

    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = redact(message);
        }
    }

    event
        .tags
        .insert("relay_version".into(), env!("CARGO_PKG_VERSION").into());
    event
        .tags
        .insert("platform".into(), std::env::consts::OS.into());
    event
        .tags
        .insert("arch".into(), std::env::consts::ARCH.into());

    Some(event)
}

/// Remove URL query strings, bearer tokens, JWTs and email addresses.
pub fn redact(message: &str) -> String {
    let mut cleaned = URL_QUERY_REGEX
        .replace_all(message, "$1?[QUERY_REDACTED]")
        .to_string();

    // JWTs first so a bearer JWT reads as a JWT
    cleaned = JWT_REGEX.replace_all(&cleaned, "[JWT_REDACTED]").to_string();
    cleaned = BEARER_REGEX
        .replace_all(&cleaned, "Bearer [TOKEN_REDACTED]")
        .to_string();
    cleaned = EMAIL_REGEX
        .replace_all(&cleaned, "[EMAIL_REDACTED]")
        .to_string();

    cleaned
}

/// Tag the current scope with the printer the queue runs on.
pub fn set_printer_context(printer_name: &str) {
    sentry::configure_scope(|scope| {
        scope.set_tag("printer", printer_name);
    });
}

/// Report a queue run that ended on a fatal condition.
pub fn capture_queue_stop(reason: &str, detail: &str) {
    sentry::with_scope(
        |scope| {
            scope.set_tag("event_type", "queue_stopped");
            scope.set_tag("stop_reason", reason);
        },
        || {
            sentry::capture_message(
                &format!("Print queue stopped ({}): {}", reason, redact(detail)),
                sentry::Level::Warning,
            );
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_email() {
        let cleaned = redact("Owner ops@example.com triggered error");
        assert!(!cleaned.contains("ops@example.com"));
        assert!(cleaned.contains("[EMAIL_REDACTED]"));
    }

    #[test]
    fn test_redact_presigned_query() {
        let message = "Fetch 403 for https://bucket.s3.amazonaws.com/p/a.pdf?X-Amz-Credential=AKIA&X-Amz-Signature=ff00 failed";
        let cleaned = redact(message);
        assert!(!cleaned.contains("X-Amz-Signature"));
        assert!(!cleaned.contains("AKIA"));
        assert!(cleaned.contains("https://bucket.s3.amazonaws.com/p/a.pdf?[QUERY_REDACTED]"));
        assert!(cleaned.ends_with(" failed"));
    }

    #[test]
    fn test_redact_jwt() {
        // Test token from jwt.io (not a real secret)
        let test_jwt = ["eyJhbGci", "OiJIUzI1NiIsInR5cCI6IkpXVCJ9.", "eyJzdWIiOi", "IxMjM0NTY3ODkwIn0.", "dozjgNryP4J3", "jVmNHl0w5N_", "XgL0n3I9PlFU", "P0THsR8U"].join("");
        let cleaned = redact(&format!("JWT token: {}", test_jwt));
        assert!(!cleaned.contains("eyJhbGci"));
        assert!(cleaned.contains("[JWT_REDACTED]"));
    }

    #[test]
    fn test_redact_bearer_token() {
        let cleaned = redact("Authorization: Bearer abc123.secret");
        assert!(!cleaned.contains("abc123"));
        assert!(cleaned.contains("Bearer [TOKEN_REDACTED]"));
    }

    #[test]
    fn test_plain_message_untouched() {
        assert_eq!(redact("lp failed: printer offline"), "lp failed: printer offline");
    }
}
