pub mod config;
pub mod path_processing;

pub use config::{CONFIG_PATH_ENV, ConfigError, StepLineConfig, default_config_path};
pub use path_processing::expand_tilde;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization: )([\w\-\.=:/+]+)",
        r"(?i)([A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
        r"(?i)(DATABASE_URL=)([^\s]+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("redaction pattern should compile"))
    .collect()
});

/// Redacts values that look like secrets in a string.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in REDACT_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |caps: &Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{}<redacted>", prefix)
            })
            .to_string();
    }
    redacted
}

/// Returns true when an environment key names something secret.
pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["KEY", "TOKEN", "SECRET", "PASSWORD"].iter().any(|marker| upper.ends_with(marker)) || upper == "DATABASE_URL"
}
