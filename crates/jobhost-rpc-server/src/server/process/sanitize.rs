//! Redaction of credentials in process arguments and worker output.

use regex::Regex;
use std::sync::LazyLock;

const REDACTED: &str = "[Hidden Credential]";

static SECRET: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(AccountKey|SharedAccessKey|SharedAccessSignature|AccessKey|Password|pwd|sig|token)=([^;&\s"']+)"#,
    )
    .ok()
});

/// Replaces the value of every `key=secret` pair that looks like a storage
/// or service credential. Text without secrets is returned unchanged.
pub fn sanitize(input: &str) -> String {
    match SECRET.as_ref() {
        Some(re) => re
            .replace_all(input, format!("$1={REDACTED}").as_str())
            .into_owned(),
        // Unreachable with a valid pattern; never leak the input.
        None => REDACTED.to_owned(),
    }
}
