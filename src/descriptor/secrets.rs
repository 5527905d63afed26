//! Secret placeholder resolution for header values.
//!
//! Two spellings are recognised: `${VAR}` and `<VAR>` (upper-case only).

use std::sync::OnceLock;

use regex::{Captures, Regex};

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|<([A-Z][A-Z0-9_]*)>")
            .expect("placeholder pattern is valid")
    })
}

fn variable_name<'a>(captures: &Captures<'a>) -> &'a str {
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str())
        .unwrap_or_default()
}

/// Replace every placeholder using `lookup`.
///
/// Returns the names of all variables `lookup` could not resolve; the value
/// is never returned partially substituted.
pub fn resolve_placeholders(
    value: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let resolved = placeholder_regex().replace_all(value, |captures: &Captures<'_>| {
        let name = variable_name(captures);
        match lookup(name) {
            Some(secret) => secret,
            None => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(resolved.into_owned())
    } else {
        Err(missing)
    }
}

/// Names of placeholders still present in `value`.
pub fn unresolved_placeholders(value: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(value)
        .map(|captures| variable_name(&captures).to_string())
        .collect()
}

/// Lookup backed by the process environment.
pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
