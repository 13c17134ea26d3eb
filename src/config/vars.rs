//! Environment variable interpolation for config files.
//!
//! Credentials such as the warehouse access token are usually injected
//! through the environment rather than written into the YAML file.
//!
//! Supported forms:
//! - `$VAR` or `${VAR}`: value of VAR, error if unset
//! - `${VAR:-fallback}`: fallback if VAR is unset or empty
//! - `${VAR-fallback}`: fallback only if VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<fallback>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("interpolation pattern must compile")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// One message per variable that could not be resolved.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// How a `${VAR...}` reference falls back when the variable is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback<'a> {
    None,
    /// `${VAR-x}`
    IfUnset(&'a str),
    /// `${VAR:-x}`
    IfUnsetOrEmpty(&'a str),
}

impl<'a> Fallback<'a> {
    fn from_captures(caps: &Captures<'a>) -> Self {
        let fallback = caps.name("fallback").map_or("", |m| m.as_str());
        match caps.name("op").map(|m| m.as_str()) {
            Some(":-") => Fallback::IfUnsetOrEmpty(fallback),
            Some(_) => Fallback::IfUnset(fallback),
            None => Fallback::None,
        }
    }
}

fn resolve(name: &str, fallback: Fallback<'_>) -> Result<String, String> {
    match (env::var(name), fallback) {
        (Ok(value), _) if value.contains(['\n', '\r']) => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        (Ok(value), Fallback::IfUnsetOrEmpty(fallback)) if value.is_empty() => {
            Ok(fallback.to_string())
        }
        (Ok(value), _) => Ok(value),
        (Err(_), Fallback::IfUnset(fallback) | Fallback::IfUnsetOrEmpty(fallback)) => {
            Ok(fallback.to_string())
        }
        (Err(_), Fallback::None) => Err(format!("environment variable '{name}' is not set")),
    }
}

/// Interpolate environment variables in the given text.
///
/// Every unresolved variable is reported, not just the first.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| {
            if caps.name("escape").is_some() {
                return "$".to_string();
            }

            let name = caps
                .name("braced")
                .or_else(|| caps.name("bare"))
                .map_or("", |m| m.as_str());

            match resolve(name, Fallback::from_captures(caps)) {
                Ok(value) => value,
                Err(message) => {
                    errors.push(message);
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
