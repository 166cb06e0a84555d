//! Environment variable interpolation for config files.
//!
//! Config values may reference the environment as `$VAR` or `${VAR}`, with
//! `${VAR:-default}` falling back when the variable is unset or empty, and
//! `$$` escaping a literal dollar sign.

use regex::Regex;
use std::env;
use std::sync::LazyLock;

static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\$\$",
        r"|\$\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<default>[^}]*))?\}",
        r"|\$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)",
    ))
    .expect("variable pattern is valid")
});

/// Expand environment variable references in `input`.
///
/// Failures are accumulated across the whole document, so a config with
/// several bad references reports all of them in one pass.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut errors = Vec::new();

    let text = VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            if &caps[0] == "$$" {
                return "$".to_string();
            }

            let name = caps
                .name("braced")
                .or_else(|| caps.name("bare"))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let default = caps.name("default").map(|m| m.as_str());

            match resolve(name, default) {
                Ok(value) => value,
                Err(message) => {
                    errors.push(message);
                    caps[0].to_string()
                }
            }
        })
        .into_owned();

    if errors.is_empty() { Ok(text) } else { Err(errors) }
}

/// Look up one variable, applying the fallback for unset or empty values.
/// A value carrying newlines is rejected so a variable cannot splice extra
/// YAML documents or keys into the config.
fn resolve(name: &str, default: Option<&str>) -> Result<String, String> {
    match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        Ok(value) if value.is_empty() => Ok(default.unwrap_or_default().to_string()),
        Ok(value) => Ok(value),
        Err(_) => match default {
            Some(default) => Ok(default.to_string()),
            None => Err(format!("environment variable '{name}' is not set")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scoped environment override, restored on drop. Each test uses its own
    /// variable names so tests stay independent under parallel execution.
    struct ScopedVar {
        key: &'static str,
        previous: Option<String>,
    }

    impl ScopedVar {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            // SAFETY: keys are unique per test, so no test observes another's
            // concurrent modification
            unsafe { env::set_var(key, value) };
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            // SAFETY: as above
            unsafe { env::remove_var(key) };
            Self { key, previous }
        }
    }

    impl Drop for ScopedVar {
        fn drop(&mut self) {
            // SAFETY: restores the state captured at construction
            match self.previous.take() {
                Some(value) => unsafe { env::set_var(self.key, value) },
                None => unsafe { env::remove_var(self.key) },
            }
        }
    }

    #[test]
    fn test_bare_and_braced_references() {
        let _a = ScopedVar::set("DARKROOM_VARS_BARE", "uploads");
        let _b = ScopedVar::set("DARKROOM_VARS_BRACED", "processed");

        let expanded =
            interpolate("source: $DARKROOM_VARS_BARE, dest: ${DARKROOM_VARS_BRACED}").unwrap();
        assert_eq!(expanded, "source: uploads, dest: processed");
    }

    #[test]
    fn test_fallback_applies_when_unset_or_empty() {
        let _unset = ScopedVar::unset("DARKROOM_VARS_UNSET");
        let _empty = ScopedVar::set("DARKROOM_VARS_EMPTY", "");

        assert_eq!(
            interpolate("${DARKROOM_VARS_UNSET:-us-east-1}").unwrap(),
            "us-east-1"
        );
        assert_eq!(
            interpolate("${DARKROOM_VARS_EMPTY:-fallback}").unwrap(),
            "fallback"
        );
    }

    #[test]
    fn test_empty_without_fallback_stays_empty() {
        let _empty = ScopedVar::set("DARKROOM_VARS_EMPTY_PLAIN", "");
        assert_eq!(interpolate("[${DARKROOM_VARS_EMPTY_PLAIN}]").unwrap(), "[]");
    }

    #[test]
    fn test_dollar_escape() {
        assert_eq!(interpolate("price: $$100").unwrap(), "price: $100");
    }

    #[test]
    fn test_missing_variables_all_reported() {
        let _a = ScopedVar::unset("DARKROOM_VARS_MISSING_A");
        let _b = ScopedVar::unset("DARKROOM_VARS_MISSING_B");

        let errors =
            interpolate("$DARKROOM_VARS_MISSING_A ${DARKROOM_VARS_MISSING_B}").unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("DARKROOM_VARS_MISSING_A"));
        assert!(errors[1].contains("DARKROOM_VARS_MISSING_B"));
    }

    #[test]
    fn test_newline_value_rejected() {
        let _v = ScopedVar::set("DARKROOM_VARS_MULTILINE", "a\nb");
        let errors = interpolate("key: $DARKROOM_VARS_MULTILINE").unwrap_err();
        assert!(errors[0].contains("newlines"));
    }

    #[test]
    fn test_text_without_references_untouched() {
        assert_eq!(
            interpolate("storage:\n  path: /var/lib/darkroom").unwrap(),
            "storage:\n  path: /var/lib/darkroom"
        );
    }

    #[test]
    fn test_yaml_document_expansion() {
        let _bucket = ScopedVar::set("DARKROOM_VARS_BUCKET", "media-bucket");
        let _region = ScopedVar::unset("DARKROOM_VARS_REGION");

        let yaml = "\
storage:
  path: \"s3://${DARKROOM_VARS_BUCKET}\"
  storage_options:
    aws_region: ${DARKROOM_VARS_REGION:-eu-west-1}
";
        let expanded = interpolate(yaml).unwrap();
        assert!(expanded.contains("s3://media-bucket"));
        assert!(expanded.contains("aws_region: eu-west-1"));
    }
}
