use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static INTERPOLATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$|
        \$([[:word:]]+)|
        \$\{([[:word:]]+)(?::([-?])([^}]*))?\}",
    )
    .expect("interpolation regex is valid")
});

/// Snapshot of the process environment, non UTF-8 entries are skipped.
pub fn vars() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| match (k.into_string(), v.into_string()) {
            (Ok(k), Ok(v)) => Some((k, v)),
            _ => None,
        })
        .collect()
}

/// Expand `$NAME`, `${NAME}`, `${NAME:-default}` and `${NAME:?message}` in
/// `input`. `$$` is an escaped `$`. Unset or empty variables without a default
/// are reported, all of them at once.
pub fn interpolate<'a>(
    input: &'a str,
    vars: &HashMap<String, String>,
) -> Result<Cow<'a, str>, Vec<String>> {
    let mut errs = Vec::new();

    let interpolated = INTERPOLATION.replace_all(input, |caps: &Captures<'_>| {
        let Some(name) = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()) else {
            return "$".to_string();
        };

        let value = vars.get(name).filter(|value| !value.is_empty());
        let word = caps.get(4).map(|m| m.as_str()).unwrap_or_default();

        match (value, caps.get(3).map(|m| m.as_str())) {
            (Some(value), _) => value.clone(),
            (None, Some("-")) => word.to_string(),
            (None, Some(_)) => {
                errs.push(format!(
                    "Non-empty environment variable required in config. name = {name:?}, error = {word:?}"
                ));
                String::new()
            }
            (None, None) => {
                errs.push(format!(
                    "Missing environment variable in config. name = {name:?}"
                ));
                String::new()
            }
        }
    });

    if errs.is_empty() {
        Ok(interpolated)
    } else {
        Err(errs)
    }
}
