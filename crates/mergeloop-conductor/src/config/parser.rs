use crate::config::{ConfigError, Settings, DEFAULT_CONFIG_FILE};
use anyhow::{Context, Result};
use mergeloop_core::Severity;
use std::path::Path;
use tracing::debug;

/// Load settings for a working directory.
///
/// An explicit `path` must exist. Without one, `<workdir>/.mergeloop.yaml` is
/// read when present and defaults are used otherwise. Environment overrides
/// are applied on top, then the result is validated.
pub fn load_settings(path: Option<&Path>, workdir: &Path) -> Result<Settings> {
    let mut settings = match path {
        Some(p) => {
            let content =
                std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            parse_settings(&content).with_context(|| format!("loading {}", p.display()))?
        }
        None => {
            let default = workdir.join(DEFAULT_CONFIG_FILE);
            if default.exists() {
                let content = std::fs::read_to_string(&default)
                    .with_context(|| format!("reading {}", default.display()))?;
                parse_settings(&content)
                    .with_context(|| format!("loading {}", default.display()))?
            } else {
                debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
                Settings::default()
            }
        }
    };
    apply_env_overrides(&mut settings, |k| std::env::var(k).ok())?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Parse settings from a YAML string. `${{ env.NAME }}` placeholders in
/// string values are expanded from the process environment.
pub fn parse_settings(yaml: &str) -> Result<Settings> {
    let mut raw: serde_yaml::Value = serde_yaml::from_str(yaml).context("invalid YAML syntax")?;
    if raw.is_null() {
        return Ok(Settings::default());
    }
    expand_variables(&mut raw, &|k| std::env::var(k).ok());
    let settings: Settings =
        serde_yaml::from_value(raw).context("settings schema validation failed")?;
    Ok(settings)
}

fn expand_variables(value: &mut serde_yaml::Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        serde_yaml::Value::String(s) => {
            if s.contains("${{") {
                *s = expand_env_vars(s, lookup);
            }
        }
        serde_yaml::Value::Mapping(m) => {
            for (_, v) in m.iter_mut() {
                expand_variables(v, lookup);
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                expand_variables(v, lookup);
            }
        }
        _ => {}
    }
}

/// Replace `${{ env.NAME }}` with the variable's value (empty when unset).
/// Other expressions and unclosed placeholders are kept verbatim.
fn expand_env_vars(s: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${{") {
        result.push_str(&rest[..start]);
        let after_start = &rest[start + 3..];
        let Some(end) = after_start.find("}}") else {
            result.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let expr = after_start[..end].trim();
        match expr.strip_prefix("env.") {
            Some(name) => result.push_str(&lookup(name.trim()).unwrap_or_default()),
            None => result.push_str(&rest[start..start + 3 + end + 2]),
        }
        rest = &after_start[end + 2..];
    }
    result.push_str(rest);
    result
}

// ── Environment overrides ──

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: "expected true or false".into(),
        }),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: e.to_string(),
        })
}

/// Apply `GITHUB_REPOSITORY`, `PR_NUMBER`, `MIN_CONFIDENCE`, `MIN_SEVERITY`,
/// `REPORT_LOW`, `PARALLEL_VALIDATION`, `POST_COMMENTS` and `POST_SUMMARY`.
/// Empty values are ignored.
pub fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("GITHUB_REPOSITORY") {
        settings.repo = Some(v.trim().to_string());
    }
    if let Some(v) = get("PR_NUMBER") {
        settings.pr = Some(parse_value("PR_NUMBER", &v)?);
    }
    if let Some(v) = get("MIN_CONFIDENCE") {
        settings.review.min_confidence = parse_value("MIN_CONFIDENCE", &v)?;
    }
    if let Some(v) = get("MIN_SEVERITY") {
        settings.review.min_severity = parse_value::<Severity>("MIN_SEVERITY", &v)?;
    }
    if let Some(v) = get("REPORT_LOW") {
        settings.review.report_low = parse_bool("REPORT_LOW", &v)?;
    }
    if let Some(v) = get("PARALLEL_VALIDATION") {
        settings.review.parallel_validation = parse_bool("PARALLEL_VALIDATION", &v)?;
    }
    if let Some(v) = get("POST_COMMENTS") {
        settings.review.post_comments = parse_bool("POST_COMMENTS", &v)?;
    }
    if let Some(v) = get("POST_SUMMARY") {
        settings.review.post_summary = parse_bool("POST_SUMMARY", &v)?;
    }
    Ok(())
}

/// Constraints serde cannot express.
pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    let rules = &settings.merge_rules;
    if rules.max_iterations < 1 {
        return Err(ConfigError::Invalid(
            "merge_rules.max_iterations must be at least 1".into(),
        ));
    }
    let confidence = settings.review.min_confidence;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ConfigError::Invalid(format!(
            "review.min_confidence must be within [0, 1], got {confidence}"
        )));
    }
    for (key, value) in [
        ("merge_rules.min_total_coverage", rules.min_total_coverage),
        ("merge_rules.min_new_code_coverage", rules.min_new_code_coverage),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(ConfigError::Invalid(format!(
                "{key} must be within [0, 100], got {value}"
            )));
        }
    }
    if settings.review.max_parallel_validations == 0 {
        return Err(ConfigError::Invalid(
            "review.max_parallel_validations must be at least 1".into(),
        ));
    }
    if settings.orchestrator.max_parallel_reviews == 0 {
        return Err(ConfigError::Invalid(
            "orchestrator.max_parallel_reviews must be at least 1".into(),
        ));
    }
    Ok(())
}
