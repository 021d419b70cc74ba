//! Template - `{{ name }}` substitution for the instance bootstrap payload

use std::collections::HashMap;

use thiserror::Error;

/// Bootstrap script shipped with the crate; expects `bucket`, `region` and `prefix`
pub const DEFAULT_BOOTSTRAP: &str = include_str!("../templates/bootstrap.sh");

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unbound template variable '{name}'")]
    UnboundVariable { name: String },

    #[error("Malformed template: unterminated '{{{{' at byte {offset}")]
    Malformed { offset: usize },
}

/// Substitute every placeholder in `template` from `bindings`
///
/// Whitespace inside the braces is ignored. Text outside placeholders is
/// copied through unchanged.
pub fn render(template: &str, bindings: &HashMap<String, String>) -> Result<Vec<u8>, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut consumed = 0;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open.find(CLOSE).ok_or(TemplateError::Malformed {
            offset: consumed + start,
        })?;

        let name = after_open[..end].trim();
        let value = bindings
            .get(name)
            .ok_or_else(|| TemplateError::UnboundVariable {
                name: name.to_string(),
            })?;
        out.push_str(value);

        let advance = start + OPEN.len() + end + CLOSE.len();
        consumed += advance;
        rest = &rest[advance..];
    }
    out.push_str(rest);

    Ok(out.into_bytes())
}

/// Names of all placeholders, in order of first appearance
pub fn variables(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names: Vec<String> = Vec::new();
    let mut rest = template;
    let mut consumed = 0;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open.find(CLOSE).ok_or(TemplateError::Malformed {
            offset: consumed + start,
        })?;
        let name = after_open[..end].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
        let advance = start + OPEN.len() + end + CLOSE.len();
        consumed += advance;
        rest = &rest[advance..];
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_bucket() {
        let out = render("Bucket={{bucket}}", &bindings(&[("bucket", "demo-1")])).unwrap();
        assert_eq!(out, b"Bucket=demo-1");
    }

    #[test]
    fn empty_bindings_report_unbound_variable() {
        let err = render("Bucket={{bucket}}", &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnboundVariable {
                name: "bucket".to_string()
            }
        );
    }

    #[test]
    fn inner_whitespace_is_ignored() {
        let out = render(
            "{{ region }}/{{region}}",
            &bindings(&[("region", "eu-central-1")]),
        )
        .unwrap();
        assert_eq!(out, b"eu-central-1/eu-central-1");
    }

    #[test]
    fn unterminated_placeholder_is_malformed() {
        let err = render("ok {{ bucket", &bindings(&[("bucket", "b")])).unwrap_err();
        assert_eq!(err, TemplateError::Malformed { offset: 3 });
    }

    #[test]
    fn shell_syntax_passes_through() {
        let template = "echo ${HOME} $(date) {{ prefix }}";
        let out = render(template, &bindings(&[("prefix", "pf1")])).unwrap();
        assert_eq!(out, b"echo ${HOME} $(date) pf1");
    }

    #[test]
    fn default_bootstrap_needs_three_variables() {
        assert_eq!(
            variables(DEFAULT_BOOTSTRAP).unwrap(),
            vec!["prefix", "bucket", "region"]
        );
        let out = render(
            DEFAULT_BOOTSTRAP,
            &bindings(&[("bucket", "pf1-0a1b2c3d"), ("region", "eu-central-1"), ("prefix", "pf1")]),
        )
        .unwrap();
        let script = String::from_utf8(out).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("s3://pf1-0a1b2c3d/markers/"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn default_bootstrap_matches_ubuntu_image() {
        assert!(DEFAULT_BOOTSTRAP.contains("apt-get install -y nginx awscli"));
        assert!(!DEFAULT_BOOTSTRAP.contains("dnf "));
        assert!(!DEFAULT_BOOTSTRAP.contains("yum "));
        assert!(DEFAULT_BOOTSTRAP.contains("/var/www/html/index.html"));
    }
}
