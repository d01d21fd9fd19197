//! Minimal URI templates for resource registration.
//!
//! Supports the two expressions resource URIs need in practice:
//!
//! - `{name}` matches one path segment (no `/`)
//! - `{+name}` matches the rest, slashes included
//!
//! Templates are compiled to an anchored regex once, at registration.

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::RegistryError;

/// A compiled URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    source: String,
    pattern: Regex,
    variables: Vec<String>,
}

impl UriTemplate {
    /// Returns true if `uri` contains a `{...}` expression.
    #[must_use]
    pub fn is_template(uri: &str) -> bool {
        uri.contains('{')
    }

    /// Compiles a template.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidUriTemplate`] for unbalanced braces,
    /// empty or non-identifier variable names, or repeated variables.
    pub fn compile(template: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidUriTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut pattern = String::from("^");
        let mut variables = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let (literal, tail) = rest.split_at(open);
            if literal.contains('}') {
                return Err(invalid("unexpected '}'"));
            }
            pattern.push_str(&regex::escape(literal));

            let close = tail.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
            let expr = &tail[1..close];
            let (reserved, name) = expr
                .strip_prefix('+')
                .map_or((false, expr), |name| (true, name));

            let valid_name = name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_name {
                return Err(invalid("variable names must be identifiers"));
            }
            if variables.iter().any(|v| v == name) {
                return Err(invalid("variable used twice"));
            }

            let class = if reserved { ".+" } else { "[^/]+" };
            pattern.push_str(&format!("(?P<{name}>{class})"));
            variables.push(name.to_string());
            rest = &tail[close + 1..];
        }

        if rest.contains('}') {
            return Err(invalid("unexpected '}'"));
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let pattern = Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            source: template.to_string(),
            pattern,
            variables,
        })
    }

    /// The template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Variable names in order of appearance.
    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Matches a concrete URI, returning the captured variables.
    #[must_use]
    pub fn matches(&self, uri: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.pattern.captures(uri)?;
        Some(
            self.variables
                .iter()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_variable_matches_one_segment() {
        let template = UriTemplate::compile("greeting://{name}").unwrap();
        let vars = template.matches("greeting://ada").unwrap();
        assert_eq!(vars["name"], "ada");
        assert!(template.matches("greeting://ada/lovelace").is_none());
    }

    #[test]
    fn reserved_variable_spans_slashes() {
        let template = UriTemplate::compile("file:///{+path}").unwrap();
        let vars = template.matches("file:///etc/hosts").unwrap();
        assert_eq!(vars["path"], "etc/hosts");
    }

    #[test]
    fn literal_parts_are_escaped() {
        let template = UriTemplate::compile("db://{table}.rows?limit=10").unwrap();
        assert!(template.matches("db://users.rows?limit=10").is_some());
        assert!(template.matches("db://usersXrows?limit=10").is_none());
    }

    #[test]
    fn multiple_variables() {
        let template = UriTemplate::compile("repo://{owner}/{name}/readme").unwrap();
        assert_eq!(template.variables(), ["owner", "name"]);
        let vars = template.matches("repo://rust-lang/rust/readme").unwrap();
        assert_eq!(vars["owner"], "rust-lang");
        assert_eq!(vars["name"], "rust");
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(UriTemplate::compile("x://{").is_err());
        assert!(UriTemplate::compile("x://}").is_err());
        assert!(UriTemplate::compile("x://{}").is_err());
        assert!(UriTemplate::compile("x://{1abc}").is_err());
        assert!(UriTemplate::compile("x://{a}/{a}").is_err());
    }
}
