//! Environment variable parsing
//!
//! A nested parser for namespaced environment variables. The application
//! owns a root parser (prefix `LIMAR_`); each module gets a scoped subparser
//! (`LIMAR_<MODULE>_`) during environment configuration and declares the
//! variables it supports. Variable names are upper-cased with `-` mapped to
//! `_`. Required variables fail the parse with a diagnostic; optional
//! variables either carry an explicit default or are simply absent.

use crate::errors::{LimarError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct VarSpec {
    full_name: String,
    /// `None` = required; `Some(None)` = optional without a default value;
    /// `Some(Some(v))` = optional with default `v`
    default: Option<Option<String>>,
}

#[derive(Debug, Default)]
pub struct EnvParser {
    prefix: String,
    spec: Vec<VarSpec>,
    subparsers: Vec<EnvParser>,
}

impl EnvParser {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{}_", in_env_case(prefix))
            },
            spec: Vec::new(),
            subparsers: Vec::new(),
        }
    }

    /// Add a nested parser whose prefix extends this parser's prefix
    pub fn add_scope(&mut self, prefix: &str) -> &mut EnvParser {
        let scoped = EnvParser {
            prefix: format!("{}{}_", self.prefix, in_env_case(prefix)),
            spec: Vec::new(),
            subparsers: Vec::new(),
        };
        self.subparsers.push(scoped);
        self.subparsers
            .last_mut()
            .expect("subparser was just pushed")
    }

    /// Declare a required variable
    pub fn add_variable(&mut self, name: &str) -> Result<()> {
        self.add_spec(name, None)
    }

    /// Declare an optional variable with a default value
    pub fn add_variable_with_default(&mut self, name: &str, default: &str) -> Result<()> {
        self.add_spec(name, Some(Some(default.to_string())))
    }

    /// Declare an optional variable with no default (absent when unset)
    pub fn add_optional_variable(&mut self, name: &str) -> Result<()> {
        self.add_spec(name, Some(None))
    }

    fn add_spec(&mut self, name: &str, default: Option<Option<String>>) -> Result<()> {
        let full_name = format!("{}{}", self.prefix, in_env_case(name));
        if self.spec.iter().any(|s| s.full_name == full_name) {
            return Err(LimarError::config(format!(
                "Environment variable '{full_name}' is already configured"
            )));
        }

        self.spec.push(VarSpec { full_name, default });
        Ok(())
    }

    /// Parse the given environment, or the process environment if `None`
    pub fn parse(&self, env: Option<&HashMap<String, String>>) -> Result<Env> {
        let process_env: HashMap<String, String>;
        let env = match env {
            Some(env) => env,
            None => {
                process_env = std::env::vars().collect();
                &process_env
            }
        };

        let mut vars = HashMap::new();
        self.parse_into(env, &mut vars)?;
        Ok(Env { vars })
    }

    fn parse_into(
        &self,
        env: &HashMap<String, String>,
        out: &mut HashMap<String, String>,
    ) -> Result<()> {
        for spec in &self.spec {
            match (env.get(&spec.full_name), &spec.default) {
                (Some(value), _) => {
                    out.insert(spec.full_name.clone(), value.clone());
                }
                (None, Some(Some(default))) => {
                    out.insert(spec.full_name.clone(), default.clone());
                }
                (None, Some(None)) => {}
                (None, None) => {
                    return Err(LimarError::config(format!(
                        "Required environment variable '{}' not set",
                        spec.full_name
                    )));
                }
            }
        }

        for subparser in &self.subparsers {
            subparser.parse_into(env, out)?;
        }
        Ok(())
    }
}

/// The parsed environment, keyed by full variable name
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    pub fn get(&self, full_name: &str) -> Option<&str> {
        self.vars.get(full_name).map(String::as_str)
    }

    pub fn require(&self, full_name: &str) -> Result<&str> {
        self.get(full_name).ok_or_else(|| {
            LimarError::config(format!(
                "Required environment variable '{full_name}' not set"
            ))
        })
    }
}

fn in_env_case(name: &str) -> String {
    name.replace('-', "_").to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_scoped_names_and_env_case() -> anyhow::Result<()> {
        let mut parser = EnvParser::new("limar");
        parser.add_scope("command-manifest").add_variable("path")?;

        let parsed = parser.parse(Some(&env(&[(
            "LIMAR_COMMAND_MANIFEST_PATH",
            "/tmp/manifest",
        )])))?;
        assert_eq!(
            parsed.get("LIMAR_COMMAND_MANIFEST_PATH"),
            Some("/tmp/manifest")
        );
        Ok(())
    }

    #[test]
    fn test_required_variable_missing_fails() -> anyhow::Result<()> {
        let mut parser = EnvParser::new("limar");
        parser.add_scope("cache").add_variable("root")?;

        let err = parser.parse(Some(&env(&[]))).unwrap_err();
        assert!(err.to_string().contains("LIMAR_CACHE_ROOT"));
        Ok(())
    }

    #[test]
    fn test_default_and_optional_variables() -> anyhow::Result<()> {
        let mut parser = EnvParser::new("limar");
        let scope = parser.add_scope("log");
        scope.add_variable_with_default("verbosity", "0")?;
        scope.add_optional_variable("file")?;

        let parsed = parser.parse(Some(&env(&[])))?;
        assert_eq!(parsed.get("LIMAR_LOG_VERBOSITY"), Some("0"));
        assert_eq!(parsed.get("LIMAR_LOG_FILE"), None);
        assert!(parsed.require("LIMAR_LOG_FILE").is_err());
        Ok(())
    }

    #[test]
    fn test_duplicate_declaration_fails() -> anyhow::Result<()> {
        let mut parser = EnvParser::new("limar");
        parser.add_variable("path")?;
        assert!(parser.add_variable("path").is_err());
        Ok(())
    }
}
