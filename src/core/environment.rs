//! Variable bindings and template interpolation.
//!
//! An [`Environment`] is built once per run and never changes afterwards.
//! Templates reference variables as `${NAME}`; `$${` produces a literal `${`
//! so shell parameter expansion stays available inside step commands.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::limits::is_sensitive_name;
use super::pipeline::VariableDecl;
use super::redact::Redactor;

/// A single named binding
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

impl Variable {
    /// A plain (non-secret) variable
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secret: false,
        }
    }

    /// A secret variable
    pub fn secret(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secret: true,
        }
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = if self.secret { "****" } else { self.value.as_str() };
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("value", &value)
            .field("secret", &self.secret)
            .finish()
    }
}

/// Environment errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("Undefined variable '{name}'")]
    UndefinedVariable { name: String },

    #[error("Variable '{name}' is defined more than once")]
    DuplicateVariable { name: String },

    #[error("Invalid variable name '{name}'")]
    InvalidName { name: String },
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\$\{|\$\{([^}]*)\}").expect("reference pattern is valid")
    })
}

/// Whether `name` is usable as a variable (and exported env var) name
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Immutable set of variables for one run
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, Variable>,
}

impl Environment {
    /// Build an environment, rejecting duplicate or malformed names
    pub fn new<I>(vars: I) -> Result<Self, EnvironmentError>
    where
        I: IntoIterator<Item = Variable>,
    {
        let mut map = BTreeMap::new();
        for var in vars {
            if !is_valid_name(&var.name) {
                return Err(EnvironmentError::InvalidName { name: var.name });
            }
            if map.contains_key(&var.name) {
                return Err(EnvironmentError::DuplicateVariable { name: var.name });
            }
            map.insert(var.name.clone(), var);
        }
        Ok(Self { vars: map })
    }

    /// Start a builder that understands pipeline declarations and overrides
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// Substitute every `${NAME}` in `template`
    pub fn resolve(&self, template: &str) -> Result<String, EnvironmentError> {
        let mut missing: Option<String> = None;

        let resolved = reference_regex().replace_all(template, |caps: &Captures| {
            let Some(name) = caps.get(1) else {
                return "${".to_string();
            };
            let name = name.as_str().trim();
            match self.vars.get(name) {
                Some(var) => var.value.clone(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(name) => Err(EnvironmentError::UndefinedVariable { name }),
            None => Ok(resolved.into_owned()),
        }
    }

    /// Names referenced by `template`, in order of first appearance
    pub fn references(template: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in reference_regex().captures_iter(template) {
            if let Some(name) = caps.get(1) {
                let name = name.as_str().trim().to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Check that every reference in `template` has a binding
    pub fn check(&self, template: &str) -> Result<(), EnvironmentError> {
        match Self::references(template)
            .into_iter()
            .find(|name| !self.vars.contains_key(name))
        {
            Some(name) => Err(EnvironmentError::UndefinedVariable { name }),
            None => Ok(()),
        }
    }

    /// Whether `name` is bound to a secret value
    pub fn is_secret(&self, name: &str) -> bool {
        self.vars.get(name).map(|v| v.secret).unwrap_or(false)
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when nothing is bound
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variables in name order
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    /// A fresh redactor masking every secret value
    pub fn redactor(&self) -> Redactor {
        Redactor::new(
            self.vars
                .values()
                .filter(|v| v.secret)
                .map(|v| v.value.as_str()),
        )
    }

    /// Name/value pairs exported into step subprocesses
    pub fn exports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .values()
            .map(|v| (v.name.as_str(), v.value.as_str()))
    }
}

/// Collects bindings from declarations, the host environment and overrides
#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    vars: BTreeMap<String, Variable>,
    sensitive_patterns: Vec<String>,
    invalid: Option<String>,
}

impl EnvironmentBuilder {
    /// Names matching any of these glob patterns become secret
    pub fn sensitive_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive_patterns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Add a pipeline declaration; `env` sources are read from the host now
    pub fn declare(self, name: &str, decl: &VariableDecl) -> Self {
        let (value, secret) = match decl {
            VariableDecl::Plain(value) => (Some(value.clone()), false),
            VariableDecl::Value { value, secret } => (Some(value.clone()), *secret),
            VariableDecl::FromEnv { env, secret } => (std::env::var(env).ok(), *secret),
        };

        match value {
            Some(value) => self.insert(Variable {
                name: name.to_string(),
                value,
                secret,
            }),
            None => {
                debug!(variable = %name, "Host environment source not set, leaving unbound");
                self
            }
        }
    }

    /// Add every declaration of a map
    pub fn declare_all<'a, I>(self, decls: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a VariableDecl)>,
    {
        decls
            .into_iter()
            .fold(self, |builder, (name, decl)| builder.declare(name, decl))
    }

    /// Bind (or override) a plain value
    pub fn value(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(Variable::new(name, value))
    }

    /// Bind (or override) a secret value
    pub fn secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(Variable::secret(name, value))
    }

    fn insert(mut self, var: Variable) -> Self {
        if !is_valid_name(&var.name) {
            self.invalid.get_or_insert_with(|| var.name.clone());
        }

        // An override never downgrades a secret binding
        let secret = var.secret
            || self
                .vars
                .get(&var.name)
                .map(|existing| existing.secret)
                .unwrap_or(false);
        self.vars.insert(var.name.clone(), Variable { secret, ..var });
        self
    }

    /// Finish, applying sensitive-name detection
    pub fn build(self) -> Result<Environment, EnvironmentError> {
        if let Some(name) = self.invalid {
            return Err(EnvironmentError::InvalidName { name });
        }

        let patterns = self.sensitive_patterns;
        Environment::new(self.vars.into_values().map(|mut var| {
            if !var.secret && is_sensitive_name(patterns.as_slice(), &var.name) {
                var.secret = true;
            }
            var
        }))
    }
}
