//! Declared configuration parameters of pluggable components.
//!
//! A component lists its parameters as plain data ([`Configurable`]); the
//! same list drives validation of `name=value` pairs and the CLI help text.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),

    #[error("parameter '{0}' given more than once")]
    Duplicate(String),

    #[error("missing required parameter '{0}'")]
    Missing(String),

    #[error("expected name=value, got '{0}'")]
    Malformed(String),

    #[error("parameter '{name}' expects {kind}: {reason}")]
    Invalid {
        name: String,
        kind: ParamKind,
        reason: String,
    },

    #[error("parameter '{name}': file {} does not exist", path.display())]
    FileNotFound { name: String, path: PathBuf },

    #[error("parameter '{name}' is not a {expected}")]
    WrongKind { name: String, expected: ParamKind },
}

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    /// Milliseconds.
    Duration,
    Path,
    /// Comma separated strings.
    List,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Duration => "duration (ms)",
            ParamKind::Path => "path",
            ParamKind::List => "list",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParamFlags {
    pub required: bool,
    /// Never printed back.
    pub secret: bool,
    /// A path that must exist.
    pub file: bool,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<String>,
    pub description: String,
    pub flags: ParamFlags,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            description: description.into(),
            flags: ParamFlags::default(),
        }
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.flags.required = true;
        self
    }

    pub fn secret(mut self) -> Self {
        self.flags.secret = true;
        self
    }

    pub fn file(mut self) -> Self {
        self.flags.file = true;
        self
    }

    fn parse_value(&self, raw: &str) -> Result<ParamValue, ParamError> {
        let invalid = |reason: String| ParamError::Invalid {
            name: self.name.clone(),
            kind: self.kind,
            reason,
        };

        let value = match self.kind {
            ParamKind::String => ParamValue::String(raw.to_string()),
            ParamKind::Integer => {
                ParamValue::Integer(raw.trim().parse().map_err(|e| invalid(format!("{e}")))?)
            }
            ParamKind::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => ParamValue::Boolean(true),
                "false" | "no" | "0" => ParamValue::Boolean(false),
                other => return Err(invalid(format!("'{other}' is not a boolean"))),
            },
            ParamKind::Duration => {
                let ms: u64 = raw.trim().parse().map_err(|e| invalid(format!("{e}")))?;
                ParamValue::Duration(Duration::from_millis(ms))
            }
            ParamKind::Path => {
                if raw.is_empty() {
                    return Err(invalid("empty path".to_string()));
                }
                ParamValue::Path(PathBuf::from(raw))
            }
            ParamKind::List => ParamValue::List(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        };

        if self.flags.file {
            if let ParamValue::Path(path) = &value {
                if !path.exists() {
                    return Err(ParamError::FileNotFound {
                        name: self.name.clone(),
                        path: path.clone(),
                    });
                }
            }
        }

        Ok(value)
    }
}

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Duration(Duration),
    Path(PathBuf),
    List(Vec<String>),
}

/// Components that declare their parameters.
pub trait Configurable {
    fn parameters() -> Vec<ParamDescriptor>;
}

/// Validated parameter values.
#[derive(Clone, PartialEq, Eq)]
pub struct ParamValues {
    values: BTreeMap<String, ParamValue>,
    secrets: BTreeSet<String>,
}

impl ParamValues {
    /// Validates `pairs` against `descriptors` and fills in defaults.
    pub fn parse<I, K, V>(descriptors: &[ParamDescriptor], pairs: I) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut given: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in pairs {
            let name = name.into();
            if !descriptors.iter().any(|d| d.name == name) {
                return Err(ParamError::Unknown(name));
            }
            if given.insert(name.clone(), value.into()).is_some() {
                return Err(ParamError::Duplicate(name));
            }
        }

        let mut values = BTreeMap::new();
        let mut secrets = BTreeSet::new();
        for descriptor in descriptors {
            let raw = given.get(&descriptor.name).or(descriptor.default.as_ref());
            let Some(raw) = raw else {
                if descriptor.flags.required {
                    return Err(ParamError::Missing(descriptor.name.clone()));
                }
                continue;
            };
            values.insert(descriptor.name.clone(), descriptor.parse_value(raw)?);
            if descriptor.flags.secret {
                secrets.insert(descriptor.name.clone());
            }
        }

        Ok(Self { values, secrets })
    }

    /// Like [`parse`](Self::parse), for `name=value` arguments.
    pub fn parse_args<S: AsRef<str>>(
        descriptors: &[ParamDescriptor],
        args: &[S],
    ) -> Result<Self, ParamError> {
        let pairs = args
            .iter()
            .map(|arg| {
                let arg = arg.as_ref();
                arg.split_once('=')
                    .filter(|(name, _)| !name.is_empty())
                    .map(|(name, value)| (name.trim().to_string(), value.to_string()))
                    .ok_or_else(|| ParamError::Malformed(arg.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::parse(descriptors, pairs)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    fn typed<'a, T>(
        &'a self,
        name: &str,
        expected: ParamKind,
        pick: impl FnOnce(&'a ParamValue) -> Option<T>,
    ) -> Result<Option<T>, ParamError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(value) => pick(value).map(Some).ok_or(ParamError::WrongKind {
                name: name.to_string(),
                expected,
            }),
        }
    }

    pub fn string(&self, name: &str) -> Result<Option<&str>, ParamError> {
        self.typed(name, ParamKind::String, |v| match v {
            ParamValue::String(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn integer(&self, name: &str) -> Result<Option<i64>, ParamError> {
        self.typed(name, ParamKind::Integer, |v| match v {
            ParamValue::Integer(i) => Some(*i),
            _ => None,
        })
    }

    pub fn boolean(&self, name: &str) -> Result<Option<bool>, ParamError> {
        self.typed(name, ParamKind::Boolean, |v| match v {
            ParamValue::Boolean(b) => Some(*b),
            _ => None,
        })
    }

    pub fn duration(&self, name: &str) -> Result<Option<Duration>, ParamError> {
        self.typed(name, ParamKind::Duration, |v| match v {
            ParamValue::Duration(d) => Some(*d),
            _ => None,
        })
    }

    pub fn path(&self, name: &str) -> Result<Option<&PathBuf>, ParamError> {
        self.typed(name, ParamKind::Path, |v| match v {
            ParamValue::Path(p) => Some(p),
            _ => None,
        })
    }

    pub fn list(&self, name: &str) -> Result<Option<&[String]>, ParamError> {
        self.typed(name, ParamKind::List, |v| match v {
            ParamValue::List(l) => Some(l.as_slice()),
            _ => None,
        })
    }
}

impl fmt::Debug for ParamValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.values {
            if self.secrets.contains(name) {
                map.entry(name, &"***");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

/// Renders `--name <kind>  description` lines for a parameter list.
pub fn render_cli_help(descriptors: &[ParamDescriptor]) -> String {
    let heads: Vec<String> = descriptors
        .iter()
        .map(|d| format!("--{} <{}>", d.name, d.kind))
        .collect();
    let width = heads.iter().map(String::len).max().unwrap_or(0);

    let mut out = String::new();
    for (descriptor, head) in descriptors.iter().zip(&heads) {
        let mut notes = Vec::new();
        if descriptor.flags.required {
            notes.push("required".to_string());
        }
        if let Some(default) = &descriptor.default {
            if descriptor.flags.secret {
                notes.push("default: ***".to_string());
            } else {
                notes.push(format!("default: {default}"));
            }
        }
        if descriptor.flags.file {
            notes.push("must exist".to_string());
        }

        out.push_str(&format!("  {head:<width$}  {}", descriptor.description));
        if !notes.is_empty() {
            out.push_str(&format!(" [{}]", notes.join(", ")));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor::new("hosts", ParamKind::List, "Hosts to use").required(),
            ParamDescriptor::new("attempts", ParamKind::Integer, "Launch attempts").default_value("3"),
            ParamDescriptor::new("timeout", ParamKind::Duration, "Launch timeout"),
            ParamDescriptor::new("password", ParamKind::String, "Login password").secret(),
        ]
    }

    #[test]
    fn test_defaults_and_types() {
        let values = ParamValues::parse_args(&schema(), &["hosts=a, b,,c", "timeout=1500"]).unwrap();
        assert_eq!(
            values.list("hosts").unwrap().unwrap(),
            &["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(values.integer("attempts").unwrap(), Some(3));
        assert_eq!(values.duration("timeout").unwrap(), Some(Duration::from_millis(1500)));
        assert_eq!(values.string("password").unwrap(), None);
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(
            ParamValues::parse_args(&schema(), &["attempts=2"]).unwrap_err(),
            ParamError::Missing("hosts".to_string())
        );
        assert_eq!(
            ParamValues::parse_args(&schema(), &["hosts=a", "colour=red"]).unwrap_err(),
            ParamError::Unknown("colour".to_string())
        );
        assert_eq!(
            ParamValues::parse_args(&schema(), &["hosts=a", "hosts=b"]).unwrap_err(),
            ParamError::Duplicate("hosts".to_string())
        );
        assert_eq!(
            ParamValues::parse_args(&schema(), &["hosts"]).unwrap_err(),
            ParamError::Malformed("hosts".to_string())
        );
        assert!(matches!(
            ParamValues::parse_args(&schema(), &["hosts=a", "attempts=many"]).unwrap_err(),
            ParamError::Invalid { kind: ParamKind::Integer, .. }
        ));
    }

    #[test]
    fn test_wrong_kind_lookup() {
        let values = ParamValues::parse_args(&schema(), &["hosts=a"]).unwrap();
        assert!(matches!(
            values.boolean("attempts").unwrap_err(),
            ParamError::WrongKind { .. }
        ));
    }

    #[test]
    fn test_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("hosts.txt");
        std::fs::write(&present, "a\n").unwrap();
        let schema = vec![ParamDescriptor::new("file", ParamKind::Path, "Hosts file").file()];

        let ok = ParamValues::parse(&schema, [("file", present.to_string_lossy().to_string())]);
        assert!(ok.is_ok());

        let missing = dir.path().join("missing.txt");
        let err = ParamValues::parse(&schema, [("file", missing.to_string_lossy().to_string())])
            .unwrap_err();
        assert!(matches!(err, ParamError::FileNotFound { .. }));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let values = ParamValues::parse_args(&schema(), &["hosts=a", "password=hunter2"]).unwrap();
        let printed = format!("{values:?}");
        assert!(printed.contains("***"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_help_lists_every_parameter() {
        let help = render_cli_help(&schema());
        assert_eq!(help.lines().count(), 4);
        assert!(help.contains("--hosts <list>"));
        assert!(help.contains("[required]"));
        assert!(help.contains("[default: 3]"));
    }
}
