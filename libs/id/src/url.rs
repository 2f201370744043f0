//! Validated node endpoint URLs.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

/// Endpoint of a worker node, `scheme://host[:port]/name`.
///
/// A node URL is the identity of a node inside a node source, so it is
/// validated once on the way in and compared as an exact string afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeUrl(String);

impl NodeUrl {
    /// Parses and validates a node URL.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let invalid = |reason| IdError::InvalidUrl {
            url: s.to_string(),
            reason,
        };

        if s.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let Some((scheme, rest)) = s.split_once("://") else {
            return Err(invalid("missing '://' separator"));
        };

        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(invalid("invalid scheme"));
        }

        let authority = rest.split('/').next().unwrap_or_default();
        let host = match authority.rsplit_once(':') {
            Some((host, port)) => {
                if port.parse::<u16>().is_err() {
                    return Err(invalid("invalid port"));
                }
                host
            }
            None => authority,
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the URL as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the scheme, e.g. `tcp` in `tcp://host:1099/node1`.
    pub fn scheme(&self) -> &str {
        self.0.split_once("://").map(|(s, _)| s).unwrap_or_default()
    }

    fn authority(&self) -> &str {
        self.0
            .split_once("://")
            .and_then(|(_, rest)| rest.split('/').next())
            .unwrap_or_default()
    }

    /// Returns the host part.
    pub fn host(&self) -> &str {
        let authority = self.authority();
        match authority.rsplit_once(':') {
            Some((host, _)) => host,
            None => authority,
        }
    }

    /// Returns the port, if one is present.
    pub fn port(&self) -> Option<u16> {
        self.authority()
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }

    /// Returns the path after the authority (the node name), if any.
    pub fn name(&self) -> Option<&str> {
        self.0
            .split_once("://")
            .and_then(|(_, rest)| rest.split_once('/'))
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeUrl {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for NodeUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NodeUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
