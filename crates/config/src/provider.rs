use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

/// Transport kinds a provider can declare.
///
/// The `kind` field in [`ProviderSpec`] stays a plain string so that one
/// provider with a typo'd kind fails at launch time without poisoning the
/// rest of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Stdio,
    Http,
    Sse,
    StreamableHttp,
}

impl ProviderKind {
    /// Parse the kind strings the config file accepts, including the
    /// legacy spellings.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Some(Self::Stdio),
            "http" => Some(Self::Http),
            "sse" => Some(Self::Sse),
            "streamable-http" | "streamablehttp" => Some(Self::StreamableHttp),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

/// One entry under `mcpServers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Transport kind; absent means stdio.
    #[serde(
        rename = "type",
        alias = "transportType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment for the child, overlaid on the host environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl ProviderSpec {
    pub fn kind(&self, name: &str) -> Result<ProviderKind, ConfigError> {
        let raw = self.kind.as_deref().unwrap_or("stdio");
        ProviderKind::parse(raw).ok_or_else(|| ConfigError::UnknownKind {
            name: name.to_string(),
            kind: raw.to_string(),
        })
    }
}

/// The whole provider config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "mcpServers", default)]
    pub providers: BTreeMap<String, ProviderSpec>,
}

impl ProviderConfig {
    /// Names of providers not marked disabled.
    #[must_use]
    pub fn enabled_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|(_, spec)| !spec.disabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.get(name)
    }
}

/// Load and parse the config file, expanding `${VAR}`/`$VAR` first.
///
/// A missing file yields an empty config. A file that fails to parse is an
/// error: the caller decides whether to keep the previous config.
pub fn load_config(path: &Path) -> Result<ProviderConfig, ConfigError> {
    if !path.exists() {
        return Ok(ProviderConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    let expanded = expand_env(&text, |name| std::env::var(name).ok());
    Ok(serde_json::from_str(&expanded)?)
}

/// The file's mtime, if it exists. Used by the reconciler's 10s poll.
#[must_use]
pub fn config_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// Expand `${VAR}` and `$VAR` references. Unset variables are left verbatim,
/// matching the behavior tooling around these config files expects.
pub fn expand_env(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some(&(_, '{')) => {
                let rest = &text[i + 2..];
                if let Some(end) = rest.find('}') {
                    let name = &rest[..end];
                    if is_var_name(name) {
                        if let Some(value) = lookup(name) {
                            out.push_str(&value);
                        } else {
                            out.push_str(&text[i..i + 2 + end + 1]);
                        }
                        // Skip "{NAME}".
                        for _ in 0..end + 2 {
                            chars.next();
                        }
                        continue;
                    }
                }
                out.push(c);
            }
            Some(&(_, n)) if n == '_' || n.is_ascii_alphabetic() => {
                let rest = &text[i + 1..];
                let len = rest
                    .char_indices()
                    .take_while(|(_, c)| *c == '_' || c.is_ascii_alphanumeric())
                    .count();
                let name = &rest[..len];
                if let Some(value) = lookup(name) {
                    out.push_str(&value);
                } else {
                    out.push(c);
                    out.push_str(name);
                }
                for _ in 0..len {
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }

    out
}

fn is_var_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && s.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}
