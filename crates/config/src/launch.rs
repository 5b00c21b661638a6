use crate::{ConfigError, ProviderKind, ProviderSpec};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// A resolved command line + environment overlay for one provider child.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Overlaid on the host environment at spawn time.
    pub env: BTreeMap<String, String>,
}

impl LaunchPlan {
    /// Build the plan for a provider spec.
    ///
    /// stdio providers run their configured command directly. HTTP-family
    /// providers run the external stdio↔HTTP proxy adapter (`proxy_bin`),
    /// which speaks MCP over stdio on our side and the named transport on
    /// the other.
    ///
    /// # Errors
    ///
    /// Disabled providers, unknown kinds, and missing required fields are
    /// all launch-time errors so that one bad spec disables only its own
    /// bridge.
    pub fn build(name: &str, spec: &ProviderSpec, proxy_bin: &str) -> Result<Self, ConfigError> {
        if spec.disabled {
            return Err(ConfigError::Disabled(name.to_string()));
        }

        let kind = spec.kind(name)?;
        let env = spec.env.clone();

        match kind {
            ProviderKind::Stdio => {
                let command = spec.command.clone().ok_or(ConfigError::MissingField {
                    name: name.to_string(),
                    kind: kind.as_str().to_string(),
                    field: "command",
                })?;
                Ok(Self {
                    program: command,
                    args: spec.args.clone(),
                    env,
                })
            }
            ProviderKind::Http | ProviderKind::Sse | ProviderKind::StreamableHttp => {
                let url = spec.url.clone().ok_or(ConfigError::MissingField {
                    name: name.to_string(),
                    kind: kind.as_str().to_string(),
                    field: "url",
                })?;

                let mut args = vec!["--transport".to_string(), kind.as_str().to_string()];
                for (header, value) in &spec.headers {
                    args.push("-H".to_string());
                    args.push(header.clone());
                    args.push(value.clone());
                }
                args.push(url);

                Ok(Self {
                    program: proxy_bin.to_string(),
                    args,
                    env,
                })
            }
        }
    }
}

/// Spawn the child with piped stdio.
///
/// On unix the child becomes its own process-group leader so terminating it
/// reaps its whole tree, not only the direct child. `kill_on_drop` is set so
/// an aborted supervisor task cannot leak the process past its owner.
pub fn spawn_provider(plan: &LaunchPlan) -> std::io::Result<Child> {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .envs(&plan.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_spec() -> ProviderSpec {
        ProviderSpec {
            command: Some("echo-server".to_string()),
            args: vec!["--verbose".to_string()],
            ..ProviderSpec::default()
        }
    }

    #[test]
    fn stdio_plan_uses_command_and_args() {
        let plan = LaunchPlan::build("p1", &stdio_spec(), "mcp-proxy").expect("plan");
        assert_eq!(plan.program, "echo-server");
        assert_eq!(plan.args, vec!["--verbose".to_string()]);
    }

    #[test]
    fn http_plan_routes_through_proxy_with_headers() {
        let spec = ProviderSpec {
            kind: Some("streamablehttp".to_string()),
            url: Some("https://api.example/mcp".to_string()),
            headers: BTreeMap::from([(
                "Authorization".to_string(),
                "Bearer xyz".to_string(),
            )]),
            ..ProviderSpec::default()
        };
        let plan = LaunchPlan::build("api", &spec, "/usr/bin/mcp-proxy").expect("plan");
        assert_eq!(plan.program, "/usr/bin/mcp-proxy");
        assert_eq!(
            plan.args,
            vec![
                "--transport".to_string(),
                "streamable-http".to_string(),
                "-H".to_string(),
                "Authorization".to_string(),
                "Bearer xyz".to_string(),
                "https://api.example/mcp".to_string(),
            ]
        );
    }

    #[test]
    fn disabled_provider_is_a_distinct_error() {
        let spec = ProviderSpec {
            disabled: true,
            ..stdio_spec()
        };
        assert!(matches!(
            LaunchPlan::build("p1", &spec, "mcp-proxy"),
            Err(ConfigError::Disabled(_))
        ));
    }

    #[test]
    fn missing_fields_and_unknown_kinds_fail_at_launch() {
        let no_command = ProviderSpec::default();
        assert!(matches!(
            LaunchPlan::build("p1", &no_command, "mcp-proxy"),
            Err(ConfigError::MissingField { field: "command", .. })
        ));

        let no_url = ProviderSpec {
            kind: Some("sse".to_string()),
            ..ProviderSpec::default()
        };
        assert!(matches!(
            LaunchPlan::build("p1", &no_url, "mcp-proxy"),
            Err(ConfigError::MissingField { field: "url", .. })
        ));

        let bad_kind = ProviderSpec {
            kind: Some("carrier-pigeon".to_string()),
            command: Some("x".to_string()),
            ..ProviderSpec::default()
        };
        assert!(matches!(
            LaunchPlan::build("p1", &bad_kind, "mcp-proxy"),
            Err(ConfigError::UnknownKind { .. })
        ));
    }
}
