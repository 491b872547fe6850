//! Pluggable hooks run by the config store before any mutation.

use crate::types::{ServerConfig, ServerName, Transport};

/// Rejects a server record before it reaches the store.
pub trait ServerValidator: Send + Sync {
    fn validate(&self, name: &ServerName, server: &ServerConfig) -> Result<(), String>;
}

/// Normalises a caller-supplied server name.
pub trait NameSanitizer: Send + Sync {
    fn sanitize(&self, raw: &str) -> String;
}

/// Structural checks every record must pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicValidator;

impl ServerValidator for BasicValidator {
    fn validate(&self, name: &ServerName, server: &ServerConfig) -> Result<(), String> {
        if name.as_str().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if name.as_str().chars().any(char::is_whitespace) {
            return Err("name must not contain whitespace".to_string());
        }
        match &server.transport {
            Transport::Stdio { command, .. } if command.trim().is_empty() => {
                Err("stdio transport requires a command".to_string())
            }
            Transport::Http { url, .. } if url.trim().is_empty() => {
                Err("http transport requires a url".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrimSanitizer;

impl NameSanitizer for TrimSanitizer {
    fn sanitize(&self, raw: &str) -> String {
        raw.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("github", Transport::stdio("npx"), true)]
    #[case("", Transport::stdio("npx"), false)]
    #[case("two words", Transport::stdio("npx"), false)]
    #[case("github", Transport::stdio("  "), false)]
    #[case("remote", Transport::http(""), false)]
    #[case("remote", Transport::http("https://example.test"), true)]
    fn basic_validator_cases(#[case] name: &str, #[case] transport: Transport, #[case] ok: bool) {
        let result = BasicValidator.validate(&ServerName::from(name), &ServerConfig::new(transport));
        assert_eq!(result.is_ok(), ok, "{name}: {result:?}");
    }

    #[test]
    fn trim_sanitizer_strips_whitespace() {
        assert_eq!(TrimSanitizer.sanitize("  github \n"), "github");
    }
}
