//! Subcommand implementations and the helpers they share.

pub mod autosync;
pub mod daemon;
pub mod destination;
pub mod server;
pub mod sync;

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use mcpsync_daemon::{paths, ClientError, DaemonClient, DaemonRequest, RetryPolicy, RetryingClient};

pub fn resolve_home(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(home) => Ok(home),
        None => paths::resolve_home()
            .context("could not determine home directory; pass --home or set MCPSYNC_HOME"),
    }
}

/// Drive one future to completion on a single-threaded runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

pub fn client(home: &Path) -> Result<DaemonClient> {
    DaemonClient::for_home(home).context("failed to load daemon config")
}

/// Send `request` to the daemon, retrying transient failures, and decode the
/// reply.
pub fn request<T: DeserializeOwned>(home: &Path, request: DaemonRequest) -> Result<T> {
    let client = RetryingClient::new(client(home)?, RetryPolicy::default());
    let value = block_on(client.call(&request))?
        .map_err(|err| explain(err, client.client()))
        .with_context(|| format!("{} failed", request.name()))?;
    serde_json::from_value(value)
        .with_context(|| format!("unexpected {} response from daemon", request.name()))
}

/// Turn "cannot connect" into a hint to start the daemon.
pub fn explain(err: ClientError, client: &DaemonClient) -> anyhow::Error {
    match err {
        ClientError::Unavailable { .. } => anyhow!(err).context(format!(
            "daemon is not running at {}; start it with `mcpsync daemon start`",
            client.addr()
        )),
        other => anyhow!(other),
    }
}

pub fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}

/// Parse repeated `KEY=VALUE` arguments.
pub fn parse_pairs(pairs: &[String]) -> Result<std::collections::BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("expected KEY=VALUE, got '{pair}'"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("empty key in '{pair}'"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_split_on_the_first_equals_sign() {
        let parsed = parse_pairs(&["TOKEN=a=b".into(), " MODE =fast".into()]).unwrap();
        assert_eq!(parsed["TOKEN"], "a=b");
        assert_eq!(parsed["MODE"], "fast");
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_pairs(&["novalue".into()]).is_err());
        assert!(parse_pairs(&["=x".into()]).is_err());
    }

    #[test]
    fn explicit_home_wins() {
        let home = resolve_home(Some(PathBuf::from("/srv/mcp"))).unwrap();
        assert_eq!(home, PathBuf::from("/srv/mcp"));
    }
}
