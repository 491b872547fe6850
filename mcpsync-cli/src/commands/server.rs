//! `mcpsync server list|add|remove`

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Deserialize;

use mcpsync_core::{ServerConfig, Transport};
use mcpsync_daemon::DaemonRequest;

use super::{parse_pairs, request};

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    /// List every server definition.
    List(ListArgs),

    /// Add a server definition.
    Add(AddArgs),

    /// Remove a server definition.
    Remove {
        /// Server name.
        name: String,
    },
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print the raw JSON returned by the daemon.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Server name (letters, digits, `-`, `_`).
    pub name: String,

    /// Command to launch a local (stdio) server.
    #[arg(long, conflicts_with = "url", required_unless_present = "url")]
    pub command: Option<String>,

    /// Argument passed to `--command`; repeat for several.
    #[arg(long = "arg", value_name = "ARG", requires = "command", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Environment variable for `--command`, as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE", requires = "command")]
    pub env: Vec<String>,

    /// URL of a remote (http) server.
    #[arg(long)]
    pub url: Option<String>,

    /// HTTP header for `--url`, as KEY=VALUE.
    #[arg(long = "header", value_name = "KEY=VALUE", requires = "url")]
    pub headers: Vec<String>,

    /// Only sync this server to the given destination; repeatable.
    #[arg(long = "only", value_name = "DESTINATION")]
    pub include: Vec<String>,

    /// Never sync this server to the given destination; repeatable.
    #[arg(long = "skip", value_name = "DESTINATION")]
    pub exclude: Vec<String>,

    /// Store the definition but leave it out of every sync.
    #[arg(long)]
    pub disabled: bool,
}

impl AddArgs {
    fn into_server(self) -> Result<(String, ServerConfig)> {
        let transport = match (self.command, self.url) {
            (Some(command), _) => Transport::Stdio {
                command,
                args: self.args,
                env: parse_pairs(&self.env).context("invalid --env")?,
            },
            (None, Some(url)) => Transport::Http {
                url,
                headers: parse_pairs(&self.headers).context("invalid --header")?,
            },
            (None, None) => anyhow::bail!("provide --command or --url"),
        };
        let mut server = ServerConfig::new(transport).with_source("cli");
        server.enabled = !self.disabled;
        server.include_destinations = self.include;
        server.exclude_destinations = self.exclude;
        Ok((self.name, server))
    }
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Deserialize)]
struct NameReply {
    name: String,
}

pub fn run(home: &Path, command: ServerCommand) -> Result<()> {
    match command {
        ServerCommand::List(args) => list(home, args),
        ServerCommand::Add(args) => {
            let (name, server) = args.into_server()?;
            let reply: NameReply = request(home, DaemonRequest::AddServer { name, server })?;
            println!("✓ added server '{}'", reply.name);
            Ok(())
        }
        ServerCommand::Remove { name } => {
            let reply: NameReply = request(home, DaemonRequest::RemoveServer { name })?;
            println!("✓ removed server '{}'", reply.name);
            Ok(())
        }
    }
}

fn list(home: &Path, args: ListArgs) -> Result<()> {
    let list: ServerList = request(home, DaemonRequest::ListServers)?;
    if args.json {
        return super::print_json(&list.servers);
    }
    if list.servers.is_empty() {
        println!("No servers defined.");
        println!("Run: mcpsync server add <name> --command <cmd>");
        return Ok(());
    }

    for (name, server) in &list.servers {
        let state = if server.enabled { "" } else { " (disabled)" };
        println!(
            "  {name:<24} {:<6} {}{state}",
            server.transport.kind(),
            server.transport.target()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(subcommand)]
        command: ServerCommand,
    }

    fn add(argv: &[&str]) -> Result<(String, ServerConfig), clap::Error> {
        let parsed = Harness::try_parse_from(std::iter::once("server").chain(argv.iter().copied()))?;
        match parsed.command {
            ServerCommand::Add(args) => Ok(args.into_server().unwrap()),
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn stdio_server_collects_args_and_env() {
        let (name, server) = add(&[
            "add", "files", "--command", "npx", "--arg", "-y", "--arg", "server-files",
            "--env", "ROOT=/tmp", "--skip", "legacy",
        ])
        .unwrap();

        assert_eq!(name, "files");
        let Transport::Stdio { command, args, env } = &server.transport else {
            panic!("expected stdio transport");
        };
        assert_eq!(command, "npx");
        assert_eq!(args, &["-y", "server-files"]);
        assert_eq!(env["ROOT"], "/tmp");
        assert_eq!(server.exclude_destinations, vec!["legacy".to_string()]);
        assert!(server.enabled);
    }

    #[test]
    fn http_server_takes_headers() {
        let (_, server) = add(&[
            "add", "search", "--url", "https://mcp.example.com", "--header", "Authorization=Bearer x",
            "--disabled",
        ])
        .unwrap();
        let Transport::Http { url, headers } = &server.transport else {
            panic!("expected http transport");
        };
        assert_eq!(url, "https://mcp.example.com");
        assert_eq!(headers["Authorization"], "Bearer x");
        assert!(!server.enabled);
    }

    #[test]
    fn command_and_url_are_exclusive() {
        assert!(add(&["add", "x", "--command", "a", "--url", "http://b"]).is_err());
        assert!(add(&["add", "x"]).is_err());
    }
}
