//! snailwire - evaluate code in a running interpreter from the command line.
//!
//! Reads one expression per line from stdin, evaluates it in the root
//! namespace and prints the result. Lines starting with `:` are commands:
//!
//! - `:names base` / `:names core` - fetch (once) and count a name list
//! - `:quit` - tear down the session and exit

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snailwire::{
    ContextId, Hooks, NameSlot, NamespacePath, Outcome, Payload, ReplSession, SessionConfig,
    SessionError, SessionManager, SyncReply,
};

const USAGE: &str = "Usage: snailwire [--host HOST] [--port PORT] [--config FILE] [--json]";

#[derive(Debug, Default, PartialEq)]
struct Args {
    host: Option<String>,
    port: Option<u16>,
    config: Option<PathBuf>,
    json: bool,
    help: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--host" => parsed.host = Some(args.next().context("--host needs a value")?),
            "--port" => {
                let port = args.next().context("--port needs a value")?;
                parsed.port = Some(port.parse().with_context(|| format!("Invalid port {port}"))?);
            }
            "--config" => {
                parsed.config = Some(args.next().context("--config needs a value")?.into())
            }
            "--json" => parsed.json = true,
            "-h" | "--help" => parsed.help = true,
            other => bail!("Unknown argument {other}\n{USAGE}"),
        }
    }
    Ok(parsed)
}

fn render_reply(reply: &SyncReply, json: bool) -> Result<String> {
    let text = match (reply, json) {
        (SyncReply::Resolved(Outcome::Success(Payload::Value(value))), true) => {
            serde_json::to_string(value)?
        }
        (SyncReply::Resolved(Outcome::Success(Payload::Value(value))), false) => value.to_string(),
        (SyncReply::Resolved(Outcome::Success(Payload::Nothing)), true) => "null".to_string(),
        (SyncReply::Resolved(Outcome::Success(Payload::Nothing)), false) => "nothing".to_string(),
        (SyncReply::Resolved(Outcome::Failure(failure)), true) => serde_json::json!({
            "error": failure.message,
            "stack": failure.stack,
        })
        .to_string(),
        (SyncReply::Resolved(Outcome::Failure(failure)), false) => {
            format!("ERROR: {}", failure.message)
        }
        (SyncReply::NoValue, true) => serde_json::json!({ "error": "no value" }).to_string(),
        (SyncReply::NoValue, false) => "(no value yet)".to_string(),
    };
    Ok(text)
}

async fn run_command(session: &ReplSession, command: &str) {
    let mut words = command.split_whitespace();
    match (words.next(), words.next()) {
        (Some(":names"), Some(slot)) => {
            let slot = match slot {
                "base" => NameSlot::Base,
                "core" => NameSlot::Core,
                other => {
                    eprintln!("Unknown name list {other}, expected base or core");
                    return;
                }
            };
            match session.names(slot).await {
                Ok(names) => println!("{} {slot} names", names.len()),
                Err(e) => eprintln!("Error: {e}"),
            }
        }
        _ => eprintln!("Unknown command {command}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "snailwire=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }

    let mut config = SessionConfig::load_or_default(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    tracing::info!("Starting snailwire v{}", env!("CARGO_PKG_VERSION"));

    let manager = SessionManager::new(config, Hooks::default());
    let context = ContextId::new("stdin");
    let session = manager
        .connect(&context)
        .await
        .context("Failed to connect to interpreter")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":quit" {
            break;
        }
        if line.starts_with(':') {
            run_command(&session, line).await;
            continue;
        }

        match session.eval_sync(&NamespacePath::Root, line).await {
            Ok(reply) => println!("{}", render_reply(&reply, args.json)?),
            Err(SessionError::Closed) => {
                manager.teardown_all().await;
                bail!("Interpreter closed the connection");
            }
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    manager.teardown_all().await;
    tracing::info!("snailwire exited cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use snailwire::{RemoteFailure, Sexp};

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(
            args(&["--host", "10.0.0.2", "--port", "4000", "--json"]).unwrap(),
            Args {
                host: Some("10.0.0.2".to_string()),
                port: Some(4000),
                json: true,
                ..Args::default()
            }
        );
        assert!(args(&["--port", "http"]).is_err());
        assert!(args(&["--host"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }

    #[test]
    fn test_render_reply() {
        let value = SyncReply::Resolved(Outcome::Success(Payload::Value(Sexp::List(vec![
            Sexp::Int(1),
            Sexp::string("two"),
        ]))));
        assert_eq!(render_reply(&value, false).unwrap(), "(1 \"two\")");
        assert_eq!(render_reply(&value, true).unwrap(), "[1,\"two\"]");

        let failure = SyncReply::Resolved(Outcome::Failure(RemoteFailure::new(
            "DomainError",
            vec!["sqrt".to_string()],
        )));
        assert_eq!(render_reply(&failure, false).unwrap(), "ERROR: DomainError");
        assert_eq!(
            render_reply(&failure, true).unwrap(),
            r#"{"error":"DomainError","stack":["sqrt"]}"#
        );
        assert_eq!(render_reply(&SyncReply::NoValue, false).unwrap(), "(no value yet)");
    }
}
