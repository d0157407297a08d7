use std::path::PathBuf;

use armory::services::pruner::spawn_prune_task;
use armory::{BackendKind, BindingError, Bindings, ConfigError, Store, StoreConfig, StorageError};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open store: {0}")]
    Open(#[from] StorageError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("invalid JSON argument {index}: {source}")]
    InvalidJson {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to render result: {0}")]
    Render(#[source] serde_json::Error),
    #[error("failed to read stdin: {0}")]
    Stdin(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] armory::StoreError),
}

#[derive(Parser, Debug)]
#[command(name = "armory-cli", about = "Military asset store console")]
struct Cli {
    /// Storage backend: memory, file or postgres.
    #[arg(long, env = "ARMORY_STORAGE")]
    storage: Option<BackendKind>,

    #[arg(long, env = "ARMORY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every bound function name.
    Functions,
    /// Invoke one function with JSON arguments and print the result.
    Call {
        name: String,
        #[arg(help = "Positional JSON arguments, e.g. 1 '{\"available\":5}'")]
        args: Vec<String>,
    },
    /// Read `name json-arg...` lines from stdin and print each result.
    Console,
    /// Run one notification expiry pass and print the remaining count.
    Prune,
    /// List every key the backend holds.
    Keys,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = store_config(&cli)?;
    let store = Store::from_config(config).await?;
    let bindings = Bindings::new(store);

    match cli.command {
        Command::Functions => {
            for name in bindings.names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Call { name, args } => run_call(&bindings, &name, &args).await,
        Command::Console => run_console(&bindings).await,
        Command::Prune => {
            let remaining = bindings.store().notifications.prune().await?;
            println!("{remaining}");
            Ok(())
        }
        Command::Keys => {
            for key in bindings.store().stored_keys().await? {
                println!("{key}");
            }
            Ok(())
        }
    }
}

fn store_config(cli: &Cli) -> Result<StoreConfig, CliError> {
    let mut config = StoreConfig::from_env_unchecked()?;
    if let Some(backend) = cli.storage {
        config.backend = backend;
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }
    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    config.check()?;
    Ok(config)
}

async fn run_call(bindings: &Bindings, name: &str, raw_args: &[String]) -> Result<(), CliError> {
    let args = raw_args
        .iter()
        .enumerate()
        .map(|(index, raw)| serde_json::from_str(raw).map_err(|source| CliError::InvalidJson { index, source }))
        .collect::<Result<Vec<Value>, _>>()?;
    let result = bindings.call(name, args).await?;
    print_json(&result)
}

async fn run_console(bindings: &Bindings) -> Result<(), CliError> {
    let store = bindings.store();
    let pruner = spawn_prune_task(store.notifications.clone(), store.config.prune_interval);
    let result = read_console(bindings).await;
    pruner.abort();
    result
}

async fn read_console(bindings: &Bindings) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some((name, args)) = parse_console_line(&line)? else {
            continue;
        };
        debug!(function = name, "console call");
        match bindings.call(name, args).await {
            Ok(result) => print_json(&result)?,
            Err(e) => {
                warn!(function = name, error = %e, "console call failed");
                eprintln!("error: {e}");
            }
        }
    }
    Ok(())
}

/// Split `name arg1 arg2 ...` where each argument is one JSON value.
/// Blank lines and `#` comments yield `None`.
fn parse_console_line(line: &str) -> Result<Option<(&str, Vec<Value>)>, CliError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let (name, rest) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
    let args = serde_json::Deserializer::from_str(rest)
        .into_iter::<Value>()
        .enumerate()
        .map(|(index, value)| value.map_err(|source| CliError::InvalidJson { index, source }))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some((name, args)))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value).map_err(CliError::Render)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn console_line_splits_name_and_json_args() {
        let (name, args) = parse_console_line(r#"updateAsset 1 {"available": 5, "status": "Sufficient"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(name, "updateAsset");
        assert_eq!(args, vec![json!(1), json!({"available": 5, "status": "Sufficient"})]);
    }

    #[test]
    fn console_line_without_args() {
        let (name, args) = parse_console_line("  getAssets  ").unwrap().unwrap();
        assert_eq!(name, "getAssets");
        assert!(args.is_empty());
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_console_line("").unwrap().is_none());
        assert!(parse_console_line("# seed data").unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_reported_with_index() {
        let err = parse_console_line(r#"createAsset {"id": 1"#).unwrap_err();
        assert!(matches!(err, CliError::InvalidJson { index: 0, .. }));
    }

    #[tokio::test]
    async fn keys_reflect_calls_made_through_bindings() {
        let bindings = Bindings::new(Store::in_memory());
        assert!(bindings.store().stored_keys().await.unwrap().is_empty());
        run_call(&bindings, "saveBases", &[r#"["Base Delta"]"#.to_owned()]).await.unwrap();
        assert_eq!(bindings.store().stored_keys().await.unwrap(), ["bases"]);
    }

    #[tokio::test]
    async fn call_dispatches_through_bindings() {
        let bindings = Bindings::new(Store::in_memory());
        run_call(&bindings, "getBases", &[]).await.unwrap();
        let err = run_call(&bindings, "getAssetById", &["{".to_owned()]).await.unwrap_err();
        assert!(matches!(err, CliError::InvalidJson { index: 0, .. }));
    }
}
