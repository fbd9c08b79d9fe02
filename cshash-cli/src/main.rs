use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use cshash_core::{
    ConsistentHash, Crc32Encryptor, CshashConfig, DynRingStore, MemoryRingStore, MigrationTask,
    Migrator, StoreBackend, StoreConfig,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Tracing target of this binary's console output
const CONSOLE_TARGET: &str = "cshash_cli";

#[derive(Parser, Debug)]
#[command(name = "cshash-cli")]
#[command(about = "Consistent hash ring console", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Command to execute (if not in interactive mode)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

/// Migrator that only reports what would move
struct LoggingMigrator;

#[async_trait]
impl Migrator for LoggingMigrator {
    async fn migrate(
        &self,
        _cancel: &CancellationToken,
        keys: &HashSet<String>,
        from: &str,
        to: &str,
    ) -> anyhow::Result<()> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        info!(
            "{} {} {} {} {:?}",
            "migrate".yellow(),
            from.bold(),
            "->".dimmed(),
            to.bold(),
            sorted
        );
        Ok(())
    }
}

struct RingConsole {
    ring: ConsistentHash,
}

impl RingConsole {
    async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();
        let cancel = CancellationToken::new();

        let response = match command.to_uppercase().as_str() {
            "ADD" => self.cmd_add(&cancel, args).await?,
            "REMOVE" | "DEL" => self.cmd_remove(&cancel, args).await?,
            "GET" => self.cmd_get(&cancel, args).await?,
            "ASSIGN" => self.cmd_assign(&cancel, args).await?,
            "NODES" => self.cmd_nodes(&cancel).await?,
            "KEYS" => self.cmd_keys(&cancel, args).await?,
            "VERSION" => self.cmd_version(&cancel).await?,
            "METRICS" => self.cmd_metrics()?,
            "HELP" => self.help_text(),
            _ => return Err(anyhow::anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn cmd_add(&self, cancel: &CancellationToken, args: &[String]) -> Result<String> {
        let Some(name) = args.first() else {
            return Err(anyhow::anyhow!("Usage: ADD node [weight]"));
        };
        let weight = match args.get(1) {
            Some(raw) => raw
                .parse::<i64>()
                .with_context(|| format!("invalid weight: {}", raw))?,
            None => 1,
        };

        self.ring.add_node(cancel, name, weight).await?;
        Ok("OK".green().to_string())
    }

    async fn cmd_remove(&self, cancel: &CancellationToken, args: &[String]) -> Result<String> {
        let Some(name) = args.first() else {
            return Err(anyhow::anyhow!("Usage: REMOVE node"));
        };

        self.ring.remove_node(cancel, name).await?;
        Ok("OK".green().to_string())
    }

    async fn cmd_get(&self, cancel: &CancellationToken, args: &[String]) -> Result<String> {
        let Some(key) = args.first() else {
            return Err(anyhow::anyhow!("Usage: GET key"));
        };

        let node = self.ring.get_node(cancel, key).await?;
        Ok(format!("\"{}\"", node))
    }

    async fn cmd_assign(&self, cancel: &CancellationToken, args: &[String]) -> Result<String> {
        if args.is_empty() {
            return Err(anyhow::anyhow!("Usage: ASSIGN key [key ...]"));
        }

        let mut lines = Vec::with_capacity(args.len());
        for (i, key) in args.iter().enumerate() {
            let node = self.ring.add_data_key_to_node(cancel, key).await?;
            lines.push(format!("{}) {} -> \"{}\"", i + 1, key, node));
        }
        Ok(lines.join("\n"))
    }

    async fn cmd_nodes(&self, cancel: &CancellationToken) -> Result<String> {
        let nodes = self.ring.real_nodes(cancel).await?;
        if nodes.is_empty() {
            return Ok("(empty ring)".dimmed().to_string());
        }

        let mut nodes: Vec<_> = nodes.into_iter().collect();
        nodes.sort();
        Ok(nodes
            .iter()
            .enumerate()
            .map(|(i, (name, replicas))| format!("{}) \"{}\" replicas={}", i + 1, name, replicas))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_keys(&self, cancel: &CancellationToken, args: &[String]) -> Result<String> {
        let Some(name) = args.first() else {
            return Err(anyhow::anyhow!("Usage: KEYS node"));
        };

        let keys = self.ring.owned_keys(cancel, name).await?;
        if keys.is_empty() {
            return Ok("(empty list)".dimmed().to_string());
        }

        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        Ok(keys
            .iter()
            .enumerate()
            .map(|(i, key)| format!("{}) \"{}\"", i + 1, key))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn cmd_version(&self, cancel: &CancellationToken) -> Result<String> {
        let version = self.ring.version(cancel).await?;
        Ok(format!("(integer) {}", version))
    }

    fn cmd_metrics(&self) -> Result<String> {
        cshash_core::metrics::encode_metrics().map_err(|e| anyhow::anyhow!("{}", e))
    }

    fn help_text(&self) -> String {
        format!(
            r#"{}

{}
  ADD node [weight]          Add a node (weight 1-10, default 1)
  REMOVE node                Remove a node and hand its keys back
  NODES                      List nodes and their replica counts

{}
  GET key                    Resolve the node owning key
  ASSIGN key [key ...]       Resolve and record ownership of keys
  KEYS node                  List keys recorded for a node

{}
  VERSION                    Ring version
  METRICS                    Prometheus metrics
  HELP                       Show this help message
  QUIT                       Exit the CLI
"#,
            "cshash CLI - Available Commands".bold().cyan(),
            "Membership:".bold(),
            "Keys:".bold(),
            "Ring:".bold(),
        )
    }
}

async fn open_store(config: &StoreConfig) -> Result<Arc<DynRingStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRingStore::new())),
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let store =
                cshash_core::RedisRingStore::new(&config.redis_url, &config.ring_key).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => Err(anyhow::anyhow!(
            "redis backend requires the `redis-store` feature"
        )),
    }
}

/// Console replies always print at `info`; the configured level and format
/// (or `RUST_LOG`) only govern diagnostics from the ring library.
fn init_tracing(config: &CshashConfig) -> Result<()> {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(EnvFilter::new(format!("{}=info", CONSOLE_TARGET)));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cshash_core={}", config.logging.level)))
        .add_directive(format!("{}=off", CONSOLE_TARGET).parse()?);

    let diagnostics = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let diagnostics = if config.logging.format == "json" {
        diagnostics.json().with_filter(filter).boxed()
    } else {
        diagnostics.with_filter(filter).boxed()
    };

    tracing_subscriber::registry()
        .with(diagnostics)
        .with(console)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CshashConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => CshashConfig::default(),
    };
    init_tracing(&config)?;

    let store = open_store(&config.store).await?;
    let ring = ConsistentHash::new(
        store,
        Arc::new(Crc32Encryptor::new()),
        Arc::new(LoggingMigrator),
        config.ring_options(),
    )
    .with_failure_hook(Arc::new(|task: &MigrationTask, err: &anyhow::Error| {
        warn!(vnode = %task.vnode, error = %err, "keys left unmigrated");
    }));
    let console = RingConsole { ring };

    if !args.command.is_empty() {
        let cmd = &args.command[0];
        let cmd_args: Vec<String> = args.command[1..].to_vec();

        match console.execute_command(cmd, &cmd_args).await {
            Ok(output) => {
                info!("{}", output);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "{}", format!("Error: {}", e).red());
                std::process::exit(1);
            }
        }
    } else {
        run_interactive(console, &config.store).await
    }
}

async fn run_interactive(console: RingConsole, store: &StoreConfig) -> Result<()> {
    info!(
        "{}",
        format!("cshash CLI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .cyan()
    );
    info!("Ring \"{}\" on {:?} store", store.ring_key, store.backend);
    info!("Type {} for available commands\n", "HELP".bold());

    let mut rl = DefaultEditor::new()?;
    let prompt = format!("{}> ", format!("cshash {}", store.ring_key).green());

    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }

                rl.add_history_entry(&line)?;

                let parts: Vec<String> = line.split_whitespace().map(String::from).collect();
                let cmd = &parts[0];
                let args = &parts[1..];

                if cmd.eq_ignore_ascii_case("QUIT") || cmd.eq_ignore_ascii_case("EXIT") {
                    info!("Goodbye!");
                    break;
                }

                match console.execute_command(cmd, args).await {
                    Ok(output) => info!("{}", output),
                    Err(e) => {
                        error!(error = %e, "{}", format!("Error: {}", e).red());
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                info!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                info!("Goodbye!");
                break;
            }
            Err(err) => {
                error!(error = ?err, "Readline error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
