use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opsdeck_console::{
    catalog::{CatalogClient, DEFAULT_IDS_LIMIT, DEFAULT_SEARCH_LIMIT},
    channel::{ChannelEvent, ChannelHandle, ConnectionManager},
    config::{ConfigFlags, ConsoleConfig},
    console::{self, ConsoleCommand},
    gateway::{CommandDispatch, CommandGateway},
    logging::init_logging,
    session::ConsoleSession,
    surface::ControlSurface,
};
use opsdeck_core::{parse_id_list, AgentCommand, ImageFormat, Resource};
use serde_json::Value;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{info, warn};

const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "opsdeck")]
#[command(about = "Operator console for a remote agent", long_about = None)]
struct Args {
    #[arg(long, global = true, default_value = "")]
    base_url: String,
    #[arg(long, global = true, default_value = "")]
    token: String,
    #[arg(long, global = true, default_value = "")]
    status_path: String,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true)]
    reconnect_ms: Option<u64>,
    #[arg(long, global = true)]
    command_timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Option<Command>,
}

impl Args {
    fn flags(&self) -> ConfigFlags {
        ConfigFlags {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            status_path: self.status_path.clone(),
            log_dir: self.log_dir.clone(),
            reconnect_ms: self.reconnect_ms,
            command_timeout_ms: self.command_timeout_ms,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive console (default)
    Console,
    /// Print channel status and frames until interrupted
    Watch,
    /// Wait for the agent, then dispatch start_script once
    Start {
        /// Comma separated ids; the persisted selection is used when empty
        #[arg(long, default_value = "")]
        ids: String,
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// List resources by query or by ids
    Items {
        #[arg(long, default_value = "")]
        query: String,
        #[arg(long, default_value = "")]
        ids: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Save the persisted selection
    Select {
        #[arg(long)]
        ids: String,
    },
    /// Relay a raw agent command
    Cmd {
        name: String,
        /// JSON object
        #[arg(long, default_value = "")]
        args: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    GetConfig,
    ValidateConfig {
        #[arg(long)]
        file: PathBuf,
    },
    SetConfig {
        #[arg(long)]
        file: PathBuf,
    },
    PatchConfig {
        /// JSON object merged into the agent config
        #[arg(long)]
        patch: String,
    },
    Screenshot {
        #[arg(long, default_value_t = 1)]
        monitor: u32,
        #[arg(long, default_value = "PNG")]
        format: ImageFormat,
        /// x,y,width,height
        #[arg(long, default_value = "")]
        region: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match ConsoleConfig::load(&args.flags()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("opsdeck: {err}");
            return ExitCode::from(2);
        }
    };
    let _log_guard = init_logging(&config);
    info!(event = "opsdeck_start", base_url = %config.base_url);

    match run(args.command.unwrap_or(Command::Console), config).await {
        Ok(code) => code,
        Err(err) => {
            warn!(event = "opsdeck_error", error = %err);
            eprintln!("opsdeck: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: ConsoleConfig) -> Result<ExitCode> {
    match command {
        Command::Console => run_console(config).await,
        Command::Watch => run_watch(config).await,
        Command::Start { ids, wait_secs } => {
            run_start(config, &ids, Duration::from_secs(wait_secs)).await
        }
        Command::Items { query, ids, limit } => {
            let catalog = catalog_for(&config);
            let items = if ids.trim().is_empty() {
                catalog.search(&query, limit).await?
            } else {
                let ids = parse_id_list(&ids).map_err(anyhow::Error::msg)?;
                catalog.by_ids(&ids, limit).await?
            };
            print_items(&items);
            Ok(ExitCode::SUCCESS)
        }
        Command::Select { ids } => {
            let ids = parse_id_list(&ids).map_err(anyhow::Error::msg)?;
            let ack = catalog_for(&config).save_selection(&ids).await?;
            if !ack.ok {
                bail!("selection save was not acknowledged");
            }
            println!("selection saved ({} item(s))", ack.count);
            Ok(ExitCode::SUCCESS)
        }
        Command::Cmd {
            name,
            args,
            timeout_ms,
        } => {
            let args = console::parse_args_json(&args).map_err(anyhow::Error::msg)?;
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(config.command_timeout);
            let payload = CommandGateway::new(&config.base_url)
                .dispatch(&name, args, &config.token, timeout)
                .await?;
            print_payload(&payload)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::GetConfig => {
            let payload = relay(&config, AgentCommand::GetConfig).await?;
            match payload.get("content").and_then(Value::as_str) {
                Some(content) => println!("{content}"),
                None => print_payload(&payload)?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ValidateConfig { file } => {
            let content = read_config_file(&file)?;
            print_payload(&relay(&config, AgentCommand::ValidateConfig { content }).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::SetConfig { file } => {
            let content = read_config_file(&file)?;
            print_payload(&relay(&config, AgentCommand::SetConfig { content }).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::PatchConfig { patch } => {
            let patch = console::parse_args_json(&patch).map_err(anyhow::Error::msg)?;
            print_payload(&relay(&config, AgentCommand::PatchConfig { patch }).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Screenshot {
            monitor,
            format,
            region,
        } => {
            let region = parse_region(&region)?;
            let command = AgentCommand::Screenshot {
                monitor,
                region,
                format,
            };
            print_payload(&relay(&config, command).await?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn catalog_for(config: &ConsoleConfig) -> CatalogClient {
    CatalogClient::new(&config.base_url).with_timeout(config.command_timeout)
}

fn surface_for(config: &ConsoleConfig) -> ControlSurface {
    ControlSurface::new(
        Arc::new(CommandGateway::new(&config.base_url)),
        config.token.clone(),
        config.command_timeout,
    )
}

fn open_channel(config: &ConsoleConfig) -> Result<(ChannelHandle, mpsc::Receiver<ChannelEvent>)> {
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let handle = ConnectionManager::websocket(config.base_url.clone(), config.reconnect)
        .open(&config.status_path, event_tx)?;
    Ok((handle, event_rx))
}

async fn relay(config: &ConsoleConfig, command: AgentCommand) -> Result<Value> {
    let timeout = command.timeout_or(config.command_timeout);
    let payload = CommandGateway::new(&config.base_url)
        .dispatch(command.name(), command.args(), &config.token, timeout)
        .await?;
    Ok(payload)
}

async fn run_console(config: ConsoleConfig) -> Result<ExitCode> {
    let catalog = catalog_for(&config);
    let mut surface = surface_for(&config);
    match catalog.load_selection().await {
        Ok(items) => {
            surface.replace_selection(items);
        }
        Err(err) => {
            warn!(event = "selection_hydrate_failed", error = %err);
            println!("persisted selection unavailable: {err}");
        }
    }
    let mut session = ConsoleSession::new(surface, catalog);
    let (channel, mut events) = open_channel(&config)?;
    let mut channel_live = true;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_lines(session.selection_lines());
    println!("type help for commands");

    loop {
        tokio::select! {
            event = events.recv(), if channel_live => match event {
                Some(event) => print_lines(session.apply_event(&event)),
                None => {
                    channel_live = false;
                    print_lines(session.channel_ended());
                }
            },
            settled = session.next_settlement(), if session.has_pending() => {
                if let Some(settled) = settled {
                    println!("{}", session.settle_command(settled));
                }
            }
            settled = session.next_lookup(), if session.has_lookups() => {
                if let Some(settled) = settled {
                    print_lines(session.settle_lookup(settled));
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => print_lines(session.handle(command)),
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "stdin_error", error = %err);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(events);
    channel.shutdown().await;
    info!(event = "console_exit");
    Ok(ExitCode::SUCCESS)
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

async fn run_watch(config: ConsoleConfig) -> Result<ExitCode> {
    let (channel, mut events) = open_channel(&config)?;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", console::event_line(&event)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    drop(events);
    channel.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

async fn run_start(config: ConsoleConfig, ids: &str, wait: Duration) -> Result<ExitCode> {
    let catalog = catalog_for(&config);
    let mut surface = surface_for(&config);
    let items = if ids.trim().is_empty() {
        catalog.load_selection().await?
    } else {
        let ids = parse_id_list(ids).map_err(anyhow::Error::msg)?;
        catalog.by_ids(&ids, DEFAULT_IDS_LIMIT).await?
    };
    surface.replace_selection(items);
    for line in console::selection_lines(surface.selection().items()) {
        println!("{line}");
    }
    if surface.selection().is_empty() {
        bail!("selection is empty; nothing to start");
    }

    let (channel, mut events) = open_channel(&config)?;
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    while !surface.agent_connected() {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if surface.apply_channel_event(&event) {
                        println!(
                            "{}",
                            console::agent_line(surface.agent_connected(), surface.channel_state())
                        );
                    }
                }
                None => break,
            },
            _ = &mut deadline => break,
        }
    }

    let outcome = surface.start().await;
    drop(events);
    channel.shutdown().await;
    match outcome {
        Ok(notice) => {
            println!("{}", console::notice_line(&notice));
            Ok(if notice.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(blocker) => {
            eprintln!("opsdeck: cannot start: {blocker}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn parse_region(raw: &str) -> Result<Option<[i64; 4]>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let parts = raw
        .split(',')
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid region {raw:?}"))?;
    match <[i64; 4]>::try_from(parts) {
        Ok(region) => Ok(Some(region)),
        Err(_) => bail!("region expects x,y,width,height"),
    }
}

fn print_items(items: &[Resource]) {
    if items.is_empty() {
        println!("no resources found");
    }
    for item in items {
        println!("{item}");
    }
}

fn print_payload(payload: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(payload)?);
    Ok(())
}
