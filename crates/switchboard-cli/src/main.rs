//! switchboard: drive rooms, follow progress streams and switch tenants
//! from the command line

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use switchboard_core::config::default_config_path;
use switchboard_core::{Command, ConnectionState, NotificationBus, SwitchboardConfig, TenantContext};
use switchboard_gateway::{
    CommandRouter, Delivery, EventEmitter, RoomChannels, RoomEnvelope, ToolContext,
    ToolIntentStore, register_builtin_handlers,
};
use switchboard_progress::{HttpProgressSource, ProgressStreamClient, ReconnectPolicy, StreamItem};
use switchboard_tenant::TenantBroadcaster;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Real-time coordination for agent-driven tools")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.switchboard/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room, run the built-in tool handlers and log notifications
    Listen {
        #[arg(long)]
        room: Option<String>,
        /// Room URL; `{room}` is replaced with the room id
        #[arg(long)]
        url: Option<String>,
    },

    /// Push one tool command into a room and print its acknowledgement
    Send {
        #[arg(long)]
        action: String,
        /// Command parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        url: Option<String>,
        /// Seconds to wait for the acknowledgement
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Follow a task's progress stream until it completes or fails
    Progress {
        task_id: String,
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Inspect or change the shared tenant context
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Print the current context
    Show,
    /// Switch to a customer and project
    Commit {
        #[arg(long)]
        customer: String,
        #[arg(long)]
        project: String,
    },
    /// Print context changes and invalidations made by other processes
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = SwitchboardConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    match cli.command {
        Commands::Listen { room, url } => cmd_listen(&config, room, url).await,
        Commands::Send {
            action,
            params,
            room,
            url,
            timeout,
        } => cmd_send(&config, action, &params, room, url, timeout).await,
        Commands::Progress { task_id, base_url } => cmd_progress(&config, task_id, base_url).await,
        Commands::Tenant { command } => cmd_tenant(&config, command).await,
    }
}

fn room_target(
    config: &SwitchboardConfig,
    room: Option<String>,
    url: Option<String>,
) -> (String, String) {
    let room = room.unwrap_or_else(|| config.gateway.room.clone());
    let url = match url {
        Some(url) => url.replace("{room}", &room),
        None => config.gateway.room_url(&room),
    };
    (room, url)
}

async fn cmd_listen(
    config: &SwitchboardConfig,
    room: Option<String>,
    url: Option<String>,
) -> Result<()> {
    let (room, url) = room_target(config, room, url);
    let rooms = RoomChannels::new();
    let channel = rooms.channel(&room).await?;
    channel.connect(&url).await?;

    let router = CommandRouter::new();
    let _attachment = router.attach(&channel);
    let bus = NotificationBus::new();
    let mut notifications = bus.subscribe_all();
    let ctx = ToolContext {
        intents: Arc::new(ToolIntentStore::new()),
        bus: bus.clone(),
        emitter: EventEmitter::new(channel.clone(), config.gateway.user_id.clone()),
    };
    register_builtin_handlers(&router, &ctx).await;
    info!("Listening on room '{}' (Ctrl-C to stop)", channel.room_id());

    let policy = ReconnectPolicy::from(&config.progress);
    let mut state = channel.watch_state();
    let mut failures: u32 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(notification) = notifications.recv() => {
                info!(
                    "[{}] {}",
                    notification.topic().as_str(),
                    serde_json::to_string(&notification)?
                );
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                debug!("Room '{}' is {}", channel.room_id(), current);
                if current != ConnectionState::Disconnected {
                    continue;
                }

                failures += 1;
                let Some(delay) = policy.after_failures(failures) else {
                    rooms.close_all().await;
                    bail!("Room '{}' unreachable after {} reconnect attempts", room, policy.max_attempts);
                };
                warn!("Room '{}' disconnected, reconnecting in {:?}", room, delay);
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match channel.connect(&url).await {
                    Ok(()) => failures = 0,
                    Err(e) => warn!("Reconnect failed: {}", e),
                }
            }
        }
    }

    if let Some(err) = router.last_error() {
        debug!("Last handler error: {}", err);
    }
    info!(
        "Dispatched {} command(s); {} still waiting for a handler",
        router.dispatched_count(),
        router.pending_len()
    );
    rooms.close_all().await;
    Ok(())
}

async fn cmd_send(
    config: &SwitchboardConfig,
    action: String,
    params: &str,
    room: Option<String>,
    url: Option<String>,
    timeout: u64,
) -> Result<()> {
    let parameters: Map<String, Value> =
        serde_json::from_str(params).context("--params must be a JSON object")?;
    let (room, url) = room_target(config, room, url);

    let rooms = RoomChannels::new();
    let channel = rooms.channel(&room).await?;
    let mut inbound = channel.subscribe();
    channel.connect(&url).await?;

    let id = uuid::Uuid::new_v4().to_string();
    let mut command = Command::new(action).with_id(&id);
    command.parameters = parameters;
    if channel.send(&RoomEnvelope::ToolCommand(command)) == Delivery::Dropped {
        bail!("Room '{}' closed before the command could be sent", room);
    }
    info!("Sent command {} to room '{}'", id, room);

    let wait = async {
        loop {
            match inbound.recv().await {
                Ok(RoomEnvelope::ToolEvent(event)) if event.correlation_id.as_deref() == Some(id.as_str()) => {
                    return Ok(event);
                }
                Ok(other) => debug!("Skipping {}", other.kind()),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} envelope(s)", n),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("Room '{}' closed", room));
                }
            }
        }
    };
    let result = tokio::time::timeout(Duration::from_secs(timeout), wait).await;
    rooms.close_all().await;

    let event = result.with_context(|| format!("No acknowledgement within {}s", timeout))??;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

async fn cmd_progress(
    config: &SwitchboardConfig,
    task_id: String,
    base_url: Option<String>,
) -> Result<()> {
    let base_url = base_url.unwrap_or_else(|| config.progress.base_url.clone());
    let source = HttpProgressSource::new(&base_url)?;
    let client = ProgressStreamClient::new(Arc::new(source), ReconnectPolicy::from(&config.progress));
    let mut stream = client.open(task_id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                stream.close();
                info!("Stopped following task {}", stream.task_id());
                return Ok(());
            }
            item = stream.next() => match item {
                Some(StreamItem::Progress(data)) => println!("{}", serde_json::to_string(&data)?),
                Some(StreamItem::Completed(summary)) => {
                    println!("{}", serde_json::to_string(&summary)?);
                    info!("Task {} completed", stream.task_id());
                    return Ok(());
                }
                Some(StreamItem::Failed(e)) => {
                    return Err(e).with_context(|| format!("Task {} failed", stream.task_id()));
                }
                None => return Ok(()),
            }
        }
    }
}

async fn cmd_tenant(config: &SwitchboardConfig, command: TenantCommands) -> Result<()> {
    let tenant = TenantBroadcaster::from_config(&config.tenant);

    match command {
        TenantCommands::Show => {
            println!(
                "{} (v{}) at {:?}",
                tenant.context(),
                tenant.version(),
                tenant.store_path()
            );
        }
        TenantCommands::Commit { customer, project } => {
            let committed = tenant.commit(TenantContext::new(customer, project));
            if !committed.persisted {
                bail!(
                    "Context changed locally but could not be written to {:?}",
                    tenant.store_path()
                );
            }
            println!("{} (v{})", tenant.context(), committed.version);
        }
        TenantCommands::Watch => {
            tenant.start_watching()?;
            let mut changes = tenant.subscribe_changes();
            let mut epochs = tenant.invalidations();
            println!("{} (v{})", tenant.context(), tenant.version());

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    change = changes.recv() => match change {
                        Ok(change) => println!(
                            "{:?} change: {} (v{})",
                            change.origin, change.context, change.version
                        ),
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} change(s)", n),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        println!("invalidated (epoch {})", *epochs.borrow_and_update());
                    }
                }
            }
            tenant.shutdown();
        }
    }
    Ok(())
}
