use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use couch_session::config::HubFileConfig;
use couch_session::{
    DeviceId, FileConfig, HubConfig, LocalHub, Orientation, SessionConfig, SessionController,
    SessionEvent, load_config,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "couch-sim")]
#[command(version)]
#[command(about = "Run a scripted screen + controllers session against an in-process hub")]
struct Cli {
    /// Directory containing couch.toml
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Number of controllers to connect
    #[arg(short, long, default_value_t = 2)]
    controllers: u32,

    /// Ping rounds the screen broadcasts
    #[arg(short, long, default_value_t = 3)]
    rounds: u32,

    /// Force time synchronization on (overrides config)
    #[arg(long)]
    synchronize_time: bool,

    /// Give up if the session has not finished after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SimMessage {
    Ping { round: u32, server_time: Option<i64> },
    Pong { round: u32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let cli = Cli::parse();

    let file_config: FileConfig = load_config(&cli.config_dir)
        .extract()
        .context("failed to load couch.toml / COUCH_* configuration")?;
    file_config.validate()?;

    let mut session_config = SessionConfig::from_file(&file_config.session);
    if cli.synchronize_time {
        session_config.synchronize_time = true;
    }

    tokio::time::timeout(
        Duration::from_secs(cli.timeout_secs),
        run(&cli, &file_config.hub, session_config),
    )
    .await
    .context("simulation timed out")?
}

async fn run(cli: &Cli, hub_config: &HubFileConfig, session_config: SessionConfig) -> Result<()> {
    let hub = LocalHub::start(HubConfig::from_file(hub_config))?;
    let mut screen: SessionController<SimMessage> =
        SessionController::screen(session_config.clone(), hub.connect());

    let join_code = match screen.next_event().await {
        Some(SessionEvent::Ready { join_code }) => join_code,
        other => bail!("screen did not become ready: {other:?}"),
    };
    info!(%join_code, version = screen.version(), "screen ready");

    let mut players = JoinSet::new();
    for n in 0..cli.controllers {
        let config = session_config
            .clone()
            .with_orientation(Orientation::Portrait)
            .with_nickname(format!("player-{n}"));
        let controller = SessionController::controller(config, join_code.clone(), hub.connect());
        players.spawn(play(controller));
    }

    let mut joined = HashSet::new();
    while joined.len() < cli.controllers as usize {
        match screen.next_event().await {
            Some(SessionEvent::DeviceStateChange {
                device_id,
                state: Some(_),
            }) => {
                if joined.insert(device_id) {
                    let nickname = screen.get_nickname(Some(device_id))?.unwrap_or("?");
                    info!(device = %device_id, nickname, "controller joined");
                }
            }
            Some(other) => debug!(?other, "event while waiting for players"),
            None => bail!("screen session ended before all controllers joined"),
        }
    }

    for round in 1..=cli.rounds {
        let server_time = screen.get_server_time().ok();
        screen.broadcast(&SimMessage::Ping { round, server_time })?;

        let mut pongs = Vec::new();
        while pongs.len() < cli.controllers as usize {
            match screen.next_event().await {
                Some(SessionEvent::Message {
                    from,
                    payload: SimMessage::Pong { round: r },
                }) if r == round => pongs.push(from),
                Some(other) => debug!(?other, "ignoring event"),
                None => bail!("screen session ended during round {round}"),
            }
        }
        pongs.sort();
        info!(round, ?pongs, "round complete");
    }

    screen.navigate_home()?;
    screen.disconnect();

    while let Some(result) = players.join_next().await {
        let (device_id, pings) = result.context("controller task panicked")??;
        info!(device = ?device_id, pings, "controller finished");
    }
    hub.shutdown();
    Ok(())
}

/// Controller side: answer every ping until the session closes.
async fn play(mut controller: SessionController<SimMessage>) -> Result<(Option<DeviceId>, u32)> {
    let mut pings = 0;
    while let Some(event) = controller.next_event().await {
        match event {
            SessionEvent::Ready { join_code } => {
                info!(device = ?controller.device_id(), %join_code, "controller ready");
                controller.set_custom_state(&serde_json::json!({ "status": "ready" }))?;
            }
            SessionEvent::Message {
                from,
                payload: SimMessage::Ping { round, server_time },
            } => {
                pings += 1;
                info!(device = ?controller.device_id(), round, ?server_time, "ping");
                controller.send(Some(from), &SimMessage::Pong { round })?;
            }
            _ => {}
        }
    }
    Ok((controller.device_id(), pings))
}
