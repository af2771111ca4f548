// Toku daemon: run a messenger core instance over the loopback engine,
// persist the profile envelope across restarts, log events until shutdown.

mod config;

use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use toku_core::{Engine, Event, EventKind, Instance, LoopbackEngine, SaveData};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("toku-daemon {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let engine = LoopbackEngine::new();
    let handle = engine.handle();

    let saved = match std::fs::read(&cfg.profile) {
        Ok(bytes) => Some(SaveData::from_bytes(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err).context(format!("reading profile {}", cfg.profile.display()))
        }
    };

    let fresh = saved.is_none();
    let instance = match &saved {
        Some(data) if data.is_encrypted() => {
            let passphrase = cfg
                .passphrase
                .as_deref()
                .context("profile is encrypted but no passphrase is configured")?;
            let instance = Instance::create(cfg.options.clone(), None, move |_| {
                Ok(Box::new(engine) as Box<dyn Engine>)
            })?;
            if !instance.restore_encrypted(data, passphrase)? {
                anyhow::bail!("profile {} could not be applied", cfg.profile.display());
            }
            instance
        }
        _ => Instance::create(cfg.options.clone(), saved.as_ref(), move |_| {
            Ok(Box::new(engine) as Box<dyn Engine>)
        })?,
    };

    if fresh {
        instance.set_name(&cfg.name)?;
        instance.set_status_message(&cfg.status_message)?;
    }
    info!(address = %instance.address()?, name = %instance.name()?, "profile ready");

    instance.subscribe(EventKind::Connected, |_| info!("connected"))?;
    instance.subscribe(EventKind::Disconnected, |_| warn!("disconnected"))?;
    instance.subscribe(EventKind::FriendRequest, |event| {
        if let Event::FriendRequest { public_key, message } = event {
            info!(%public_key, text = %message, "friend request");
        }
    })?;
    instance.subscribe(EventKind::FriendMessage, |event| {
        if let Event::FriendMessage { friend, message } = event {
            info!(friend, text = %message, "message received");
        }
    })?;
    instance.subscribe(EventKind::NameChange, |event| {
        if let Event::NameChange { friend, name } = event {
            info!(friend, name = %name, "friend renamed");
        }
    })?;

    instance.start()?;

    // The loopback engine has no network; bring the simulated link up once
    // the loop is ticking.
    let link = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        link.set_connected(true);
    });

    shutdown_signal().await?;
    info!("shutting down");

    let data = match &cfg.passphrase {
        Some(passphrase) => instance.snapshot_encrypted(passphrase)?,
        None => instance.snapshot()?,
    };
    if let Some(parent) = cfg.profile.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&cfg.profile, data.as_bytes())
        .with_context(|| format!("writing profile {}", cfg.profile.display()))?;
    info!(profile = %cfg.profile.display(), bytes = data.len(), "profile saved");

    instance.stop().await?;
    instance.dispose().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
