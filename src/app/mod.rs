use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::mirror::{PresenterView, Slot, StateMirror};
use crate::security::{obs_password, Vault};
use crate::transport::ObwsTransport;
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

const SERVER_TOKEN_KEY: &str = "server_token";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "vault-set" {
            return handle_vault_set(&config);
        }
        if command == "vault-get" {
            return handle_vault_get(&config);
        }
        if command == "vault-list" {
            return handle_vault_list(&config);
        }
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "status" {
            return handle_status(&config).await;
        }
        if command == "toggle-recording" {
            return handle_toggle_recording(&config).await;
        }
        return Err(format!("unknown command: {command}").into());
    }

    let mut vault = Vault::open(&config)?;
    let manager = Arc::new(build_manager(&config, &vault)?);

    let (tx, rx) = watch::channel(manager.mirror().snapshot().view());
    let presenter_mirror = manager.mirror().clone();
    let tick = Duration::from_millis(config.presenter.tick_ms);
    let presenter_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            publish(&presenter_mirror, &tx);
        }
    });

    if config.obs.auto_connect {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.connect_clicked().await {
                tracing::warn!(error = %err, "auto-connect failed");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = if config.server.enable {
        let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
        let token = server_token(&config, &mut vault);
        println!("Control surface: http://{}/state?token={}", addr, token);
        Some(crate::server::start(
            addr,
            token,
            rx,
            manager.clone(),
            shutdown_rx,
        ))
    } else {
        tracing::info!("control surface disabled");
        None
    };

    let result = tokio::select! {
        res = async {
            match server {
                Some(server) => server.await,
                None => std::future::pending().await,
            }
        } => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    };

    presenter_task.abort();
    manager.disconnect().await;
    result
}

/// Drains pending slot changes and republishes the view when anything moved.
fn publish(mirror: &StateMirror, tx: &watch::Sender<PresenterView>) -> Vec<Slot> {
    let drain = mirror.drain();
    if drain.changed.is_empty() {
        return drain.changed;
    }

    let view = drain.snapshot.view();
    if drain.changed.contains(&Slot::Connection) {
        tracing::info!(
            state = ?view.connection_state,
            plugin_version = %view.plugin_version,
            server_version = %view.server_version,
            "connection state changed"
        );
    }
    tracing::debug!(changed = ?drain.changed, "presenter view updated");
    let _ = tx.send(view);
    drain.changed
}

fn build_manager(
    config: &Config,
    vault: &Vault,
) -> Result<ConnectionManager, Box<dyn std::error::Error>> {
    let password = match obs_password(config, vault) {
        Ok(password) => password.map(|p| p.trim().to_string()),
        Err(err) => {
            tracing::warn!(error = %err, "OBS password unavailable, connecting without one");
            None
        }
    };
    let transport = Arc::new(ObwsTransport::new(config.obs.metrics_interval()));
    Ok(ConnectionManager::new(
        transport,
        StateMirror::new(),
        connection_settings(config, password)?,
    ))
}

fn connection_settings(
    config: &Config,
    password: Option<String>,
) -> Result<ConnectionSettings, Box<dyn std::error::Error>> {
    Ok(ConnectionSettings {
        address: config.obs.server_address()?,
        password,
        timeout: config.obs.connect_timeout(),
    })
}

/// Configured token, else the one persisted in the vault, else a fresh one.
fn server_token(config: &Config, vault: &mut Vault) -> String {
    if let Some(token) = config.server.token.clone() {
        return token;
    }
    if vault.contains(SERVER_TOKEN_KEY) {
        match vault.retrieve(SERVER_TOKEN_KEY) {
            Ok(existing) => return existing,
            Err(err) => {
                tracing::warn!(error = %err, "stored server token unreadable, issuing a new one")
            }
        }
    }
    let token = generate_token(32);
    if let Err(err) = vault.store(SERVER_TOKEN_KEY, &token) {
        tracing::warn!(error = %err, "failed to store server token in vault");
    }
    token
}

async fn handle_status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::open(config)?;
    let manager = build_manager(config, &vault)?;
    manager.connect_clicked().await?;
    let view = manager.mirror().snapshot().view();
    manager.disconnect().await;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn handle_toggle_recording(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::open(config)?;
    let manager = build_manager(config, &vault)?;
    manager.connect_clicked().await?;
    let before = manager.mirror().snapshot().view().recording_label;
    let result = manager.toggle_recording_clicked().await;
    manager.disconnect().await;
    result?;
    println!("Recording toggle requested (was: {})", before);
    Ok(())
}

fn handle_vault_set(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;
    let value = args.next().ok_or("missing value")?;

    let mut vault = Vault::open(config)?;
    vault.store(&key, &value)?;

    println!("Stored vault key: {}", key);
    Ok(())
}

fn handle_vault_get(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;

    let vault = Vault::open(config)?;
    let value = vault.retrieve(&key)?;

    println!("{}", value);
    Ok(())
}

fn handle_vault_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::open(config)?;
    for key in vault.list_keys() {
        println!("{}", key);
    }
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
