//! bridge-client CLI entry point
//!
//! Connects to a bridge server with a file-backed identity, advertises two
//! demo tools and logs every event until interrupted.

#![warn(clippy::all)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bridge_client::{
    BridgeConfig, BridgeError, BridgeEvent, BridgeResult, ConnectionManager, CredentialStore,
    FileIdentityStorage, HttpIdentityIssuer, ReconnectConfig, ServerEndpoint, ToolError,
    ToolRegistry, ToolSchema,
};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// bridge-client - expose local tools to agents through a bridge server
#[derive(Parser, Debug)]
#[command(name = "bridge-client", version, about, author)]
struct Cli {
    /// Application identifier
    #[arg(long, env = "BRIDGE_APP_ID")]
    app_id: String,

    /// Origin of the bridge server (scheme decides ws or wss)
    #[arg(long, env = "BRIDGE_SERVER_ORIGIN", default_value = "http://localhost:8080")]
    server: String,

    /// Path prefix of the channel endpoint
    #[arg(long, env = "BRIDGE_PATH_PREFIX", default_value = "/ws")]
    path_prefix: String,

    /// Credential issuance endpoint
    #[arg(long, env = "BRIDGE_ISSUER_URL")]
    issuer_url: String,

    /// Application key sent to the issuance endpoint
    #[arg(long, env = "BRIDGE_APP_KEY", hide_env_values = true)]
    app_key: Option<String>,

    /// Directory holding the persisted identity
    #[arg(long, env = "BRIDGE_IDENTITY_DIR", default_value = ".bridge-client")]
    identity_dir: PathBuf,

    /// Connect timeout in milliseconds
    #[arg(long, env = "BRIDGE_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Base reconnect interval in milliseconds
    #[arg(long, env = "BRIDGE_RECONNECT_BASE_MS", default_value_t = 1_000)]
    reconnect_base_ms: u64,

    /// Reconnect attempts before giving up
    #[arg(long, env = "BRIDGE_RECONNECT_MAX_ATTEMPTS", default_value_t = 5)]
    reconnect_max_attempts: u32,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Discard the persisted identity and issue a new one before connecting
    #[arg(long)]
    reset_credentials: bool,

    /// Enable verbose logging (-v, -vv, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn init_tracing(&self) {
        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("warn,bridge_client={level}"))
        });

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    fn config(&self) -> BridgeResult<BridgeConfig> {
        let endpoint =
            ServerEndpoint::from_origin(&self.server)?.with_path_prefix(self.path_prefix.clone());
        let reconnect = if self.no_reconnect {
            ReconnectConfig::disabled()
        } else {
            ReconnectConfig::default()
                .with_base_interval(Duration::from_millis(self.reconnect_base_ms))
                .with_max_attempts(self.reconnect_max_attempts)
        };

        Ok(BridgeConfig::new(self.app_id.clone(), endpoint)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_reconnect_config(reconnect))
    }

    fn credentials(&self) -> CredentialStore {
        let mut issuer = HttpIdentityIssuer::new(self.issuer_url.clone());
        if let Some(ref key) = self.app_key {
            issuer = issuer.with_app_key(key.clone());
        }
        CredentialStore::new(
            self.app_id.clone(),
            Arc::new(FileIdentityStorage::new(self.identity_dir.clone())),
            Arc::new(issuer),
        )
    }
}

async fn echo(args: Value) -> Result<Value, ToolError> {
    Ok(json!({ "echo": args }))
}

async fn roll_dice(args: Value) -> Result<Value, ToolError> {
    let sides = args.get("sides").and_then(Value::as_u64).unwrap_or(6);
    if !(2..=1000).contains(&sides) {
        return Err(ToolError::new(format!("sides must be between 2 and 1000, got {sides}")));
    }
    Ok(json!({ "sides": sides, "value": fastrand::u64(1..=sides) }))
}

fn demo_tools() -> ToolRegistry {
    let tools = ToolRegistry::new();
    tools.register_fn(
        ToolSchema::new(
            "echo",
            "Return the arguments unchanged",
            json!({ "type": "object" }),
        ),
        echo,
    );
    tools.register_fn(
        ToolSchema::new(
            "roll_dice",
            "Roll a die with the given number of sides",
            json!({
                "type": "object",
                "properties": { "sides": { "type": "integer", "minimum": 2, "default": 6 } }
            }),
        ),
        roll_dice,
    );
    tools
}

fn log_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::Status { status, error: None } => info!(%status, "status"),
        BridgeEvent::Status {
            status,
            error: Some(error),
        } => warn!(%status, %error, "status"),
        BridgeEvent::IdentityReady(identity) => info!(user_id = %identity.user_id, "identity ready"),
        BridgeEvent::PeerConnected { agent_session_id } => {
            info!(agent = ?agent_session_id, "agent connected");
        }
        BridgeEvent::PeerDisconnected { agent_session_id } => {
            info!(agent = ?agent_session_id, "agent disconnected");
        }
        BridgeEvent::Message(value) => info!(%value, "message"),
        BridgeEvent::Error(err) if err.resettable => {
            error!(error = %err.message, "credential error, rerun with --reset-credentials");
        }
        BridgeEvent::Error(err) => error!(error = %err.message, "error"),
    }
}

async fn run(cli: Cli) -> BridgeResult<()> {
    let manager = ConnectionManager::new(cli.config()?, cli.credentials(), demo_tools())?;
    manager.events().subscribe(log_event);

    if cli.reset_credentials {
        manager.reset_credentials().await?;
    }

    match manager.connect().await {
        Ok(()) => {}
        Err(e) if e.is_retryable() => warn!(error = %e, "Initial connect failed, retrying in background"),
        Err(e) => return Err(e),
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| BridgeError::Configuration(format!("cannot listen for Ctrl-C: {e}")))?;
    info!("Shutting down");
    manager.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    cli.init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bridge-client failed");
            ExitCode::FAILURE
        }
    }
}
