//! peerbind - Device trust establishment between peers
//!
//! Pairs two simulated devices over an in-process network, runs the full
//! PIN handshake between them and prints what each side ended up trusting.

use anyhow::{Context, Result};
use clap::Parser;
use peerbind_auth::{AuthResult, JsonTrustStore, LocalDevice, TrustStore};
use peerbind_core::{AuthConfig, AuthType, BindLevel, DM_OK};
use peerbind_loopback::{
    wait_for_result, ConfirmPolicy, LoopbackNetwork, PinBoard, PinPolicy, ScriptedPrompt,
    SimulatedDevice,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

const SOURCE_UDID: &str = "source-device";
const SINK_UDID: &str = "sink-device";

/// peerbind - Bind two devices with a PIN handshake
#[derive(Parser, Debug)]
#[command(name = "peerbind")]
#[command(version, about, long_about = None)]
struct Args {
    /// Package requesting the bind
    #[arg(short, long, default_value = "com.example.peerbind")]
    pkg: String,

    /// How the devices authenticate (pin, import, account, credential)
    #[arg(short, long, default_value = "pin")]
    auth_type: String,

    /// Bind level (1 = device, 2 = service, 3 = app)
    #[arg(short, long, default_value = "3")]
    level: i32,

    /// Account signed in on both devices
    #[arg(long)]
    shared_account: Option<String>,

    /// The sink user rejects the bind
    #[arg(long)]
    reject: bool,

    /// The sink user allows the peer permanently
    #[arg(long)]
    always: bool,

    /// Wrong PINs typed on the source before the right one
    #[arg(long, default_value = "0")]
    wrong_pins: u32,

    /// Number of consecutive binds to run
    #[arg(short, long, default_value = "1")]
    binds: u32,

    /// Unbind again after the last bind and propagate it to the peer
    #[arg(long)]
    unbind: bool,

    /// Keep the source's trust store in this file
    #[arg(long)]
    store: Option<PathBuf>,

    /// JSON file with auth tunables
    /// (default: ~/.config/peerbind/config.json when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to wait for each bind to finish
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<AuthConfig> {
    let default_path = dirs::config_dir().map(|dir| dir.join("peerbind").join("config.json"));
    let path = match (path, default_path) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) if path.exists() => path,
        _ => return Ok(AuthConfig::new()),
    };
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config = AuthConfig::from_json_str(&json)
        .with_context(|| format!("Invalid config {:?}", path))?;
    info!("Loaded config from {:?}", path);
    Ok(config)
}

fn print_result(side: &str, result: &AuthResult) {
    if result.result_code == DM_OK {
        println!("  ✓ {} ({}) bound with {}", side, result.role, result.device_id);
    } else {
        println!(
            "  ✗ {} ({}) failed with code {}",
            side, result.role, result.result_code
        );
    }
}

fn print_trust(name: &str, store: &dyn TrustStore) {
    let entries = store.list_access_control_list();
    println!("  {} trusts {} peer(s)", name, entries.len());
    for entry in entries {
        println!(
            "    {} {:?} {:?} via {:?}",
            entry.remote.udid, entry.bind_level, entry.lifetime, entry.auth_type
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("peerbind v{}", env!("CARGO_PKG_VERSION"));

    let auth_type: AuthType = args
        .auth_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let level = BindLevel::from_i32(args.level)
        .ok_or_else(|| anyhow::anyhow!("Invalid bind level: {}. Use 1, 2 or 3", args.level))?;
    let config = load_config(args.config.as_ref())?;

    let (source_account, sink_account) = match &args.shared_account {
        Some(account) => (account.clone(), account.clone()),
        None => ("source-user".to_string(), "sink-user".to_string()),
    };
    let source_local = LocalDevice::new(SOURCE_UDID)
        .with_account(100, source_account)
        .with_token_id(1001);
    let sink_local = LocalDevice::new(SINK_UDID)
        .with_account(100, sink_account)
        .with_token_id(2002);

    let confirm = if args.reject {
        ConfirmPolicy::Reject
    } else if args.always {
        ConfirmPolicy::AllowAlways
    } else {
        ConfirmPolicy::Allow
    };
    let pin = if args.wrong_pins > 0 {
        PinPolicy::TypeWrong(args.wrong_pins)
    } else {
        PinPolicy::TypeDisplayed
    };

    let network = LoopbackNetwork::new();
    let board = PinBoard::new();
    let source_store = match &args.store {
        Some(path) => JsonTrustStore::with_path(path.clone())
            .map_err(|e| anyhow::anyhow!("Failed to open trust store: {}", e))?,
        None => JsonTrustStore::in_memory(),
    };
    let source = SimulatedDevice::spawn_with_store(
        &network,
        source_local,
        config.clone(),
        ScriptedPrompt::new(board.clone()).with_pin(pin),
        source_store,
    );
    let sink = SimulatedDevice::spawn(
        &network,
        sink_local,
        config,
        ScriptedPrompt::new(board).with_confirm(confirm),
    );

    if auth_type == AuthType::ImportAuthCode {
        let code = source.manager.export_auth_code();
        source.manager.import_auth_code(&args.pkg, &code)?;
        sink.manager.import_auth_code(&args.pkg, &code)?;
        info!("Imported auth code on both devices");
    }

    let extra = format!(r#"{{"bindLevel": {}}}"#, level.as_i32());
    let timeout = Duration::from_secs(args.timeout);
    let mut failures = 0;
    for round in 1..=args.binds {
        let mut source_events = source.subscribe();
        let mut sink_events = sink.subscribe();

        println!();
        println!("  Bind {} of {}: {} -> {}", round, args.binds, SOURCE_UDID, SINK_UDID);
        let request_id =
            source
                .manager
                .authenticate_device(&args.pkg, auth_type, SINK_UDID, &extra)?;

        match wait_for_result(&mut source_events, request_id, timeout).await {
            Some(result) => {
                if result.result_code != DM_OK {
                    failures += 1;
                }
                print_result("source", &result);
            }
            None => {
                warn!("No result for request {} after {:?}", request_id, timeout);
                source.manager.stop_authenticate_device(&args.pkg).await.ok();
                failures += 1;
            }
        }
        if let Some(result) = wait_for_result(&mut sink_events, request_id, timeout).await {
            print_result("sink", &result);
        }
    }

    println!();
    print_trust(SOURCE_UDID, source.store.as_ref());
    print_trust(SINK_UDID, sink.store.as_ref());

    if args.unbind {
        match source.manager.unbind_device(&args.pkg, SINK_UDID, level) {
            Ok(Some(payload)) => {
                let removed = network.broadcast_relationship(SOURCE_UDID, &payload);
                println!();
                println!("  Unbound; peer dropped {} entr(ies)", removed);
            }
            Ok(None) => println!("  Unbound locally, nothing to propagate"),
            Err(e) => println!("  Unbind failed: {}", e),
        }
        print_trust(SOURCE_UDID, source.store.as_ref());
        print_trust(SINK_UDID, sink.store.as_ref());
    }
    println!();

    if failures > 0 {
        anyhow::bail!("{} of {} bind(s) failed", failures, args.binds);
    }
    Ok(())
}
