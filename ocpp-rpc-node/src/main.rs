//! OCPP RPC Node - CLI for a central system or networking node
//!
//! # Usage
//!
//! ```bash
//! # Central system accepting OCPP 1.6 stations
//! ocpp-rpc-node --identity CSMS --listen 0.0.0.0:9000 --subprotocol ocpp1.6
//!
//! # Networking node: accepts stations below, connects up to the CSMS
//! ocpp-rpc-node --identity NN1 --routed --listen 0.0.0.0:9100 \
//!     --uplink-url ws://csms.local:9000/ocpp --uplink-identity CSMS
//!
//! # Require credentials and signed messages
//! ocpp-rpc-node --identity CSMS --listen 0.0.0.0:9000 \
//!     --basic-auth CP001:s3cret --hmac-key csms:shared-secret --require-signed
//! ```

use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use ocpp_rpc::actions::{
    BootNotificationRequest, BootNotificationResponse, HeartbeatRequest, HeartbeatResponse, RegistrationStatus,
};
use ocpp_rpc::{
    AllowAll, BasicAuth, ConnectionEvent, Endpoint, EndpointConfig, HmacSignatures, Listener, Uplink, UplinkConfig,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Heartbeat interval handed to stations on boot
const HEARTBEAT_INTERVAL_SECS: i32 = 300;

/// OCPP message-exchange node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Own identity (hop name when routing)
    #[arg(short, long, default_value = "CSMS")]
    identity: String,

    /// Address to accept WebSocket peers on
    #[arg(short, long)]
    listen: Option<String>,

    /// OCPP subprotocol token
    #[arg(long, default_value = "ocpp2.0.1")]
    subprotocol: String,

    /// Speak the networking-node framing (destination + network path)
    #[arg(long)]
    routed: bool,

    /// Upstream WebSocket URL (without identity)
    #[arg(long)]
    uplink_url: Option<String>,

    /// Identity the upstream peer is registered under
    #[arg(long, default_value = "CSMS")]
    uplink_identity: String,

    /// Basic-auth password presented upstream
    #[arg(long)]
    uplink_password: Option<String>,

    /// Static route DEST=VIA (can be repeated)
    #[arg(long, value_parser = parse_route)]
    route: Vec<(String, String)>,

    /// Accepted credentials ID:PASSWORD (can be repeated)
    #[arg(long, value_parser = parse_pair)]
    basic_auth: Vec<(String, String)>,

    /// HMAC-SHA256 signing key KEYID:SECRET
    #[arg(long, value_parser = parse_pair)]
    hmac_key: Option<(String, String)>,

    /// Reject unsigned messages (needs --hmac-key)
    #[arg(long)]
    require_signed: bool,

    /// Default request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins if set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_route(s: &str) -> Result<(String, String), String> {
    split_pair(s, '=').ok_or_else(|| format!("expected DEST=VIA, got {s:?}"))
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    split_pair(s, ':').ok_or_else(|| format!("expected NAME:VALUE, got {s:?}"))
}

fn split_pair(s: &str, separator: char) -> Option<(String, String)> {
    let (left, right) = s.split_once(separator)?;
    if left.is_empty() || right.is_empty() {
        return None;
    }
    Some((left.to_string(), right.to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.listen.is_none() && args.uplink_url.is_none() {
        return Err("nothing to do: pass --listen and/or --uplink-url".into());
    }

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               OCPP RPC Node - Message Exchange               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Identity: {:<50} ║", args.identity);
    println!("║  Protocol: {:<50} ║", args.subprotocol);
    println!("║  Framing:  {:<50} ║", if args.routed { "routed" } else { "standard" });
    println!("║  Listen:   {:<50} ║", args.listen.as_deref().unwrap_or("-"));
    println!("║  Uplink:   {:<50} ║", truncate(args.uplink_url.as_deref().unwrap_or("-"), 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = EndpointConfig::new(args.identity.as_str())
        .with_subprotocol(&args.subprotocol)
        .with_request_timeout(Duration::from_secs(args.timeout_secs));
    if args.routed {
        config = config.routed();
    }
    for (destination, via) in &args.route {
        config = config.with_route(destination.as_str(), via.as_str());
        info!("Static route: {} via {}", destination, via);
    }
    if args.uplink_url.is_some() {
        config = config.with_default_uplink(args.uplink_identity.as_str());
    }

    let mut builder = Endpoint::builder(config);
    if let Some((key_id, secret)) = &args.hmac_key {
        builder = builder.with_signatures(
            HmacSignatures::new(key_id.as_str(), secret.as_bytes().to_vec()).require_signed(args.require_signed),
        );
    } else if args.require_signed {
        warn!("--require-signed has no effect without --hmac-key");
    }
    let endpoint = builder.build();

    register_handlers(&endpoint);

    // Lifecycle events
    let mut events = endpoint.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Bound {
                    identity,
                    connection,
                    replaced,
                }) => match replaced {
                    Some(old) => info!("{} rebound: connection {} replaces {}", identity, connection, old),
                    None => info!("{} bound to connection {}", identity, connection),
                },
                Ok(ConnectionEvent::Unbound { identity, connection }) => {
                    info!("{} unbound (connection {})", identity, connection)
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} lifecycle events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(url) = &args.uplink_url {
        let mut uplink = UplinkConfig::new(url.as_str(), args.identity.as_str())
            .with_upstream_identity(args.uplink_identity.as_str());
        if let Some(password) = &args.uplink_password {
            uplink = uplink.with_password(password.as_str());
        }
        tokio::spawn(Uplink::new(endpoint.clone(), uplink).run());
    }

    match &args.listen {
        Some(addr) => {
            let listener = if args.basic_auth.is_empty() {
                Listener::bind(addr, endpoint.clone(), AllowAll).await?
            } else {
                let auth = args
                    .basic_auth
                    .iter()
                    .fold(BasicAuth::new(), |auth, (id, password)| {
                        auth.with_credentials(id.as_str(), password.as_str())
                    });
                info!("Basic authentication for {} identities", auth.len());
                Listener::bind(addr, endpoint.clone(), auth).await?
            };

            tokio::select! {
                result = listener.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
    }

    Ok(())
}

/// Accept every station that boots and answer its heartbeats
fn register_handlers(endpoint: &Endpoint) {
    let dispatcher = endpoint.dispatcher();

    dispatcher.subscribe::<HeartbeatRequest, _, _>(|_ctx, _request| async move {
        Ok(Some(HeartbeatResponse {
            current_time: Utc::now(),
        }))
    });

    dispatcher.subscribe::<BootNotificationRequest, _, _>(|ctx, request| async move {
        info!(
            "{} booted: {} {} ({:?})",
            ctx.origin, request.charging_station.vendor_name, request.charging_station.model, request.reason
        );
        Ok(Some(BootNotificationResponse {
            current_time: Utc::now(),
            interval: HEARTBEAT_INTERVAL_SECS,
            status: RegistrationStatus::Accepted,
            status_info: None,
        }))
    });
}

/// Fit `s` into `max_len` characters, ending in an ellipsis when cut
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let cut = s.char_indices().nth(keep).map(|(i, _)| i).unwrap_or(s.len());
    format!("{}...", &s[..cut])
}
