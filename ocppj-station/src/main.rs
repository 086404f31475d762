//! OCPP-J Station - CLI charging station node
//!
//! Connects to a CSMS over WebSocket, registers with BootNotification,
//! keeps the link alive with Heartbeat and answers DataTransfer calls by
//! echoing their data. Reconnects with exponential backoff.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! ocppj-station --station CS001
//!
//! # Connect to a specific CSMS
//! ocppj-station --station CS001 \
//!     --csms-url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Verbose engine logs
//! RUST_LOG=ocppj_core=debug ocppj-station --station CS001
//! ```

use std::time::Duration;

use clap::Parser;
use ocppj_core::catalog::{
    self,
    data::{self, DataTransfer, DataTransferResponse, DataTransferStatus},
    provisioning::{
        BootNotification, BootNotificationRequest, BootReason, ChargingStationInfo, Heartbeat,
        HeartbeatRequest, RegistrationStatus,
    },
};
use ocppj_core::transport::station_url;
use ocppj_core::{
    ActionHandlers, Connection, ConnectionConfig, IdStrategy, OcppError, Role, WebSocketTransport,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP-J charging station node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charging station identity (appended to the CSMS URL)
    #[arg(short, long, default_value = "EK3-001")]
    station: String,

    /// CSMS WebSocket URL
    #[arg(long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService")]
    csms_url: String,

    /// WebSocket subprotocol
    #[arg(long, default_value = "ocpp2.0.1")]
    subprotocol: String,

    /// Vendor name
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "EK3-OCPP")]
    model: String,

    /// Serial number
    #[arg(long)]
    serial: Option<String>,

    /// Firmware version
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    firmware: String,

    /// Seconds to wait for a reply before a call times out
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Initial reconnect delay in seconds
    #[arg(long, default_value = "5")]
    reconnect_delay: u64,

    /// Maximum reconnect delay in seconds (backoff cap)
    #[arg(long, default_value = "300")]
    max_reconnect_delay: u64,

    /// Use random UUID message ids instead of sequential ones
    #[arg(long)]
    random_ids: bool,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
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

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP-J Station - Charging Station Node          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Station:  {:<50} ║", args.station);
    println!("║  CSMS URL: {:<50} ║", truncate(&args.csms_url, 50));
    println!("║  Protocol: {:<50} ║", args.subprotocol);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    tokio::select! {
        _ = run(&args) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    Ok(())
}

/// Connection loop with exponential backoff
async fn run(args: &Args) {
    let initial_delay = Duration::from_secs(args.reconnect_delay.max(1));
    let max_delay = Duration::from_secs(args.max_reconnect_delay.max(args.reconnect_delay));
    let mut reconnect_delay = initial_delay;

    loop {
        match run_session(args).await {
            Ok(true) => {
                info!("Session with CSMS ended");
                reconnect_delay = initial_delay;
            }
            Ok(false) => info!("Link closed before registration completed"),
            Err(e) => error!("Session error: {}", e),
        }

        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = next_delay(reconnect_delay, max_delay);
    }
}

/// Double the reconnect delay, capped at `max`
fn next_delay(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

/// One connection: boot, then heartbeat until the link ends
///
/// Returns whether the CSMS accepted the registration.
async fn run_session(args: &Args) -> Result<bool, OcppError> {
    let config = ConnectionConfig::new(Role::ChargingStation, &args.station)
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_id_strategy(if args.random_ids {
            IdStrategy::Random
        } else {
            IdStrategy::Sequential
        });

    let echo = ActionHandlers::new().on::<DataTransfer, _, _>(|req| async move {
        info!("DataTransfer from CSMS (vendor {})", req.vendor_id);
        Ok(DataTransferResponse {
            status: DataTransferStatus::Accepted,
            status_info: None,
            data: req.data,
        })
    });

    let conn = Connection::builder(config)
        .with_registry(catalog::registry()?)
        .with_handler(data::PROFILE, echo)
        .build()?;

    if let Some(mut errors) = conn.errors() {
        tokio::spawn(async move {
            let mut count = 0u64;
            while let Some(e) = errors.recv().await {
                count += 1;
                debug!("Anomaly #{} [{}]: {}", count, e.code(), e);
            }
        });
    }

    let transport = WebSocketTransport::new().with_subprotocol(&args.subprotocol);
    conn.start(&transport, &station_url(&args.csms_url, &args.station))
        .await?;

    let result = serve(&conn, args).await;
    conn.stop();
    result
}

async fn serve(conn: &Connection, args: &Args) -> Result<bool, OcppError> {
    let interval = loop {
        let response = conn.call::<BootNotification>(boot_request(args)).await?;
        match response.status {
            RegistrationStatus::Accepted => {
                info!("Registered with CSMS, heartbeat every {}s", response.interval);
                break response.interval;
            }
            status => {
                let retry = Duration::from_secs(response.interval.max(10) as u64);
                warn!("Registration {:?}, retrying in {:?}", status, retry);
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = conn.closed() => return Ok(false),
                }
            }
        }
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1) as u64));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match conn.call::<Heartbeat>(HeartbeatRequest {}).await {
                    Ok(response) => debug!("Heartbeat, CSMS time {}", response.current_time),
                    Err(OcppError::Cancelled) | Err(OcppError::QueueClosed) => break,
                    Err(e) => warn!("Heartbeat failed: {}", e),
                }
            }
            _ = conn.closed() => {
                info!("Link to CSMS closed");
                break;
            }
        }
    }

    Ok(true)
}

fn boot_request(args: &Args) -> BootNotificationRequest {
    BootNotificationRequest {
        charging_station: ChargingStationInfo {
            model: args.model.clone(),
            vendor_name: args.vendor.clone(),
            serial_number: args.serial.clone(),
            firmware_version: Some(args.firmware.clone()),
        },
        reason: BootReason::PowerUp,
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(300);
        assert_eq!(next_delay(Duration::from_secs(5), max), Duration::from_secs(10));
        assert_eq!(next_delay(Duration::from_secs(200), max), max);
    }

    #[test]
    fn test_backoff_saturates_with_huge_cap() {
        let max = Duration::from_secs(u64::MAX);
        let delay = next_delay(Duration::from_secs(u64::MAX / 2 + 1), max);
        assert_eq!(delay, max);
    }

    #[test]
    fn test_args_parse_defaults() {
        let args = Args::parse_from(["ocppj-station", "--station", "CS-9"]);
        assert_eq!(args.station, "CS-9");
        assert_eq!(args.request_timeout, 30);
        assert!(!args.random_ids);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ws://a-very-long-host/path", 10), "ws://a-...");
    }
}
