//! Terminal demo for Pinlock.
//!
//! ```text
//! pin-console serve [BIND] [--pins 1234,5678] [--heartbeat-timeout-secs 30]
//! pin-console client [URL] [--device-id-file PATH] [--user-agent UA]
//! ```
//!
//! Every option can also come from a `PINLOCK_*` environment variable (see
//! `--help`). `RUST_LOG` sets the log filter, default `info`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pinlock::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "pin-console", about = "Pinlock authority and device console", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an arbitration authority.
    Serve(ServeArgs),
    /// Run a device, reading commands from stdin.
    Client(ClientArgs),
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(env = "PINLOCK_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Accepted PINs. Any well-formed PIN is accepted when unset.
    #[arg(long, env = "PINLOCK_PINS", value_delimiter = ',')]
    pins: Vec<String>,

    /// Seconds a holder may go without a heartbeat.
    #[arg(long, env = "PINLOCK_HEARTBEAT_TIMEOUT_SECS", default_value_t = 30)]
    heartbeat_timeout_secs: u64,
}

#[derive(Debug, clap::Args)]
struct ClientArgs {
    /// Authority URL.
    #[arg(env = "PINLOCK_URL", default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Where the device id is kept. Defaults to the local data directory.
    #[arg(long, env = "PINLOCK_DEVICE_ID_FILE")]
    device_id_file: Option<PathBuf>,

    /// Label the device from a browser user-agent instead of the local
    /// platform.
    #[arg(long, env = "PINLOCK_USER_AGENT")]
    user_agent: Option<String>,
}

// ---------------------------------------------------------------------------
// Authority
// ---------------------------------------------------------------------------

async fn serve(args: ServeArgs) -> Result<(), BoxError> {
    let pins: Vec<String> = args
        .pins
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    let builder = AuthorityBuilder::new()
        .bind(&args.bind)
        .session_config(SessionConfig {
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
            ..SessionConfig::default()
        });

    if pins.is_empty() {
        tracing::warn!("no PINs configured, accepting any well-formed PIN");
        run_authority(builder, FormatOnly).await
    } else {
        let verifier = AllowList::new(&pins)?;
        tracing::info!(accepted = verifier.len(), "using PIN allow-list");
        run_authority(builder, verifier).await
    }
}

async fn run_authority<V: PinVerifier>(
    builder: AuthorityBuilder,
    verifier: V,
) -> Result<(), BoxError> {
    let authority = builder.build(verifier).await?;
    eprintln!("pinlock authority listening on {}", authority.local_addr()?);
    authority
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Login(String),
    Logout,
    Retry,
    Verify(String),
    Status,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Option<Input> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    let arg = parts.next().unwrap_or("").to_string();
    Some(match cmd {
        "login" => Input::Login(arg),
        "logout" => Input::Logout,
        "retry" => Input::Retry,
        "verify" => Input::Verify(arg),
        "status" => Input::Status,
        "quit" | "exit" => Input::Quit,
        _ => Input::Help,
    })
}

const HELP: &str = "commands: login <pin> | logout | retry | verify <pin> | status | quit";

fn load_identity(args: &ClientArgs) -> Result<DeviceIdentity, BoxError> {
    let store = match &args.device_id_file {
        Some(path) => FileDeviceIdStore::new(path.clone()),
        None => FileDeviceIdStore::default_location()
            .ok_or("no local data directory; pass --device-id-file")?,
    };
    let mut identity = DeviceIdentity::load(&store)?;
    if let Some(ua) = &args.user_agent {
        identity.details = DeviceDetails::from_user_agent(ua);
    }
    Ok(identity)
}

async fn client(args: ClientArgs) -> Result<(), BoxError> {
    let identity = load_identity(&args)?;
    eprintln!(
        "device {} ({}) -> {}",
        identity.device_id.short(),
        identity.label(),
        args.url
    );

    let connector = WebSocketConnector::new(args.url.clone());
    let (session, mut notices) =
        SessionClient::start(connector, identity, ChannelConfig::default());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("{HELP}");

    loop {
        tokio::select! {
            Some(notice) = notices.recv() => {
                println!("* {notice}");
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let Some(input) = parse_input(&line) else { continue };
                match input {
                    Input::Login(pin) => report(session.submit_pin(&pin).await),
                    Input::Logout => report(session.logout().await),
                    Input::Retry => report(session.retry()),
                    Input::Verify(pin) => {
                        let connector = WebSocketConnector::new(args.url.clone());
                        let result = match pinlock::protocol::Pin::parse(&pin) {
                            Ok(pin) => verify_pin(&connector, &pin, Duration::from_secs(5)).await,
                            Err(e) => Err(e.into()),
                        };
                        match result {
                            Ok(()) => println!("PIN is valid"),
                            Err(e) => println!("! {e}"),
                        }
                    }
                    Input::Status => println!(
                        "session: {}, link: {:?}",
                        session.state(),
                        session.connection_state().state
                    ),
                    Input::Quit => break,
                    Input::Help => println!("{HELP}"),
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn report(result: Result<(), ClientError>) {
    if let Err(e) = result {
        println!("! {e}");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Client(args) => client(args).await,
    }
}
