//! Burrow CLI
//!
//! One binary, one sub-command per tunnel mode plus the echo/heavy/bot side
//! programs. Usage and configuration errors exit with status 1.

use anyhow::{anyhow, Result};
use burrow::config::{
    parse_endpoint, parse_forward, CtrlMode, ForwardInfo, IpMask, TunnelMode, TunnelParam,
};
use burrow::crypto::{ENC_ALWAYS, ENC_NEVER};
use burrow::service;
use burrow::tunnel::SessionManager;
use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Reconnectable, multiplexed TCP tunnel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Tunnel endpoint: host:port or :port
    server: String,

    /// Forwarded ports: listen-endpoint,target-endpoint
    forwards: Vec<String>,

    /// Handshake password
    #[arg(long, default_value = "hogehoge")]
    pass: String,

    /// Packet encryption password (empty disables encryption)
    #[arg(long = "encPass", default_value = "hogehoge")]
    enc_pass: String,

    /// Packets to encrypt per connection: -1 always, 0 never, N budget
    #[arg(long = "encCount", default_value_t = 1000, allow_hyphen_values = true)]
    enc_count: i64,

    /// Allowed peer networks, CIDR (repeatable; empty allows all)
    #[arg(long = "ip")]
    ip: Vec<String>,

    /// Keepalive interval in seconds (minimum 2)
    #[arg(long = "int", default_value_t = 20)]
    interval: u64,

    /// Control mode: bench for the frame echo benchmark
    #[arg(long = "ctrl", default_value = "")]
    ctrl: String,

    /// Profiling endpoint (:port); accepted but not built in
    #[arg(long = "prof")]
    prof: Option<String>,

    /// Session-dump console endpoint (:port)
    #[arg(long = "console")]
    console: Option<String>,

    /// User-Agent for the WebSocket handshake
    #[arg(long = "UA", default_value = "Burrow Client")]
    user_agent: String,

    /// HTTP proxy for the WebSocket client (host:port)
    #[arg(long = "proxy")]
    proxy: Option<String>,

    /// Debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tunnel server; dials forward targets requested by the client
    Server(CommonArgs),
    /// Reverse tunnel server; hosts the forward listeners
    #[command(name = "r-server")]
    ReverseServer(CommonArgs),
    /// Tunnel server over WebSocket
    Wsserver(CommonArgs),
    /// Reverse tunnel server over WebSocket
    #[command(name = "r-wsserver")]
    ReverseWsServer(CommonArgs),
    /// Tunnel client; hosts the forward listeners
    Client(CommonArgs),
    /// Reverse tunnel client; dials forward targets for the server
    #[command(name = "r-client")]
    ReverseClient(CommonArgs),
    /// Tunnel client over WebSocket
    Wsclient(CommonArgs),
    /// Reverse tunnel client over WebSocket
    #[command(name = "r-wsclient")]
    ReverseWsClient(CommonArgs),
    /// TCP echo server
    Echo(CommonArgs),
    /// Load-source server streaming random data
    Heavy(CommonArgs),
    /// Soak client bouncing bursts off an echo endpoint
    Bot(CommonArgs),
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Command::Server(args)
            | Command::ReverseServer(args)
            | Command::Wsserver(args)
            | Command::ReverseWsServer(args)
            | Command::Client(args)
            | Command::ReverseClient(args)
            | Command::Wsclient(args)
            | Command::ReverseWsClient(args)
            | Command::Echo(args)
            | Command::Heavy(args)
            | Command::Bot(args) => args,
        }
    }

    fn mode(&self) -> Option<TunnelMode> {
        match self {
            Command::Server(_) => Some(TunnelMode::Server),
            Command::ReverseServer(_) => Some(TunnelMode::ReverseServer),
            Command::Wsserver(_) => Some(TunnelMode::WsServer),
            Command::ReverseWsServer(_) => Some(TunnelMode::ReverseWsServer),
            Command::Client(_) => Some(TunnelMode::Client),
            Command::ReverseClient(_) => Some(TunnelMode::ReverseClient),
            Command::Wsclient(_) => Some(TunnelMode::WsClient),
            Command::ReverseWsClient(_) => Some(TunnelMode::ReverseWsClient),
            Command::Echo(_) | Command::Heavy(_) | Command::Bot(_) => None,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        if matches!(
            err.kind(),
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
        ) {
            err.exit();
        }
        let _ = err.print();
        std::process::exit(1);
    });

    init_logging(cli.command.common().verbose);

    if let Err(err) = run(cli).await {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let args = cli.command.common();
    let server = parse_endpoint(&args.server).map_err(|e| anyhow!("{}", e))?;

    // Side programs need no tunnel parameters.
    match &cli.command {
        Command::Echo(_) => return Ok(service::start_echo_server(server.port).await?),
        Command::Heavy(_) => return Ok(service::start_heavy_server(server.port).await?),
        Command::Bot(_) => return Ok(service::run_bot(&server.to_addr()).await?),
        _ => {}
    }

    let mode = cli
        .command
        .mode()
        .expect("tunnel sub-commands carry a mode");

    let forwards = args
        .forwards
        .iter()
        .map(|text| parse_forward(text))
        .collect::<Result<Vec<ForwardInfo>, _>>()
        .map_err(|e| anyhow!("{}", e))?;
    if mode.hosts_forwards() && forwards.is_empty() {
        return Err(anyhow!("mode {} needs at least one forward (listen,target)", mode));
    }
    if !mode.hosts_forwards() && !forwards.is_empty() {
        warn!("mode {} ignores forwards; the peer defines them", mode);
    }

    let ctrl = match args.ctrl.as_str() {
        "" => CtrlMode::Normal,
        "bench" => CtrlMode::Bench,
        other => return Err(anyhow!("unknown ctrl mode '{}'", other)),
    };

    match args.enc_count {
        ENC_ALWAYS | ENC_NEVER => {}
        n if n > 0 => {}
        n => return Err(anyhow!("illegal encCount {}", n)),
    }
    if args.interval < 2 {
        return Err(anyhow!("keepalive interval must be at least 2 seconds"));
    }

    let mask = IpMask::parse(&args.ip).map_err(|e| anyhow!("{}", e))?;

    let mut param = TunnelParam::new(
        (!args.pass.is_empty()).then(|| args.pass.clone()),
        mode,
        mask,
        (!args.enc_pass.is_empty()).then(|| args.enc_pass.clone()),
        args.enc_count,
        args.interval * 1000,
        ctrl,
        server,
    );
    param.user_agent = args.user_agent.clone();
    param.proxy = args.proxy.clone();

    if let Some(prof) = &args.prof {
        warn!("profiling endpoint {} requested; not built in", prof);
    }

    let manager = SessionManager::new();
    if let Some(console) = &args.console {
        service::spawn_console(console.clone(), manager.clone());
    }

    service::run(param, forwards, manager).await?;
    Ok(())
}
