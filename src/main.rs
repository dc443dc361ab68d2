use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

use bgp_transport::error::TransportError;
use bgp_transport::net::BGP_PORT;
use bgp_transport::{
    Config, ConnectState, Listener, ListenerConfig, Outgoing, OutgoingConfig, Reactor,
    TransportEvent, DEFAULT_CONFIG_PATH,
};

/// Interval between two polls of the one-shot commands.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "bgp-transport")]
#[command(version)]
#[command(about = "Establish and accept TCP sessions for BGP peers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured peer and accept their connections
    Run {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },
    /// Accept connections on the given addresses and report them
    Listen {
        /// Local address to listen on (repeatable)
        #[arg(long = "host", required = true)]
        hosts: Vec<IpAddr>,

        #[arg(short, long, default_value_t = BGP_PORT)]
        port: u16,

        #[arg(long, default_value_t = 200)]
        backlog: i32,
    },
    /// Open one session to a peer and report whether it came up
    Connect {
        /// Peer address
        peer: IpAddr,

        /// Local address to connect from
        #[arg(short, long)]
        local: IpAddr,

        #[arg(short, long, default_value_t = BGP_PORT)]
        port: u16,

        /// TCP MD5 signature key
        #[arg(long)]
        md5: Option<String>,

        /// Outbound TTL (GTSM)
        #[arg(long)]
        ttl: Option<u8>,

        /// Enable TCP keepalive
        #[arg(long)]
        keepalive: bool,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing with RUST_LOG env filter (defaults to info if not set)
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let result = match cli.command {
        Commands::Run { config } => run(&config),
        Commands::Listen { hosts, port, backlog } => {
            listen(ListenerConfig::new(hosts).with_port(port).with_backlog(backlog))
        }
        Commands::Connect {
            peer,
            local,
            port,
            md5,
            ttl,
            keepalive,
            timeout,
        } => {
            let mut config = OutgoingConfig::new(peer, local)
                .with_port(port)
                .with_keepalive(keepalive);
            if let Some(key) = md5 {
                config = config.with_signature_key(key);
            }
            if let Some(ttl) = ttl {
                config = config.with_ttl(ttl);
            }
            connect(config, Duration::from_secs(timeout))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(config_path: &str) -> Result<(), TransportError> {
    let config = Config::from_file(config_path)?;
    info!(
        peers = config.peers.len(),
        listen = ?config.listener.hosts,
        keepalive = config.tcp.keepalive,
        "Loaded configuration from {}",
        config_path
    );

    let (events_tx, mut events_rx) = mpsc::channel::<TransportEvent>(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reactor = Reactor::new(&config, events_tx, shutdown_rx)?;
    let reactor_task = tokio::spawn(reactor.run());

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Received shutdown signal, stopping...");
        let _ = shutdown_tx.send(true);
    });

    // The BGP session layer is not part of this binary: report and close.
    while let Some(event) = events_rx.recv().await {
        match event {
            TransportEvent::Established {
                direction,
                peer,
                local,
                stream,
            } => {
                info!(peer = %peer, local = %local, "{} session with {} ready", direction, peer);
                drop(stream);
            }
            TransportEvent::ConnectFailed { peer, retry_in } => {
                warn!(peer = %peer, "Could not connect to {}, retrying in {:?}", peer, retry_in);
            }
        }
    }

    match reactor_task.await {
        Ok(result) => result.map_err(TransportError::from),
        Err(e) => Err(TransportError::Io(std::io::Error::other(e.to_string()))),
    }
}

#[tokio::main]
async fn listen(config: ListenerConfig) -> Result<(), TransportError> {
    let mut listener = Listener::new(config);
    listener.start()?;

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticker = interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Some(incoming) = listener.connected()? {
                    println!("{} from {} to {}", incoming.name(), incoming.peer(), incoming.local());
                }
            }
            _ = &mut shutdown => break,
        }
    }

    listener.stop();
    Ok(())
}

#[tokio::main]
async fn connect(config: OutgoingConfig, limit: Duration) -> Result<(), TransportError> {
    let peer = config.peer_addr();
    let mut outgoing = Outgoing::new(config);
    if !outgoing.is_initialized() {
        return Err(TransportError::Io(std::io::Error::other(format!(
            "could not start connecting to {}",
            peer
        ))));
    }

    let polled = timeout(limit, async {
        let mut ticker = interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let state = outgoing.establish();
            if state.is_terminal() {
                return state;
            }
        }
    })
    .await;

    match polled {
        Ok(ConnectState::Ready) => {
            println!("{} connected from {}", outgoing.connection().name(), outgoing.connection().local());
            outgoing.close();
            Ok(())
        }
        Ok(_) => Err(TransportError::Io(std::io::Error::other(format!(
            "could not connect to {}",
            peer
        )))),
        Err(_) => {
            outgoing.close();
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connection to {} timed out", peer),
            )))
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT/Ctrl+C).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        _ => {
            error!("Failed to register signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}
