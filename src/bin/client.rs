//! CFP 클라이언트 - Chunked File Protocol
//!
//! 감시 파일(input.txt)에 새로 추가된 이름을 주기적으로 내려받거나,
//! `--get`으로 지정한 파일만 한 번 내려받는다.
//!
//! 사용법:
//!   cargo run --release --bin cfp-client -- [OPTIONS]
//!
//! 예시:
//!   # TCP, input.txt 감시
//!   cargo run --release --bin cfp-client -- --server 192.168.0.10
//!
//!   # UDP, 두 파일만 내려받기
//!   cargo run --release --bin cfp-client -- -s 192.168.0.10 -t udp --get a.bin b.bin -d ./downloads

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cfp::watch::WatchList;
use cfp::{Config, DownloadReport, Error, TcpClient, UdpClient};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Lan,
    Lossy,
}

/// CFP file client
#[derive(Debug, Parser)]
#[command(name = "cfp-client", version)]
struct Args {
    /// Server host or host:port (prompted when omitted)
    #[arg(short, long)]
    server: Option<String>,

    /// Transport to use
    #[arg(short, long, value_enum, default_value = "tcp")]
    transport: Transport,

    /// Port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Download directory
    #[arg(short, long, default_value = ".")]
    dest: PathBuf,

    /// Watch file listing names to download
    #[arg(long, default_value = "input.txt")]
    watch: PathBuf,

    /// Download these files once and exit instead of watching
    #[arg(long, num_args = 1..)]
    get: Vec<String>,

    /// Parallel chunk workers (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in config preset (ignored when --config is given)
    #[arg(long, value_enum)]
    preset: Option<Preset>,
}

fn load_config(args: &Args) -> cfp::Result<Config> {
    let mut config = match (&args.config, args.preset) {
        (Some(path), _) => Config::load(path)?,
        (None, Some(Preset::Lan)) => Config::lan(),
        (None, Some(Preset::Lossy)) => Config::lossy_network(),
        (None, None) => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn prompt_host() -> std::io::Result<String> {
    print!("Server host: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// `host`, `host:port`, 또는 IP 주소 해석
async fn resolve(server: &str, port: u16) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, port)
    };
    tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| format!("cannot resolve {}", server).into())
}

/// 전송 방식별 세션
enum Session {
    Tcp(TcpClient),
    Udp(UdpClient),
}

impl Session {
    async fn open(transport: Transport, server: SocketAddr, config: Config) -> cfp::Result<Self> {
        match transport {
            Transport::Tcp => Ok(Session::Tcp(TcpClient::connect(server, config).await?)),
            Transport::Udp => Ok(Session::Udp(UdpClient::connect(server, config).await?)),
        }
    }

    async fn catalog(&self) -> cfp::Result<Vec<String>> {
        match self {
            Session::Tcp(client) => Ok(client.catalog().to_vec()),
            Session::Udp(client) => client.list_files().await,
        }
    }

    async fn fetch(&mut self, name: &str, dest: &Path) -> cfp::Result<DownloadReport> {
        match self {
            Session::Tcp(client) => client.fetch(name, dest).await,
            Session::Udp(client) => client.fetch(name, dest).await,
        }
    }

    async fn close(self) -> cfp::Result<()> {
        match self {
            Session::Tcp(client) => client.quit().await,
            Session::Udp(client) => client.disconnect().await,
        }
    }
}

/// 파일 하나 내려받기. Ctrl-C면 false
async fn fetch_one(session: &mut Session, name: &str, dest_dir: &Path) -> bool {
    let dest = dest_dir.join(name);
    info!("Downloading '{}'...", name);

    let outcome = tokio::select! {
        result = session.fetch(name, &dest) => result,
        _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
    };

    match outcome {
        Err(Error::Cancelled) => {
            warn!("'{}' cancelled", name);
            return false;
        }
        Ok(report) => info!(
            "'{}' saved to {:?} ({} bytes, {:.2} MB/s)",
            name,
            report.dest,
            report.file_size,
            report.throughput() / 1_000_000.0
        ),
        Err(Error::NotFound(_)) => warn!("'{}' not found on server", name),
        Err(e @ Error::ChunkFailed { .. }) => error!("{}", e),
        Err(e) => error!("transfer failed: {}", e),
    }
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = load_config(&args)?;

    let host = match &args.server {
        Some(server) => server.clone(),
        None => prompt_host()?,
    };
    let server = resolve(&host, config.port).await?;
    let watch_interval = Duration::from_millis(config.watch_interval_ms);

    info!("CFP Client starting...");
    info!("Server address: {} ({:?})", server, args.transport);
    std::fs::create_dir_all(&args.dest)?;

    let opened = tokio::select! {
        result = Session::open(args.transport, server, config) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let mut session = match opened {
        Some(result) => result?,
        None => return Ok(()),
    };

    let catalog = session.catalog().await?;
    info!("Server catalog ({} files):", catalog.len());
    for name in &catalog {
        info!("  {}", name);
    }

    if !args.get.is_empty() {
        for name in &args.get {
            if !fetch_one(&mut session, name, &args.dest).await {
                break;
            }
        }
        session.close().await?;
        return Ok(());
    }

    let mut watch = WatchList::new(&args.watch);
    info!("Watching {:?} every {:?}. Press Ctrl+C to stop.", watch.path(), watch_interval);
    'watch: loop {
        let names = watch.poll();
        if names.is_empty() {
            info!("No new files to download");
        }
        for name in names {
            let keep_going = fetch_one(&mut session, &name, &args.dest).await;
            watch.mark_handled(&name);
            if !keep_going {
                break 'watch;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(watch_interval) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await?;
    info!("Client stopped");
    Ok(())
}
