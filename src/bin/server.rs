//! CFP 서버 - Chunked File Protocol
//!
//! 카탈로그에 등록된 파일을 TCP 또는 UDP로 제공
//!
//! 사용법:
//!   cargo run --release --bin cfp-server -- [OPTIONS]
//!
//! 예시:
//!   # TCP, 현재 디렉토리의 files.txt
//!   cargo run --release --bin cfp-server
//!
//!   # UDP, 손실 많은 네트워크 설정
//!   cargo run --release --bin cfp-server -- --transport udp --preset lossy --root ./share

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cfp::{Catalog, Config, TcpServer, UdpServer};

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

/// CFP file server
#[derive(Debug, Parser)]
#[command(name = "cfp-server", version)]
struct Args {
    /// Transport to serve
    #[arg(short, long, value_enum, default_value = "tcp")]
    transport: Transport,

    /// Bind host
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding the served files
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Newline-delimited list of served file names
    #[arg(long, default_value = "files.txt")]
    catalog: PathBuf,

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
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = load_config(&args)?;
    let addr = SocketAddr::new(args.host, config.port);

    let catalog = Catalog::load(&args.root, &args.catalog)?;
    info!("CFP Server starting...");
    info!("Root: {:?}", args.root);
    info!("Catalog: {} files from {:?}", catalog.names().len(), args.catalog);
    for name in catalog.names() {
        info!("  {}", name);
    }

    match args.transport {
        Transport::Tcp => {
            let server = TcpServer::bind(addr, catalog, config).await?;
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Server stopped"),
            }
        }
        Transport::Udp => {
            let server = UdpServer::bind(addr, catalog, config).await?;
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Server stopped"),
            }
        }
    }

    Ok(())
}
