//! # CFP (Chunked File Protocol)
//!
//! 고정 개수의 병렬 청크로 파일을 나누어 전송하는 파일 배포 프로토콜
//!
//! ## 핵심 특징
//! - **병렬 청크**: 파일을 N개의 연속 바이트 범위로 분할, 워커당 하나씩 동시 수신
//! - **두 가지 전송**: TCP (lockstep + 랑데부 배리어) / UDP (자체 ARQ)
//! - **ARQ**: 시퀀스 번호 + SHA-256 다이제스트, 적응형 타임아웃, 마지막 확인 지점부터 재전송
//! - **세션 승인**: UDP 서버는 활성 클라이언트 하나 + FIFO 대기열
//! - **원자적 조립**: 크기 검증 후에만 파일 기록

pub mod arq;
pub mod barrier;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod framing;
pub mod message;
pub mod session;
pub mod sim;
pub mod stats;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp_client;
pub mod udp_server;
pub mod watch;

pub use arq::{ArqReceiver, Frame, FrameReader, Verdict};
pub use barrier::RoundBarrier;
pub use catalog::{Catalog, CatalogEntry};
pub use chunk::{plan_chunks, ChunkBuffer, ChunkJob, CompletedChunk};
pub use config::Config;
pub use error::{Error, Result};
pub use fetcher::{download, fetch_chunks, DownloadReport};
pub use message::{ChunkRequest, Reply, Request};
pub use session::{Admission, AdmissionController, SessionContext, SessionState};
pub use stats::TransferStats;
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use udp_client::UdpClient;
pub use udp_server::UdpServer;

/// 기본 서버 포트
pub const DEFAULT_PORT: u16 = 65432;

/// 기본 병렬 워커 수 (파일당 청크 수)
pub const DEFAULT_WORKERS: usize = 4;

/// 시퀀스 번호 크기 (바이트)
pub const SEQ_LEN: usize = 4;

/// SHA-256 다이제스트 크기 (바이트)
pub const DIGEST_LEN: usize = 32;

/// 데이터 프레임 헤더 크기 (seq + digest)
pub const FRAME_HEADER_LEN: usize = SEQ_LEN + DIGEST_LEN;

/// UDP 데이터그램 최대 크기 (IPv4)
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// TCP 프레임 최대 길이 (16MB)
pub const MAX_STREAM_FRAME: usize = 16 * 1024 * 1024;
