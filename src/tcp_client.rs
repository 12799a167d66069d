//! TCP 클라이언트
//!
//! 세션 연결 하나로 핸드셰이크하고, 청크마다 별도 연결을 열어 병렬 수신한다.
//! 모든 청크 워커는 프레임 라운드마다 랑데부 배리어에서 만난다.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::barrier::RoundBarrier;
use crate::chunk::{plan_chunks, ChunkBuffer, ChunkJob, CompletedChunk};
use crate::fetcher::{self, DownloadReport};
use crate::framing::{self, StreamFrame, CONTROL_MAX};
use crate::message::{parse_catalog, parse_file_size, ChunkRequest, Reply, Request};
use crate::stats::TransferStats;
use crate::{Config, Error, Result, MAX_STREAM_FRAME};

/// TCP 파일 클라이언트
pub struct TcpClient {
    stream: TcpStream,
    server: SocketAddr,
    config: Config,
    catalog: Vec<String>,
}

impl TcpClient {
    /// 세션 연결 후 카탈로그 수신
    pub async fn connect(server: SocketAddr, config: Config) -> Result<Self> {
        config.validate()?;
        let mut stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;

        framing::write_request(&mut stream, &Request::Client).await?;
        let blob = framing::read_frame_timed(&mut stream, CONTROL_MAX, config.control_timeout())
            .await?
            .into_control()?;
        let catalog = parse_catalog(&blob);
        info!("서버 {} 연결, 카탈로그 {}개", server, catalog.len());

        Ok(Self {
            stream,
            server,
            config,
            catalog,
        })
    }

    pub fn catalog(&self) -> &[String] {
        &self.catalog
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// 파일 요청: OK 후 크기 검증, 또는 NOT_FOUND
    pub async fn request_file(&mut self, name: &str) -> Result<u64> {
        framing::write_request(&mut self.stream, &Request::File(name.to_string())).await?;

        let timeout = self.config.control_timeout();
        let text = framing::read_frame_timed(&mut self.stream, CONTROL_MAX, timeout)
            .await?
            .into_control()?;
        match Reply::parse(&text)? {
            Reply::Ok => {}
            Reply::NotFound => return Err(Error::NotFound(name.to_string())),
            other => return Err(Error::protocol(format!("OK/NOT_FOUND 대신 {}", other))),
        }

        let mut attempts = 0;
        loop {
            let text = framing::read_frame_timed(&mut self.stream, CONTROL_MAX, timeout)
                .await?
                .into_control()?;
            // 0은 빈 파일로 유효하다. 상한을 넘는 크기는 잘못된 크기로 재전송을 요청한다.
            match parse_file_size(&text).and_then(|size| self.config.check_file_size(size)) {
                Ok(size) => {
                    framing::write_request(&mut self.stream, &Request::ValidFileSize).await?;
                    return Ok(size);
                }
                Err(e) if attempts < self.config.size_retries => {
                    attempts += 1;
                    warn!("{}, 재전송 요청 ({})", e, attempts);
                    framing::write_request(&mut self.stream, &Request::InvalidFileSize).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 병렬 청크 다운로드 (세션 연결은 건드리지 않음)
    pub async fn download(&self, name: &str, file_size: u64, dest: &Path) -> Result<DownloadReport> {
        let jobs = plan_chunks(file_size, self.config.workers);
        // 빈 청크는 로컬에서 완료되므로 배리어에 참여하지 않음
        let parties = jobs.iter().filter(|job| !job.is_empty()).count();
        let barrier = Arc::new(RoundBarrier::new(parties));
        let stats = Arc::new(TransferStats::new(name, file_size, &jobs));
        let reporter = stats.spawn_reporter(Duration::from_millis(self.config.progress_interval_ms));

        let server = self.server;
        let config = self.config.clone();
        let file = name.to_string();
        let worker_stats = stats.clone();
        let result = fetcher::download(dest, file_size, self.config.workers, move |job| {
            fetch_chunk(
                server,
                file.clone(),
                job,
                config.clone(),
                barrier.clone(),
                worker_stats.clone(),
            )
        })
        .await;

        reporter.abort();
        info!("{}", stats.summary());
        result
    }

    /// 요청 → 다운로드 → DONE (실패 시 CANCEL)
    pub async fn fetch(&mut self, name: &str, dest: &Path) -> Result<DownloadReport> {
        let size = self.request_file(name).await?;
        match self.download(name, size, dest).await {
            Ok(report) => {
                self.done().await?;
                Ok(report)
            }
            Err(e) => {
                self.cancel().await?;
                Err(e)
            }
        }
    }

    pub async fn done(&mut self) -> Result<()> {
        framing::write_request(&mut self.stream, &Request::Done).await
    }

    pub async fn cancel(&mut self) -> Result<()> {
        framing::write_request(&mut self.stream, &Request::Cancel).await
    }

    /// 세션 종료
    pub async fn quit(mut self) -> Result<()> {
        framing::write_request(&mut self.stream, &Request::Quit).await?;
        info!("세션 종료: {}", self.server);
        Ok(())
    }
}

/// 청크 워커: 성공 시 배리어 이탈, 실패 시 배리어 중단
async fn fetch_chunk(
    server: SocketAddr,
    file: String,
    job: ChunkJob,
    config: Config,
    barrier: Arc<RoundBarrier>,
    stats: Arc<TransferStats>,
) -> Result<CompletedChunk> {
    let result = receive_chunk(server, &file, job, &config, &barrier, &stats).await;
    match &result {
        Ok(_) => barrier.leave(),
        Err(e) => {
            if !e.is_secondary() {
                debug!("chunk {} 실패, 배리어 중단: {}", job.index, e);
            }
            barrier.abandon();
        }
    }
    result
}

async fn receive_chunk(
    server: SocketAddr,
    file: &str,
    job: ChunkJob,
    config: &Config,
    barrier: &RoundBarrier,
    stats: &TransferStats,
) -> Result<CompletedChunk> {
    let mut stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;
    let timeout = config.control_timeout();

    framing::write_request(&mut stream, &Request::Chunk).await?;
    framing::expect_reply(&mut stream, Reply::Ready, timeout).await?;

    let request = ChunkRequest::for_job(file, &job)
        .ok_or_else(|| Error::protocol(format!("빈 청크 요청: {}", job)))?;
    framing::write_request(&mut stream, &Request::ChunkRequest(request)).await?;
    framing::expect_reply(&mut stream, Reply::DataStart, timeout).await?;
    framing::write_request(&mut stream, &Request::ReadyForData).await?;

    let mut buffer = ChunkBuffer::new(job);
    loop {
        match framing::read_frame_timed(&mut stream, MAX_STREAM_FRAME, config.ack_timeout()).await? {
            StreamFrame::Data(data) => {
                buffer.append(&data)?;
                stats.record_accepted(job.index, data.len());
                framing::write_request(&mut stream, &Request::DataAck).await?;
                barrier.wait(config.barrier_timeout()).await?;
            }
            StreamFrame::Control(text) => {
                Reply::expect(&text, Reply::DataEnd)?;
                break;
            }
        }
    }

    if !buffer.is_complete() {
        return Err(Error::IncompleteChunk {
            index: job.index,
            received: buffer.received(),
            expected: job.size,
        });
    }
    debug!("chunk {} 수신 완료 ({} bytes)", job.index, buffer.received());
    Ok(buffer.freeze())
}
