//! UDP 클라이언트
//!
//! - 컨트롤 소켓: CLIENT/LIST_FILES/파일 요청/DONE/OFF (타임아웃 시 재시도)
//! - 청크 워커마다 별도 소켓, ArqReceiver로 순서/무결성 보장

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::arq::{ArqReceiver, Datagram, ResumePoint, Verdict};
use crate::chunk::{ChunkJob, CompletedChunk};
use crate::fetcher::{self, DownloadReport};
use crate::message::{parse_catalog, parse_file_size, AckMessage, ChunkRequest, Reply, Request};
use crate::stats::TransferStats;
use crate::{Config, Error, Result, MAX_DATAGRAM_SIZE};

/// 서버 주소와 같은 계열의 임의 로컬 주소
fn local_any(server: SocketAddr) -> SocketAddr {
    if server.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    }
}

fn timed_out(what: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} 응답 없음", what),
    ))
}

/// ICMP 도달 불가로 인한 에러는 손실로 취급
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

/// UDP 파일 클라이언트
pub struct UdpClient {
    socket: UdpSocket,
    server: SocketAddr,
    config: Config,
}

impl UdpClient {
    /// 세션 연결 (대기열에 있으면 승격될 때까지 CLIENT 재전송)
    pub async fn connect(server: SocketAddr, config: Config) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(local_any(server)).await?;
        socket.connect(server).await?;

        let client = Self { socket, server, config };
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut attempts = 0u32;
        loop {
            client.send(&Request::Client).await?;
            let deadline = Instant::now() + client.config.control_timeout();
            while let Some(bytes) = client.recv_until(&mut buf, deadline).await? {
                if Reply::parse_bytes(bytes).ok() == Some(Reply::Accept) {
                    info!("세션 승인: {}", server);
                    return Ok(client);
                }
            }
            attempts += 1;
            if attempts == 1 {
                info!("서버 {} 응답 대기 중 (대기열)", server);
            }
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// 카탈로그 목록 요청
    pub async fn list_files(&self) -> Result<Vec<String>> {
        self.exchange(&Request::ListFiles, |bytes| {
            let text = std::str::from_utf8(bytes).ok()?;
            // 늦게 도착한 응답 토큰(ACCEPT, OK 등)과 크기 데이터그램 무시
            if Reply::parse(text).is_ok() || parse_file_size(text).is_ok() {
                debug!("LIST_FILES 대기 중 이전 응답 무시: {:?}", text);
                return None;
            }
            Some(Ok(parse_catalog(text)))
        })
        .await
    }

    /// 파일 요청: OK 후 크기, 또는 NOT_FOUND
    ///
    /// 크기는 OK 다음에 온 10진수 데이터그램만 인정한다. 상한을 넘으면 프로토콜 위반.
    pub async fn request_file(&self, name: &str) -> Result<u64> {
        let mut saw_ok = false;
        let config = &self.config;
        self.exchange(&Request::File(name.to_string()), |bytes| {
            let text = std::str::from_utf8(bytes).ok()?;
            match Reply::parse(text) {
                Ok(Reply::Ok) => {
                    saw_ok = true;
                    None
                }
                Ok(Reply::NotFound) => Some(Err(Error::NotFound(name.to_string()))),
                Ok(_) => None,
                Err(_) if saw_ok => match parse_file_size(text) {
                    Ok(size) => Some(config.check_file_size(size)),
                    Err(_) => {
                        debug!("파일 크기 대기 중 이전 응답 무시: {:?}", text);
                        None
                    }
                },
                Err(_) => None,
            }
        })
        .await
    }

    /// 병렬 청크 다운로드
    pub async fn download(&self, name: &str, file_size: u64, dest: &Path) -> Result<DownloadReport> {
        let jobs = crate::chunk::plan_chunks(file_size, self.config.workers);
        let stats = Arc::new(TransferStats::new(name, file_size, &jobs));
        let reporter = stats.spawn_reporter(Duration::from_millis(self.config.progress_interval_ms));

        let server = self.server;
        let config = self.config.clone();
        let file = name.to_string();
        let worker_stats = stats.clone();
        let result = fetcher::download(dest, file_size, self.config.workers, move |job| {
            fetch_chunk(server, file.clone(), job, config.clone(), worker_stats.clone())
        })
        .await;

        reporter.abort();
        info!("{}", stats.summary());
        result
    }

    /// 요청 → 다운로드 → DONE
    pub async fn fetch(&self, name: &str, dest: &Path) -> Result<DownloadReport> {
        let size = self.request_file(name).await?;
        let report = self.download(name, size, dest).await?;
        self.done().await?;
        Ok(report)
    }

    /// 다운로드 완료 알림
    pub async fn done(&self) -> Result<()> {
        self.send(&Request::Done).await
    }

    /// 세션 종료 (다음 대기 클라이언트 승격)
    pub async fn disconnect(self) -> Result<()> {
        self.send(&Request::Off).await?;
        info!("세션 종료: {}", self.server);
        Ok(())
    }

    async fn send(&self, request: &Request) -> Result<()> {
        self.socket.send(request.encode().as_bytes()).await?;
        Ok(())
    }

    /// 마감 시각까지 데이터그램 하나 수신 (없으면 None)
    async fn recv_until<'a>(&self, buf: &'a mut [u8], deadline: Instant) -> Result<Option<&'a [u8]>> {
        loop {
            match tokio::time::timeout_at(deadline, self.socket.recv(buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) if is_transient(&e) => {
                    debug!("일시적 수신 에러: {}", e);
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(n)) => return Ok(Some(&buf[..n])),
            }
        }
    }

    /// 이전 요청의 늦은 응답 중 이미 도착한 것 버리기
    fn drain_stale(&self, buf: &mut [u8]) {
        let mut dropped = 0;
        while self.socket.try_recv(buf).is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("이전 응답 {}개 폐기", dropped);
        }
    }

    /// 요청 전송 후 `accept`가 결과를 낼 때까지 수신, 타임아웃 시 재전송
    async fn exchange<T, F>(&self, request: &Request, mut accept: F) -> Result<T>
    where
        F: FnMut(&[u8]) -> Option<Result<T>>,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        self.drain_stale(&mut buf);
        for attempt in 0..=self.config.control_retries {
            if attempt > 0 {
                debug!("{} 재시도 ({}/{})", request.name(), attempt, self.config.control_retries);
            }
            self.send(request).await?;

            let deadline = Instant::now() + self.config.control_timeout();
            while let Some(bytes) = self.recv_until(&mut buf, deadline).await? {
                if let Some(result) = accept(bytes) {
                    return result;
                }
            }
        }
        Err(timed_out(request.name()))
    }
}

/// 청크 하나 수신 (전용 소켓)
async fn fetch_chunk(
    server: SocketAddr,
    file: String,
    job: ChunkJob,
    config: Config,
    stats: Arc<TransferStats>,
) -> Result<CompletedChunk> {
    let socket = UdpSocket::bind(local_any(server)).await?;
    socket.connect(server).await?;

    let mut arq = ArqReceiver::new(job, &config);
    request_from(&socket, &file, &job, arq.resume_point()).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = match tokio::time::timeout(arq.timeout(), socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if is_transient(&e) => {
                debug!("chunk {} 일시적 수신 에러: {}", job.index, e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                // EOF만 손실된 경우
                if arq.is_complete() {
                    break;
                }
                stats.record_timeout(job.index);
                let point = arq.on_timeout()?;
                debug!("chunk {} 타임아웃, 재전송 요청 offset={} seq={}", job.index, point.offset, point.seq);
                request_from(&socket, &file, &job, point).await?;
                stats.record_resend(job.index);
                continue;
            }
        };

        let bytes = &buf[..received];
        let verdict = match Datagram::classify(bytes) {
            Datagram::Data(frame) => {
                if let Err(e) = frame.check() {
                    stats.record_corrupt(job.index);
                    debug!("chunk {} {}", job.index, e);
                }
                arq.on_frame(frame)?
            }
            _ => arq.on_datagram(bytes)?,
        };

        match verdict {
            Verdict::Accepted { seq, len } => {
                stats.record_accepted(job.index, len);
                let ack = Request::Ack(AckMessage {
                    file: file.clone(),
                    index: job.index,
                    seq,
                });
                socket.send(ack.encode().as_bytes()).await?;
            }
            Verdict::Duplicate { seq } => {
                stats.record_duplicate(job.index);
                debug!("chunk {} 중복 seq={}", job.index, seq);
            }
            Verdict::Resend(point) => {
                request_from(&socket, &file, &job, point).await?;
                stats.record_resend(job.index);
            }
            Verdict::Suppressed => {}
            Verdict::Complete => break,
        }
    }

    debug!("chunk {} 수신 완료 ({} bytes)", job.index, arq.received());
    Ok(arq.into_buffer().freeze())
}

/// 재개 지점부터 청크 요청 (절대 오프셋)
async fn request_from(socket: &UdpSocket, file: &str, job: &ChunkJob, point: ResumePoint) -> Result<()> {
    let request = ChunkRequest::resume(file, job, point.offset, point.seq)
        .ok_or_else(|| Error::protocol(format!("빈 청크 요청: {}", job)))?;
    socket.send(Request::ChunkRequest(request).encode().as_bytes()).await?;
    Ok(())
}
