//! TCP 서버
//!
//! 연결마다 태스크 하나. 첫 토큰으로 역할을 구분한다.
//! - `CLIENT`: 카탈로그 전송 후 파일 요청 루프 (QUIT까지)
//! - `CHUNK`: 청크 하나를 lockstep으로 전송 (프레임마다 DATA_ACK 대기)

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::framing::{self, CONTROL_MAX};
use crate::message::{ChunkRequest, Reply, Request};
use crate::{Config, Error, Result};

/// TCP 파일 서버
pub struct TcpServer {
    listener: TcpListener,
    catalog: Arc<Catalog>,
    config: Arc<Config>,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, catalog: Catalog, config: Config) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        info!("CFP TCP server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            catalog: Arc::new(catalog),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 접속 루프
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept 에러: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("{} TCP_NODELAY 설정 실패: {}", peer, e);
            }

            let handler = ConnectionHandler {
                catalog: self.catalog.clone(),
                config: self.config.clone(),
                peer,
            };
            tokio::spawn(async move {
                match handler.handle(stream).await {
                    Ok(()) | Err(Error::ConnectionClosed) => {}
                    Err(e) => warn!("{} 연결 처리 에러: {}", peer, e),
                }
            });
        }
    }
}

struct ConnectionHandler {
    catalog: Arc<Catalog>,
    config: Arc<Config>,
    peer: SocketAddr,
}

impl ConnectionHandler {
    async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        match framing::read_request(&mut stream, self.config.control_timeout()).await? {
            Request::Client => self.serve_session(&mut stream).await,
            Request::Chunk => self.serve_chunk(&mut stream).await,
            other => Err(Error::protocol(format!("알 수 없는 연결 종류: {}", other.name()))),
        }
    }

    async fn serve_session(&self, stream: &mut TcpStream) -> Result<()> {
        info!("Client {} connected", self.peer);
        framing::write_control(stream, &self.catalog.listing()).await?;

        loop {
            // 파일 요청 사이에는 제한 없이 대기
            let request = match framing::read_frame(stream, CONTROL_MAX).await {
                Ok(frame) => frame.into_request()?,
                Err(Error::ConnectionClosed) => break,
                Err(e) => return Err(e),
            };

            match request {
                Request::Quit => break,
                Request::Cancel => info!("{} 요청 취소", self.peer),
                Request::File(name) => {
                    if !self.serve_file(stream, &name).await? {
                        break;
                    }
                }
                other => {
                    return Err(Error::protocol(format!("세션에서 예상치 못한 메시지: {}", other.name())));
                }
            }
        }

        info!("Client {} disconnected", self.peer);
        Ok(())
    }

    /// 파일 하나의 핸드셰이크. 세션을 계속하면 true
    async fn serve_file(&self, stream: &mut TcpStream, name: &str) -> Result<bool> {
        let entry = match self.catalog.lookup(name) {
            Some(entry) => entry,
            None => {
                info!("{} 파일 없음: {}", self.peer, name);
                framing::write_reply(stream, Reply::NotFound).await?;
                return Ok(true);
            }
        };

        info!("{} 파일 요청: {} ({} bytes)", self.peer, name, entry.size);
        framing::write_reply(stream, Reply::Ok).await?;

        let mut attempts = 0;
        loop {
            framing::write_control(stream, &entry.size.to_string()).await?;
            match framing::read_request(stream, self.config.control_timeout()).await? {
                Request::ValidFileSize => break,
                Request::InvalidFileSize if attempts < self.config.size_retries => {
                    attempts += 1;
                    debug!("{} 파일 크기 재전송 ({})", self.peer, attempts);
                }
                Request::InvalidFileSize => {
                    return Err(Error::protocol("파일 크기 재전송 횟수 초과"));
                }
                other => {
                    return Err(Error::protocol(format!("파일 크기 응답 대신 {}", other.name())));
                }
            }
        }

        // 청크 워커가 별도 연결로 받는 동안 대기
        match framing::read_frame(stream, CONTROL_MAX).await?.into_request()? {
            Request::Done => {
                info!("{} 전송 완료: {}", self.peer, name);
                Ok(true)
            }
            Request::Cancel => {
                info!("{} 전송 취소: {}", self.peer, name);
                Ok(true)
            }
            Request::Quit => Ok(false),
            other => Err(Error::protocol(format!("DONE/CANCEL 대신 {}", other.name()))),
        }
    }

    async fn serve_chunk(&self, stream: &mut TcpStream) -> Result<()> {
        framing::write_reply(stream, Reply::Ready).await?;

        let req = match framing::read_request(stream, self.config.control_timeout()).await? {
            Request::ChunkRequest(req) => req,
            other => {
                return Err(Error::protocol(format!("CHUNK_REQUEST 대신 {}", other.name())));
            }
        };

        let entry = self
            .catalog
            .lookup(&req.file)
            .ok_or_else(|| Error::NotFound(req.file.clone()))?;
        if req.start > req.end || req.end >= entry.size {
            return Err(Error::protocol(format!(
                "범위 밖 청크 요청: {}:{}-{} (파일 {} bytes)",
                req.index, req.start, req.end, entry.size
            )));
        }

        framing::write_reply(stream, Reply::DataStart).await?;
        match framing::read_request(stream, self.config.control_timeout()).await? {
            Request::ReadyForData => {}
            other => {
                return Err(Error::protocol(format!("READY_FOR_DATA 대신 {}", other.name())));
            }
        }

        self.send_range(stream, &entry.path, &req).await?;
        framing::write_reply(stream, Reply::DataEnd).await?;
        debug!("{} chunk {} 전송 완료 ({} bytes)", self.peer, req.index, req.len());
        Ok(())
    }

    /// 프레임 하나 보내고 DATA_ACK를 받을 때까지 다음 프레임을 보내지 않음
    async fn send_range(&self, stream: &mut TcpStream, path: &std::path::Path, req: &ChunkRequest) -> Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(req.start)).await?;

        let mut remaining = req.len();
        let mut buf = vec![0u8; self.config.stream_frame_size];
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::IncompleteChunk {
                    index: req.index,
                    received: req.len() - remaining,
                    expected: req.len(),
                });
            }

            framing::write_data(stream, &buf[..n]).await?;
            match framing::read_request(stream, self.config.ack_timeout()).await? {
                Request::DataAck => {}
                other => {
                    return Err(Error::protocol(format!("DATA_ACK 대신 {}", other.name())));
                }
            }
            remaining -= n as u64;
        }
        Ok(())
    }
}
