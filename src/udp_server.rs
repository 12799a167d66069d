//! UDP 서버
//!
//! - 단일 수신 루프에서 세션 승인 후 메시지 처리
//! - CHUNK_REQUEST마다 짧게 사는 송신 태스크 생성 (이전 송신자는 게이트로 중단)
//! - 데이터 프레임: seq + SHA-256 + 페이로드, 끝에 EOF

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::arq::FrameReader;
use crate::catalog::Catalog;
use crate::message::{ChunkRequest, Reply, Request};
use crate::session::{Admission, AdmissionController, Release, SenderGate, SessionContext};
use crate::{Config, Error, Result, MAX_DATAGRAM_SIZE};

/// UDP 파일 서버
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    catalog: Arc<Catalog>,
    config: Arc<Config>,
    admission: Arc<AdmissionController>,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr, catalog: Catalog, config: Config) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        info!("CFP UDP server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            admission: Arc::new(AdmissionController::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// 수신 루프
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP 도달 불가 등은 개별 피어 문제
                    warn!("수신 에러: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.handle_datagram(&buf[..len], peer).await {
                warn!("{} 메시지 처리 에러: {}", peer, e);
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) -> Result<()> {
        let request = Request::parse_bytes(bytes)?;

        if request == Request::Off {
            match self.admission.disconnect(peer) {
                Release::Promoted(next, _) => self.reply(next, Reply::Accept).await?,
                Release::Idle | Release::Dequeued => {}
                Release::Unknown => debug!("알 수 없는 엔드포인트의 OFF: {}", peer),
            }
            return Ok(());
        }

        match self.admission.admit(peer, &request) {
            Admission::Activated(_) => self.reply(peer, Reply::Accept).await,
            Admission::Serviced(ctx) => self.service(ctx, peer, request).await,
            Admission::Queued { position } | Admission::AlreadyQueued { position } => {
                debug!("{} 대기 중 (위치 {}), {} 무시", peer, position, request.name());
                Ok(())
            }
            Admission::Rejected => Err(Error::protocol(format!(
                "활성 세션 없이 {} 수신",
                request.name()
            ))),
        }
    }

    async fn service(&self, ctx: Arc<SessionContext>, peer: SocketAddr, request: Request) -> Result<()> {
        match request {
            // 클라이언트가 ACCEPT를 놓치고 재시도한 경우
            Request::Client => self.reply(peer, Reply::Accept).await,
            Request::ListFiles => {
                self.socket.send_to(self.catalog.listing().as_bytes(), peer).await?;
                Ok(())
            }
            Request::File(name) => match self.catalog.lookup(&name) {
                Some(entry) => {
                    ctx.begin_file(&name);
                    self.reply(peer, Reply::Ok).await?;
                    self.socket.send_to(entry.size.to_string().as_bytes(), peer).await?;
                    info!("{} 파일 요청: {} ({} bytes)", peer, name, entry.size);
                    Ok(())
                }
                None => {
                    info!("{} 파일 없음: {}", peer, name);
                    self.reply(peer, Reply::NotFound).await
                }
            },
            Request::ChunkRequest(req) => self.start_sender(ctx, peer, req),
            Request::Ack(ack) => {
                ctx.record_ack(&ack);
                Ok(())
            }
            Request::Done => {
                info!("{} 다운로드 완료", peer);
                Ok(())
            }
            other => Err(Error::protocol(format!("UDP에서 지원하지 않는 메시지: {}", other.name()))),
        }
    }

    fn start_sender(&self, ctx: Arc<SessionContext>, peer: SocketAddr, req: ChunkRequest) -> Result<()> {
        let entry = self
            .catalog
            .lookup(&req.file)
            .ok_or_else(|| Error::NotFound(req.file.clone()))?;

        // start == end + 1은 남은 바이트 없음 (EOF만 전송)
        if req.end >= entry.size || req.start > req.end.saturating_add(1) {
            return Err(Error::protocol(format!(
                "범위 밖 청크 요청: {}:{}-{} (파일 {} bytes)",
                req.index, req.start, req.end, entry.size
            )));
        }

        let (gate, ticket) = ctx.sender_ticket(peer);
        debug!(
            "chunk {} 송신 시작: offset={} seq={:?} → {}",
            req.index, req.start, req.resume_seq, peer
        );

        let sender = ChunkSender {
            socket: self.socket.clone(),
            ctx,
            gate,
            ticket,
            path: entry.path,
            peer,
            config: self.config.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = sender.run(req).await {
                warn!("chunk 송신 실패: {}", e);
            }
        });
        Ok(())
    }

    async fn reply(&self, peer: SocketAddr, reply: Reply) -> Result<()> {
        self.socket.send_to(reply.as_str().as_bytes(), peer).await?;
        Ok(())
    }
}

/// 청크 하나의 송신 태스크
struct ChunkSender {
    socket: Arc<UdpSocket>,
    ctx: Arc<SessionContext>,
    gate: Arc<SenderGate>,
    ticket: u64,
    path: PathBuf,
    peer: SocketAddr,
    config: Arc<Config>,
}

impl ChunkSender {
    async fn run(self, req: ChunkRequest) -> Result<()> {
        let file = tokio::fs::File::open(&self.path).await?;
        let seq = req.resume_seq.unwrap_or(0);
        let mut reader = FrameReader::new(file, req.start, req.len(), seq, self.config.datagram_payload).await?;
        let pacing = self.config.pacing();

        loop {
            // 새 재전송 요청이나 세션 종료로 대체되면 EOF 없이 중단
            if !self.ctx.may_send(&self.gate, self.ticket) {
                debug!("chunk {} 송신자 대체됨 (seq={})", req.index, reader.next_seq());
                return Ok(());
            }

            match reader.next_frame().await? {
                Some(frame) => {
                    self.socket.send_to(&frame.to_bytes(), self.peer).await?;
                    if !pacing.is_zero() {
                        tokio::time::sleep(pacing).await;
                    }
                }
                None => break,
            }
        }

        if self.ctx.may_send(&self.gate, self.ticket) {
            self.socket.send_to(Reply::Eof.as_str().as_bytes(), self.peer).await?;
            debug!("chunk {} EOF 전송 (seq={})", req.index, reader.next_seq());
        }
        Ok(())
    }
}
