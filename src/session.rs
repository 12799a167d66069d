//! UDP 세션 승인 제어
//!
//! - 활성 세션은 최대 하나, 나머지는 FIFO 대기열
//! - 세션 상태(송신 게이트, ACK 기록)는 전역이 아니라 세션 단위로 소유
//! - 컨트롤러 락은 `.await`를 넘어 유지하지 않는다

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::message::{AckMessage, Request};

/// 엔드포인트 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Queued,
    Active,
    Terminated,
}

/// 수신 메시지에 대한 승인 결과
#[derive(Debug, Clone)]
pub enum Admission {
    /// 유휴 상태에서 CLIENT 수신, 새 세션 활성화 (ACCEPT 전송 필요)
    Activated(Arc<SessionContext>),
    /// 활성 세션 안에서 처리
    Serviced(Arc<SessionContext>),
    /// 대기열에 새로 추가 (응답 없음)
    Queued { position: usize },
    /// 이미 대기 중 (응답 없음)
    AlreadyQueued { position: usize },
    /// 세션 없이 처리할 수 없는 메시지
    Rejected,
}

/// 연결 종료(OFF) 처리 결과
#[derive(Debug, Clone)]
pub enum Release {
    /// 활성 세션 종료, 다음 대기 엔드포인트 승격 (ACCEPT 전송 필요)
    Promoted(SocketAddr, Arc<SessionContext>),
    /// 활성 세션 종료, 대기열 비어 있음
    Idle,
    /// 대기열에서 제거
    Dequeued,
    /// 알 수 없는 엔드포인트
    Unknown,
}

/// 엔드포인트별 송신 게이트
///
/// 재전송 요청마다 세대를 올리고, 이전 세대 송신자는 다음 프레임 전에 멈춘다.
#[derive(Debug, Default)]
pub struct SenderGate {
    generation: AtomicU64,
}

impl SenderGate {
    /// 기존 송신자를 무효화하고 새 티켓 발급
    pub fn supersede(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket
    }
}

/// 활성 세션 상태
#[derive(Debug)]
pub struct SessionContext {
    client: SocketAddr,
    gates: DashMap<SocketAddr, Arc<SenderGate>>,
    /// (파일, 청크) → 확인된 최대 시퀀스
    acks: DashMap<(String, usize), u32>,
    terminated: AtomicBool,
}

impl SessionContext {
    fn new(client: SocketAddr) -> Self {
        Self {
            client,
            gates: DashMap::new(),
            acks: DashMap::new(),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    /// 워커 엔드포인트의 송신 티켓 발급 (이전 송신자 중단)
    pub fn sender_ticket(&self, worker: SocketAddr) -> (Arc<SenderGate>, u64) {
        let gate = self.gates.entry(worker).or_default().clone();
        let ticket = gate.supersede();
        (gate, ticket)
    }

    /// 송신자가 계속 보내도 되는지
    pub fn may_send(&self, gate: &SenderGate, ticket: u64) -> bool {
        !self.is_terminated() && gate.is_current(ticket)
    }

    /// ACK 기록 (최대 시퀀스만 유지)
    pub fn record_ack(&self, ack: &AckMessage) {
        let mut entry = self.acks.entry((ack.file.clone(), ack.index)).or_insert(ack.seq);
        if ack.seq > *entry {
            *entry = ack.seq;
        }
    }

    pub fn acked(&self, file: &str, index: usize) -> Option<u32> {
        self.acks.get(&(file.to_string(), index)).map(|seq| *seq)
    }

    /// 새 파일 요청 시 이전 파일 기록 정리
    ///
    /// 이전 파일의 워커 소켓은 다시 쓰이지 않으므로 남은 송신자도 중단하고 게이트를 비운다.
    pub fn begin_file(&self, file: &str) {
        self.supersede_all();
        self.acks.clear();
        debug!("세션 {}: 파일 {} 시작", self.client, file);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// 세션 종료: 진행 중인 송신자 모두 중단
    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.supersede_all();
        self.acks.clear();
    }

    fn supersede_all(&self) {
        for gate in self.gates.iter() {
            gate.supersede();
        }
        self.gates.clear();
    }
}

#[derive(Debug, Default)]
struct Inner {
    active: Option<Arc<SessionContext>>,
    queue: VecDeque<SocketAddr>,
}

/// 세션 승인 컨트롤러
#[derive(Debug, Default)]
pub struct AdmissionController {
    inner: Mutex<Inner>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 메시지 승인 판정
    pub fn admit(&self, peer: SocketAddr, request: &Request) -> Admission {
        let mut inner = self.inner.lock();

        // 데이터 평면 메시지는 청크 워커 소켓에서 오므로 엔드포인트가 다름
        if matches!(request, Request::ChunkRequest(_) | Request::Ack(_)) {
            return match &inner.active {
                Some(ctx) => Admission::Serviced(ctx.clone()),
                None => Admission::Rejected,
            };
        }

        if let Some(ctx) = &inner.active {
            if ctx.client() == peer {
                return Admission::Serviced(ctx.clone());
            }
            if let Some(pos) = inner.queue.iter().position(|p| *p == peer) {
                return Admission::AlreadyQueued { position: pos + 1 };
            }
            inner.queue.push_back(peer);
            let position = inner.queue.len();
            info!("{} 대기열 추가 (위치 {})", peer, position);
            return Admission::Queued { position };
        }

        match request {
            Request::Client => {
                let ctx = Arc::new(SessionContext::new(peer));
                inner.active = Some(ctx.clone());
                info!("세션 활성화: {}", peer);
                Admission::Activated(ctx)
            }
            _ => Admission::Rejected,
        }
    }

    /// 연결 종료 처리
    pub fn disconnect(&self, peer: SocketAddr) -> Release {
        let mut inner = self.inner.lock();

        let is_active = inner.active.as_ref().map(|ctx| ctx.client()) == Some(peer);
        if is_active {
            if let Some(ctx) = inner.active.take() {
                ctx.terminate();
            }
            info!("세션 종료: {}", peer);

            return match inner.queue.pop_front() {
                Some(next) => {
                    let ctx = Arc::new(SessionContext::new(next));
                    inner.active = Some(ctx.clone());
                    info!("대기열에서 승격: {}", next);
                    Release::Promoted(next, ctx)
                }
                None => Release::Idle,
            };
        }

        if let Some(pos) = inner.queue.iter().position(|p| *p == peer) {
            inner.queue.remove(pos);
            debug!("대기열에서 제거: {}", peer);
            return Release::Dequeued;
        }

        Release::Unknown
    }

    /// 엔드포인트 상태. 활성도 대기도 아니면 `Terminated` (종료된 엔드포인트는 기록하지 않음)
    pub fn state_of(&self, peer: SocketAddr) -> SessionState {
        let inner = self.inner.lock();
        if inner.active.as_ref().map(|ctx| ctx.client()) == Some(peer) {
            SessionState::Active
        } else if inner.queue.contains(&peer) {
            SessionState::Queued
        } else {
            SessionState::Terminated
        }
    }

    pub fn active(&self) -> Option<SocketAddr> {
        self.inner.lock().active.as_ref().map(|ctx| ctx.client())
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
