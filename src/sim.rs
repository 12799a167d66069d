//! 손실 링크 시뮬레이터
//!
//! 클라이언트와 서버 사이의 UDP 중계기. 서버 → 클라이언트 방향의 데이터
//! 프레임에만 시드 기반 손실, 중복, 손상, 순서 뒤바뀜을 주입한다.
//! 클라이언트 엔드포인트마다 서버 쪽 소켓을 하나씩 열어 서버에는 서로
//! 다른 피어로 보인다.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::arq::Frame;
use crate::{Result, FRAME_HEADER_LEN, MAX_DATAGRAM_SIZE};

/// 순서 뒤바뀜으로 붙잡아 둔 프레임을 내보내는 대기 시간
const REORDER_FLUSH: Duration = Duration::from_millis(20);

/// 링크 손상 설정 (각 값은 0.0 ~ 1.0 확률)
#[derive(Debug, Clone, Default)]
pub struct LinkSimConfig {
    pub drop_rate: f64,
    pub dup_rate: f64,
    pub corrupt_rate: f64,
    pub reorder_rate: f64,
    /// 재현 가능한 손상 순서를 위한 시드, None이면 무작위
    pub seed: Option<u64>,
}

impl LinkSimConfig {
    /// 손상 없음
    pub fn perfect() -> Self {
        Self::default()
    }

    /// 손실 많은 링크
    pub fn lossy(seed: u64) -> Self {
        Self {
            drop_rate: 0.05,
            dup_rate: 0.03,
            corrupt_rate: 0.03,
            reorder_rate: 0.05,
            seed: Some(seed),
        }
    }
}

/// 손상 주입 UDP 중계기
pub struct LossyRelay {
    local: SocketAddr,
    task: JoinHandle<()>,
}

impl LossyRelay {
    pub async fn start(upstream: SocketAddr, config: LinkSimConfig) -> Result<Self> {
        let bind: SocketAddr = if upstream.is_ipv4() {
            (Ipv4Addr::LOCALHOST, 0).into()
        } else {
            (Ipv6Addr::LOCALHOST, 0).into()
        };
        let front = Arc::new(UdpSocket::bind(bind).await?);
        let local = front.local_addr()?;

        let seed = config.seed.unwrap_or_else(rand::random);
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        debug!("LossyRelay {} → {} (seed={})", local, upstream, seed);

        let task = tokio::spawn(uplink(front, upstream, config, rng));
        Ok(Self { local, task })
    }

    /// 클라이언트가 접속할 주소
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 클라이언트 하나에 대응하는 서버 쪽 소켓
struct Peer {
    socket: Arc<UdpSocket>,
    downlink: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.downlink.abort();
    }
}

/// 클라이언트 → 서버 (손상 없음)
async fn uplink(front: Arc<UdpSocket>, upstream: SocketAddr, config: LinkSimConfig, rng: Arc<Mutex<StdRng>>) {
    let mut peers: HashMap<SocketAddr, Peer> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, client) = match front.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("relay 수신 에러: {}", e);
                continue;
            }
        };

        if !peers.contains_key(&client) {
            match open_peer(&front, upstream, client, &config, &rng).await {
                Ok(peer) => {
                    peers.insert(client, peer);
                }
                Err(e) => {
                    warn!("relay 업스트림 소켓 생성 실패: {}", e);
                    continue;
                }
            }
        }
        if let Some(peer) = peers.get(&client) {
            if let Err(e) = peer.socket.send(&buf[..len]).await {
                debug!("relay 전달 실패: {}", e);
            }
        }
    }
}

async fn open_peer(
    front: &Arc<UdpSocket>,
    upstream: SocketAddr,
    client: SocketAddr,
    config: &LinkSimConfig,
    rng: &Arc<Mutex<StdRng>>,
) -> Result<Peer> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::LOCALHOST, 0).into()
    } else {
        (Ipv6Addr::LOCALHOST, 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    socket.connect(upstream).await?;

    let downlink = tokio::spawn(downlink(
        socket.clone(),
        front.clone(),
        client,
        config.clone(),
        rng.clone(),
    ));
    Ok(Peer { socket, downlink })
}

/// 서버 → 클라이언트 (데이터 프레임 손상)
async fn downlink(
    upstream: Arc<UdpSocket>,
    front: Arc<UdpSocket>,
    client: SocketAddr,
    config: LinkSimConfig,
    rng: Arc<Mutex<StdRng>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut held: Option<Vec<u8>> = None;

    loop {
        let len = match tokio::time::timeout(REORDER_FLUSH, upstream.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                debug!("relay 업스트림 수신 에러: {}", e);
                continue;
            }
            Err(_) => {
                if let Some(frame) = held.take() {
                    let _ = front.send_to(&frame, client).await;
                }
                continue;
            }
        };

        let datagram = buf[..len].to_vec();
        if !is_data_frame(&datagram) {
            let _ = front.send_to(&datagram, client).await;
            if let Some(frame) = held.take() {
                let _ = front.send_to(&frame, client).await;
            }
            continue;
        }

        let out = impair(datagram, &config, &mut rng.lock());
        for datagram in out.send {
            let _ = front.send_to(&datagram, client).await;
        }
        if let Some(frame) = held.take() {
            let _ = front.send_to(&frame, client).await;
        }
        held = out.hold;
    }
}

/// 검증 가능한 데이터 프레임만 손상 대상 (컨트롤 토큰, 카탈로그 제외)
fn is_data_frame(bytes: &[u8]) -> bool {
    bytes.len() > FRAME_HEADER_LEN && Frame::from_bytes(bytes).map_or(false, |frame| frame.verify())
}

#[derive(Debug, Default)]
struct Impaired {
    send: Vec<Vec<u8>>,
    hold: Option<Vec<u8>>,
}

fn impair(mut datagram: Vec<u8>, config: &LinkSimConfig, rng: &mut StdRng) -> Impaired {
    let mut out = Impaired::default();

    if rng.gen_bool(config.drop_rate.clamp(0.0, 1.0)) {
        return out;
    }
    if rng.gen_bool(config.corrupt_rate.clamp(0.0, 1.0)) {
        let at = rng.gen_range(FRAME_HEADER_LEN..datagram.len());
        datagram[at] ^= 0x5A;
    }
    if rng.gen_bool(config.dup_rate.clamp(0.0, 1.0)) {
        out.send.push(datagram.clone());
    }
    if rng.gen_bool(config.reorder_rate.clamp(0.0, 1.0)) {
        out.hold = Some(datagram);
    } else {
        out.send.push(datagram);
    }
    out
}
