//! ARQ 신뢰성 계층 (UDP)
//!
//! - Frame: `{seq: u32 LE, SHA-256(payload), payload}`
//! - 종료 표시: `EOF` 토큰
//! - 수신측: stop-and-wait, 순서가 맞고 검증된 프레임만 버퍼에 추가
//! - 불일치/손실/타임아웃 시 마지막 확인 오프셋부터 재전송 요청

use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::chunk::{ChunkBuffer, ChunkJob};
use crate::message::Reply;
use crate::{Config, Error, Result, DIGEST_LEN, FRAME_HEADER_LEN, SEQ_LEN};

/// 데이터 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub digest: [u8; DIGEST_LEN],
    pub payload: Bytes,
}

impl Frame {
    /// 새 프레임 생성 (다이제스트 계산)
    pub fn new(seq: u32, payload: Bytes) -> Self {
        Self {
            seq,
            digest: digest(&payload),
            payload,
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// 바이트에서 역직렬화 (다이제스트 검증은 하지 않음)
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return None;
        }

        let seq = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[SEQ_LEN..FRAME_HEADER_LEN]);
        let payload = Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..]);

        Some(Self {
            seq,
            digest,
            payload,
        })
    }

    /// 다이제스트 검증
    pub fn verify(&self) -> bool {
        digest(&self.payload) == self.digest
    }

    /// 다이제스트 검증 (실패 시 `IntegrityMismatch`)
    pub fn check(&self) -> Result<()> {
        if self.verify() {
            Ok(())
        } else {
            Err(Error::IntegrityMismatch { seq: self.seq })
        }
    }
}

/// SHA-256 다이제스트
pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(data).into()
}

/// 수신 데이터그램 분류
#[derive(Debug)]
pub enum Datagram {
    Data(Frame),
    Eof,
    /// 프레임 헤더보다 짧고 EOF도 아닌 데이터그램
    Malformed,
}

impl Datagram {
    pub fn classify(bytes: &[u8]) -> Self {
        if bytes == Reply::Eof.as_str().as_bytes() {
            return Datagram::Eof;
        }
        match Frame::from_bytes(bytes) {
            Some(frame) => Datagram::Data(frame),
            None => Datagram::Malformed,
        }
    }
}

/// 재전송 요청 지점
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// 파일 기준 절대 오프셋
    pub offset: u64,
    /// 재개 시퀀스 번호
    pub seq: u32,
}

/// 데이터그램 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 순서 맞는 검증된 프레임, ACK 전송 필요
    Accepted { seq: u32, len: usize },
    /// 이미 확인된 시퀀스 (무시)
    Duplicate { seq: u32 },
    /// 마지막 확인 지점부터 재전송 요청 필요
    Resend(ResumePoint),
    /// 같은 지점 재전송 요청이 이미 나가 있음
    Suppressed,
    /// 청크 완료
    Complete,
}

/// 청크 단위 ARQ 수신 상태
#[derive(Debug)]
pub struct ArqReceiver {
    buffer: ChunkBuffer,
    expected_seq: u32,
    timeout: Duration,
    initial_timeout: Duration,
    max_timeout: Duration,
    backoff_factor: f64,
    max_stalls: u32,
    stalls: u32,
    pending_resend: Option<u32>,
}

impl ArqReceiver {
    pub fn new(job: ChunkJob, config: &Config) -> Self {
        Self {
            buffer: ChunkBuffer::new(job),
            expected_seq: 0,
            timeout: config.initial_timeout(),
            initial_timeout: config.initial_timeout(),
            max_timeout: config.max_timeout(),
            backoff_factor: config.backoff_factor,
            max_stalls: config.max_stalls,
            stalls: 0,
            pending_resend: None,
        }
    }

    pub fn job(&self) -> &ChunkJob {
        self.buffer.job()
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// 마지막 확인 오프셋 (파일 기준)
    pub fn confirmed_offset(&self) -> u64 {
        self.buffer.next_offset()
    }

    pub fn received(&self) -> u64 {
        self.buffer.received()
    }

    /// 현재 적응형 타임아웃
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            offset: self.confirmed_offset(),
            seq: self.expected_seq,
        }
    }

    /// 수신 데이터그램 처리
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Result<Verdict> {
        match Datagram::classify(bytes) {
            Datagram::Eof => self.on_eof(),
            Datagram::Malformed => Ok(self.request_resend()),
            Datagram::Data(frame) => self.on_frame(frame),
        }
    }

    /// 프레임 처리
    pub fn on_frame(&mut self, frame: Frame) -> Result<Verdict> {
        // 손상 프레임은 손실과 동일하게 처리
        if !frame.verify() {
            return Ok(self.request_resend());
        }

        if frame.seq < self.expected_seq {
            return Ok(Verdict::Duplicate { seq: frame.seq });
        }

        // 순서가 앞선 데이터는 버퍼링하지 않음
        if frame.seq > self.expected_seq {
            return Ok(self.request_resend());
        }

        let len = frame.payload.len();
        if len == 0 {
            return Err(Error::protocol(format!("빈 데이터 프레임: seq={}", frame.seq)));
        }
        self.buffer.append(&frame.payload)?;

        self.expected_seq = self.expected_seq.wrapping_add(1);
        self.pending_resend = None;
        self.stalls = 0;
        self.timeout = self.initial_timeout;

        Ok(Verdict::Accepted {
            seq: frame.seq,
            len,
        })
    }

    /// 짧은 EOF는 바로 실패시키지 않고 정체로 센다 (대체된 이전 송신자의 늦은 EOF일 수 있음)
    fn on_eof(&mut self) -> Result<Verdict> {
        if self.buffer.is_complete() {
            return Ok(Verdict::Complete);
        }

        match self.request_resend() {
            Verdict::Suppressed => Ok(Verdict::Suppressed),
            verdict => {
                self.stall()?;
                Ok(verdict)
            }
        }
    }

    /// 수신 타임아웃: 백오프 후 강제 재전송 요청
    pub fn on_timeout(&mut self) -> Result<ResumePoint> {
        self.stall()?;

        // 변환 전에 상한 적용 (f64::min은 NaN이면 상한을 택함)
        let next = (self.timeout.as_secs_f64() * self.backoff_factor).min(self.max_timeout.as_secs_f64());
        self.timeout = Duration::try_from_secs_f64(next).unwrap_or(self.max_timeout);

        let point = self.resume_point();
        self.pending_resend = Some(point.seq);
        Ok(point)
    }

    fn stall(&mut self) -> Result<()> {
        self.stalls += 1;
        if self.stalls <= self.max_stalls {
            return Ok(());
        }

        let job = self.buffer.job();
        if self.buffer.received() > 0 || job.size == 0 {
            Err(Error::IncompleteChunk {
                index: job.index,
                received: self.buffer.received(),
                expected: job.size,
            })
        } else {
            Err(Error::Timeout {
                index: job.index,
                stalls: self.stalls,
            })
        }
    }

    fn request_resend(&mut self) -> Verdict {
        if self.pending_resend == Some(self.expected_seq) {
            return Verdict::Suppressed;
        }
        self.pending_resend = Some(self.expected_seq);
        Verdict::Resend(self.resume_point())
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.is_complete()
    }

    pub fn into_buffer(self) -> ChunkBuffer {
        self.buffer
    }
}

/// 바이트 범위를 제한된 크기의 프레임으로 읽는 리더 (송신측)
pub struct FrameReader<R> {
    reader: R,
    remaining: u64,
    next_seq: u32,
    payload_size: usize,
}

impl<R: AsyncRead + AsyncSeek + Unpin> FrameReader<R> {
    /// `offset`부터 `len` 바이트를 `seq`부터 번호를 붙여 읽음
    pub async fn new(mut reader: R, offset: u64, len: u64, seq: u32, payload_size: usize) -> Result<Self> {
        reader.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(Self {
            reader,
            remaining: len,
            next_seq: seq,
            payload_size: payload_size.max(1),
        })
    }

    /// 다음 프레임, 범위를 다 읽었으면 None
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let want = (self.payload_size as u64).min(self.remaining) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            // 파일이 요청 범위보다 짧아짐
            return Err(Error::ConnectionClosed);
        }
        buf.truncate(filled);

        let frame = Frame::new(self.next_seq, Bytes::from(buf));
        self.next_seq = self.next_seq.wrapping_add(1);
        self.remaining -= filled as u64;
        Ok(Some(frame))
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }
}
