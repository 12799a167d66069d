//! 프로토콜 설정

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    Error, Result, DEFAULT_PORT, DEFAULT_WORKERS, FRAME_HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_STREAM_FRAME,
};

/// CFP 프로토콜 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 서버 포트
    pub port: u16,

    /// 파일당 병렬 청크 워커 수
    pub workers: usize,

    /// UDP 데이터 프레임 페이로드 크기 (바이트)
    pub datagram_payload: usize,

    /// TCP 데이터 프레임 최대 크기 (바이트)
    pub stream_frame_size: usize,

    /// 서버가 알린 파일 크기 상한 (바이트), 넘으면 크기 응답을 거부
    /// 조립이 메모리에서 이루어지므로 가용 메모리보다 작게 둔다.
    pub max_file_size: u64,

    /// 프레임 전송 간격 (마이크로초)
    /// 0이면 최대 속도로 전송
    pub pacing_us: u64,

    /// ARQ 초기 수신 타임아웃 (밀리초)
    pub initial_timeout_ms: u64,

    /// ARQ 최대 수신 타임아웃 (밀리초)
    pub max_timeout_ms: u64,

    /// 타임아웃 백오프 배수
    pub backoff_factor: f64,

    /// 진행 없이 허용되는 연속 타임아웃/불완전 EOF 횟수
    pub max_stalls: u32,

    /// TCP DATA_ACK 대기 타임아웃 (밀리초)
    pub ack_timeout_ms: u64,

    /// 랑데부 배리어 대기 타임아웃 (밀리초)
    pub barrier_timeout_ms: u64,

    /// 컨트롤 메시지 응답 대기 타임아웃 (밀리초)
    pub control_timeout_ms: u64,

    /// 컨트롤 메시지 재시도 횟수 (UDP)
    pub control_retries: u32,

    /// INVALID_FILE_SIZE 재전송 허용 횟수 (TCP)
    pub size_retries: u32,

    /// 감시 파일 폴링 주기 (밀리초)
    pub watch_interval_ms: u64,

    /// 진행률 로그 주기 (밀리초)
    pub progress_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            datagram_payload: 1024,
            stream_frame_size: 1024,
            max_file_size: 4 * 1024 * 1024 * 1024, // 4GB
            pacing_us: 1000,          // 1ms
            initial_timeout_ms: 500,
            max_timeout_ms: 5000,     // 5초
            backoff_factor: 1.5,
            max_stalls: 10,
            ack_timeout_ms: 10_000,
            barrier_timeout_ms: 30_000,
            control_timeout_ms: 2000,
            control_retries: 3,
            size_retries: 3,
            watch_interval_ms: 5000,  // 5초
            progress_interval_ms: 2000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// TOML 파일에서 설정 로드 (누락 필드는 기본값)
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// 설정값 검증
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers는 1 이상이어야 함".into()));
        }
        if self.datagram_payload == 0 || self.datagram_payload + FRAME_HEADER_LEN > MAX_DATAGRAM_SIZE {
            return Err(Error::Config(format!(
                "datagram_payload는 1..={} 범위여야 함",
                MAX_DATAGRAM_SIZE - FRAME_HEADER_LEN
            )));
        }
        if self.stream_frame_size == 0 || self.stream_frame_size > MAX_STREAM_FRAME {
            return Err(Error::Config(format!(
                "stream_frame_size는 1..={} 범위여야 함",
                MAX_STREAM_FRAME
            )));
        }
        if self.max_file_size == 0 {
            return Err(Error::Config("max_file_size는 1 이상이어야 함".into()));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::Config("backoff_factor는 1.0 이상의 유한한 값이어야 함".into()));
        }
        if self.initial_timeout_ms == 0 || self.max_timeout_ms < self.initial_timeout_ms {
            return Err(Error::Config(
                "0 < initial_timeout_ms <= max_timeout_ms 이어야 함".into(),
            ));
        }
        Ok(())
    }

    /// 서버가 알린 파일 크기가 상한 이내인지 확인
    pub fn check_file_size(&self, size: u64) -> Result<u64> {
        if size > self.max_file_size {
            return Err(Error::protocol(format!(
                "파일 크기 상한 초과: {} bytes (최대 {} bytes)",
                size, self.max_file_size
            )));
        }
        Ok(size)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_micros(self.pacing_us)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// 로컬 네트워크용 설정 (짧은 타임아웃, 간격 없음)
    pub fn lan() -> Self {
        Self {
            datagram_payload: 1400,
            stream_frame_size: 64 * 1024,
            pacing_us: 0,
            initial_timeout_ms: 100,
            max_timeout_ms: 1000,
            control_timeout_ms: 500,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            datagram_payload: 512,            // 작은 프레임
            pacing_us: 2000,
            initial_timeout_ms: 800,
            max_timeout_ms: 8000,
            backoff_factor: 2.0,
            max_stalls: 20,
            control_retries: 6,
            ..Self::default()
        }
    }
}
