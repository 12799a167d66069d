//! 에러 타입 정의

use thiserror::Error;

/// CFP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("설정 파일 파싱 에러: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("유효하지 않은 설정: {0}")]
    Config(String),

    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(String),

    #[error("다이제스트 불일치: seq={seq}")]
    IntegrityMismatch { seq: u32 },

    #[error("수신 타임아웃: chunk={index}, {stalls}회 연속 진행 없음")]
    Timeout { index: usize, stalls: u32 },

    #[error("청크 불완전: chunk={index}, {received}/{expected} bytes")]
    IncompleteChunk {
        index: usize,
        received: u64,
        expected: u64,
    },

    #[error("크기 불일치: expected {expected} bytes, got {got} bytes")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("chunk {index} failed: {source}")]
    ChunkFailed {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("워커 태스크 비정상 종료: {0}")]
    WorkerAborted(String),

    #[error("배리어 중단 (다른 워커 실패)")]
    BarrierBroken,

    #[error("배리어 대기 타임아웃: {waited_ms}ms")]
    BarrierTimeout { waited_ms: u64 },

    #[error("파일 없음: {0}")]
    NotFound(String),

    #[error("사용자 취소")]
    Cancelled,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 프로토콜 위반 에러 생성
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// 다른 워커의 실패로 인해 파생된 에러인지
    pub fn is_secondary(&self) -> bool {
        matches!(self, Error::BarrierBroken)
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
