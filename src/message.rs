//! 프로토콜 메시지 정의
//!
//! 컨트롤 메시지는 텍스트 토큰이다. 파서는 엄격하며 알 수 없는 토큰은
//! `Error::ProtocolViolation`으로 실패한다.
//!
//! - `Request`: 클라이언트 → 서버
//! - `Reply`: 서버 → 클라이언트 고정 토큰
//! - 카탈로그 목록과 파일 크기는 문맥에 따라 전용 함수로 해석

use std::fmt;

use crate::chunk::ChunkJob;
use crate::{Error, Result};

/// 파일 이름 최대 길이
pub const MAX_NAME_LEN: usize = 255;

/// 청크 요청 (`CHUNK_REQUEST:<file>:<index>:<start>:<end>[:<resume_seq>]`)
///
/// `start`/`end`는 파일 기준 절대 오프셋이며 `end`는 포함이다.
/// `resume_seq`는 UDP 전용이다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub file: String,
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub resume_seq: Option<u32>,
}

impl ChunkRequest {
    /// 청크 전체 요청 (TCP)
    pub fn for_job(file: &str, job: &ChunkJob) -> Option<Self> {
        Some(Self {
            file: file.to_string(),
            index: job.index,
            start: job.start,
            end: job.last_byte()?,
            resume_seq: None,
        })
    }

    /// 특정 오프셋/시퀀스부터 재개 요청 (UDP)
    pub fn resume(file: &str, job: &ChunkJob, offset: u64, seq: u32) -> Option<Self> {
        Some(Self {
            file: file.to_string(),
            index: job.index,
            start: offset,
            end: job.last_byte()?,
            resume_seq: Some(seq),
        })
    }

    /// 요청 범위 바이트 수 (start > end이면 0, 재개 지점이 끝에 도달한 경우)
    pub fn len(&self) -> u64 {
        self.end.saturating_add(1).saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 데이터 프레임 확인 (`ACK:<file>:<index>:<seq>`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub file: String,
    pub index: usize,
    pub seq: u32,
}

/// 클라이언트 → 서버 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// 세션 식별 (`CLIENT`)
    Client,
    /// 청크 연결 식별, TCP 전용 (`CHUNK`)
    Chunk,
    /// 카탈로그 요청, UDP 전용 (`LIST_FILES`)
    ListFiles,
    /// 파일 요청 (파일 이름 그대로)
    File(String),
    ChunkRequest(ChunkRequest),
    Ack(AckMessage),
    ReadyForData,
    DataAck,
    ValidFileSize,
    InvalidFileSize,
    Done,
    Cancel,
    Quit,
    /// 세션 종료, UDP 전용 (`OFF`)
    Off,
}

impl Request {
    /// 텍스트 토큰 해석
    pub fn parse(text: &str) -> Result<Self> {
        let request = match text {
            "CLIENT" => Request::Client,
            "CHUNK" => Request::Chunk,
            "LIST_FILES" => Request::ListFiles,
            "READY_FOR_DATA" => Request::ReadyForData,
            "DATA_ACK" => Request::DataAck,
            "VALID_FILE_SIZE" => Request::ValidFileSize,
            "INVALID_FILE_SIZE" => Request::InvalidFileSize,
            "DONE" => Request::Done,
            "CANCEL" => Request::Cancel,
            "QUIT" => Request::Quit,
            "OFF" => Request::Off,
            _ => {
                if let Some(rest) = text.strip_prefix("CHUNK_REQUEST:") {
                    Request::ChunkRequest(parse_chunk_request(rest)?)
                } else if let Some(rest) = text.strip_prefix("ACK:") {
                    Request::Ack(parse_ack(rest)?)
                } else {
                    Request::File(validate_name(text)?.to_string())
                }
            }
        };
        Ok(request)
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::protocol("UTF-8이 아닌 컨트롤 메시지"))?;
        Self::parse(text)
    }

    /// 와이어 형식으로 인코딩
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// 메시지 이름 (로그용)
    pub fn name(&self) -> &'static str {
        match self {
            Request::Client => "CLIENT",
            Request::Chunk => "CHUNK",
            Request::ListFiles => "LIST_FILES",
            Request::File(_) => "FILE",
            Request::ChunkRequest(_) => "CHUNK_REQUEST",
            Request::Ack(_) => "ACK",
            Request::ReadyForData => "READY_FOR_DATA",
            Request::DataAck => "DATA_ACK",
            Request::ValidFileSize => "VALID_FILE_SIZE",
            Request::InvalidFileSize => "INVALID_FILE_SIZE",
            Request::Done => "DONE",
            Request::Cancel => "CANCEL",
            Request::Quit => "QUIT",
            Request::Off => "OFF",
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::File(name) => f.write_str(name),
            Request::ChunkRequest(req) => {
                write!(
                    f,
                    "CHUNK_REQUEST:{}:{}:{}:{}",
                    req.file, req.index, req.start, req.end
                )?;
                if let Some(seq) = req.resume_seq {
                    write!(f, ":{}", seq)?;
                }
                Ok(())
            }
            Request::Ack(ack) => write!(f, "ACK:{}:{}:{}", ack.file, ack.index, ack.seq),
            other => f.write_str(other.name()),
        }
    }
}

/// 서버 → 클라이언트 고정 토큰
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Ready,
    Ok,
    NotFound,
    DataStart,
    DataEnd,
    /// 청크 종료 표시 (UDP)
    Eof,
}

impl Reply {
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "ACCEPT" => Ok(Reply::Accept),
            "READY" => Ok(Reply::Ready),
            "OK" => Ok(Reply::Ok),
            "NOT_FOUND" => Ok(Reply::NotFound),
            "DATA_START" => Ok(Reply::DataStart),
            "DATA_END" => Ok(Reply::DataEnd),
            "EOF" => Ok(Reply::Eof),
            other => Err(Error::protocol(format!("알 수 없는 응답 토큰: {:?}", truncate(other)))),
        }
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::protocol("UTF-8이 아닌 응답"))?;
        Self::parse(text)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Accept => "ACCEPT",
            Reply::Ready => "READY",
            Reply::Ok => "OK",
            Reply::NotFound => "NOT_FOUND",
            Reply::DataStart => "DATA_START",
            Reply::DataEnd => "DATA_END",
            Reply::Eof => "EOF",
        }
    }

    /// 기대한 토큰인지 확인
    pub fn expect(text: &str, expected: Reply) -> Result<()> {
        let got = Self::parse(text)?;
        if got != expected {
            return Err(Error::protocol(format!(
                "{} 기대, {} 수신",
                expected.as_str(),
                got.as_str()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 카탈로그 목록 인코딩 (이름마다 개행)
pub fn encode_catalog<S: AsRef<str>>(names: &[S]) -> String {
    let mut blob = String::new();
    for name in names {
        blob.push_str(name.as_ref());
        blob.push('\n');
    }
    blob
}

/// 카탈로그 목록 해석 (빈 줄 무시)
pub fn parse_catalog(blob: &str) -> Vec<String> {
    blob.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// 10진수 파일 크기 해석
pub fn parse_file_size(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::protocol(format!("유효하지 않은 파일 크기: {:?}", truncate(text))));
    }
    text.parse::<u64>()
        .map_err(|_| Error::protocol(format!("파일 크기 범위 초과: {}", text)))
}

/// 파일 이름 검증 (경로 구분자, 콜론, 제어 문자, `.`/`..` 금지)
pub fn validate_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control());
    if valid {
        Ok(name)
    } else {
        Err(Error::protocol(format!("유효하지 않은 토큰/파일 이름: {:?}", truncate(name))))
    }
}

fn parse_chunk_request(rest: &str) -> Result<ChunkRequest> {
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != 4 && parts.len() != 5 {
        return Err(Error::protocol(format!("CHUNK_REQUEST 필드 수 오류: {}", parts.len() + 1)));
    }

    let file = validate_name(parts[0])?.to_string();
    let index = parse_field::<usize>(parts[1], "index")?;
    let start = parse_field::<u64>(parts[2], "start")?;
    let end = parse_field::<u64>(parts[3], "end")?;
    let resume_seq = match parts.get(4) {
        Some(seq) => Some(parse_field::<u32>(seq, "resume_seq")?),
        None => None,
    };

    Ok(ChunkRequest {
        file,
        index,
        start,
        end,
        resume_seq,
    })
}

fn parse_ack(rest: &str) -> Result<AckMessage> {
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != 3 {
        return Err(Error::protocol(format!("ACK 필드 수 오류: {}", parts.len() + 1)));
    }
    Ok(AckMessage {
        file: validate_name(parts[0])?.to_string(),
        index: parse_field::<usize>(parts[1], "index")?,
        seq: parse_field::<u32>(parts[2], "seq")?,
    })
}

fn parse_field<T: std::str::FromStr>(text: &str, field: &str) -> Result<T> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::protocol(format!("{} 필드 오류: {:?}", field, truncate(text))));
    }
    text.parse::<T>()
        .map_err(|_| Error::protocol(format!("{} 필드 범위 초과: {}", field, text)))
}

/// 로그용 앞부분만 표시
fn truncate(text: &str) -> &str {
    match text.char_indices().nth(64) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_request_with_resume() {
        let req = Request::parse("CHUNK_REQUEST:movie.mp4:2:2000:2999:7").unwrap();
        match &req {
            Request::ChunkRequest(r) => {
                assert_eq!(r.file, "movie.mp4");
                assert_eq!(r.index, 2);
                assert_eq!((r.start, r.end), (2000, 2999));
                assert_eq!(r.resume_seq, Some(7));
                assert_eq!(r.len(), 1000);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(req.encode(), "CHUNK_REQUEST:movie.mp4:2:2000:2999:7");
    }

    #[test]
    fn test_stream_chunk_request_has_no_resume() {
        let job = ChunkJob::new(1, 1000, 2000);
        let req = ChunkRequest::for_job("a.bin", &job).unwrap();
        assert_eq!(
            Request::ChunkRequest(req).encode(),
            "CHUNK_REQUEST:a.bin:1:1000:1999"
        );
        assert!(ChunkRequest::for_job("a.bin", &ChunkJob::new(0, 0, 0)).is_none());
    }

    #[test]
    fn test_malformed_requests_are_violations() {
        for bad in [
            "CHUNK_REQUEST:a.bin:1:2",
            "CHUNK_REQUEST:a.bin:x:0:10",
            "CHUNK_REQUEST:a.bin:1:0:10:1:2",
            "CHUNK_REQUEST::1:0:10",
            "ACK:a.bin:1",
            "ACK:a.bin:1:-3",
            "",
            "../etc/passwd",
            "UNKNOWN:TOKEN",
        ] {
            assert!(
                matches!(Request::parse(bad), Err(Error::ProtocolViolation(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_plain_name_is_file_request() {
        assert_eq!(
            Request::parse("report.pdf").unwrap(),
            Request::File("report.pdf".into())
        );
        assert_eq!(Request::parse("QUIT").unwrap(), Request::Quit);
    }

    #[test]
    fn test_ack_round_trip() {
        let ack = Request::Ack(AckMessage {
            file: "a.bin".into(),
            index: 3,
            seq: 41,
        });
        assert_eq!(ack.encode(), "ACK:a.bin:3:41");
        assert_eq!(Request::parse(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn test_reply_strict() {
        assert_eq!(Reply::parse("NOT_FOUND").unwrap(), Reply::NotFound);
        assert!(Reply::parse("ok").is_err());
        assert!(Reply::expect("DATA_START", Reply::DataEnd).is_err());
        assert!(Reply::expect("READY", Reply::Ready).is_ok());
    }

    #[test]
    fn test_catalog_and_size() {
        let blob = encode_catalog(&["a.bin", "b.txt"]);
        assert_eq!(blob, "a.bin\nb.txt\n");
        assert_eq!(parse_catalog("a.bin\n\n  b.txt \n"), vec!["a.bin", "b.txt"]);

        assert_eq!(parse_file_size("4001").unwrap(), 4001);
        assert!(parse_file_size("-1").is_err());
        assert!(parse_file_size("12ab").is_err());
        assert!(parse_file_size("").is_err());
    }
}
