//! TCP 스트림 프레이밍
//!
//! 프레임: `[kind: u8][len: u32 BE][payload]`
//! - kind 0: 컨트롤 토큰 (UTF-8 텍스트)
//! - kind 1: 원시 데이터
//!
//! 데이터 프레임이 토큰과 혼동되지 않고, 짧은 읽기로 토큰이 쪼개지지 않는다.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Reply, Request};
use crate::{Error, Result, MAX_STREAM_FRAME};

/// 프레임 헤더 크기
pub const HEADER_LEN: usize = 5;

mod kind {
    pub const CONTROL: u8 = 0;
    pub const DATA: u8 = 1;
}

/// 스트림 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Control(String),
    Data(Bytes),
}

impl StreamFrame {
    /// 컨트롤 토큰을 요청으로 해석
    pub fn into_request(self) -> Result<Request> {
        match self {
            StreamFrame::Control(text) => Request::parse(&text),
            StreamFrame::Data(data) => Err(Error::protocol(format!(
                "컨트롤 토큰 기대, 데이터 {} bytes 수신",
                data.len()
            ))),
        }
    }

    /// 컨트롤 토큰 텍스트 (데이터 프레임이면 위반)
    pub fn into_control(self) -> Result<String> {
        match self {
            StreamFrame::Control(text) => Ok(text),
            StreamFrame::Data(data) => Err(Error::protocol(format!(
                "컨트롤 토큰 기대, 데이터 {} bytes 수신",
                data.len()
            ))),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, kind: u8, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_STREAM_FRAME {
        return Err(Error::protocol(format!("프레임이 너무 큼: {} bytes", payload.len())));
    }
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0] = kind;
    hdr[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&hdr).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// 컨트롤 토큰 전송
pub async fn write_control<W: AsyncWrite + Unpin>(stream: &mut W, token: &str) -> Result<()> {
    write_frame(stream, kind::CONTROL, token.as_bytes()).await
}

pub async fn write_request<W: AsyncWrite + Unpin>(stream: &mut W, request: &Request) -> Result<()> {
    write_control(stream, &request.encode()).await
}

pub async fn write_reply<W: AsyncWrite + Unpin>(stream: &mut W, reply: Reply) -> Result<()> {
    write_control(stream, reply.as_str()).await
}

/// 원시 데이터 전송
pub async fn write_data<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    write_frame(stream, kind::DATA, data).await
}

/// 프레임 하나 읽기
///
/// 상대가 프레임 경계에서 연결을 닫으면 `ConnectionClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R, max_len: usize) -> Result<StreamFrame> {
    let mut hdr = [0u8; HEADER_LEN];
    match stream.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;
    if len > max_len.min(MAX_STREAM_FRAME) {
        return Err(Error::protocol(format!(
            "프레임이 너무 큼: {} bytes (최대 {})",
            len,
            max_len.min(MAX_STREAM_FRAME)
        )));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await?;
    }

    match hdr[0] {
        kind::CONTROL => {
            let text = String::from_utf8(payload)
                .map_err(|_| Error::protocol("UTF-8이 아닌 컨트롤 토큰"))?;
            Ok(StreamFrame::Control(text))
        }
        kind::DATA => Ok(StreamFrame::Data(Bytes::from(payload))),
        other => Err(Error::protocol(format!("알 수 없는 프레임 종류: {}", other))),
    }
}

/// 타임아웃 있는 프레임 읽기
pub async fn read_frame_timed<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: usize,
    timeout: Duration,
) -> Result<StreamFrame> {
    match tokio::time::timeout(timeout, read_frame(stream, max_len)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("프레임 읽기 타임아웃 ({} ms)", timeout.as_millis()),
        ))),
    }
}

/// 컨트롤 토큰 하나 읽어 요청으로 해석
pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R, timeout: Duration) -> Result<Request> {
    read_frame_timed(stream, CONTROL_MAX, timeout).await?.into_request()
}

/// 컨트롤 토큰 하나 읽어 기대한 응답인지 확인
pub async fn expect_reply<R: AsyncRead + Unpin>(stream: &mut R, expected: Reply, timeout: Duration) -> Result<()> {
    let text = read_frame_timed(stream, CONTROL_MAX, timeout).await?.into_control()?;
    Reply::expect(&text, expected)
}

/// 컨트롤 토큰 최대 길이 (카탈로그 목록 포함)
pub const CONTROL_MAX: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_data_never_confused_with_token() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        // 페이로드가 우연히 "DATA_END"와 같아도 데이터 프레임으로 구분
        write_data(&mut a, b"DATA_END").await.unwrap();
        write_reply(&mut a, Reply::DataEnd).await.unwrap();

        assert_eq!(
            read_frame(&mut b, 1024).await.unwrap(),
            StreamFrame::Data(Bytes::from_static(b"DATA_END"))
        );
        assert_eq!(
            read_frame(&mut b, 1024).await.unwrap(),
            StreamFrame::Control("DATA_END".into())
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_data(&mut a, &[7u8; 2000]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, 1024).await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_close_at_boundary() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b, 64).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_request(&mut a, &Request::Chunk).await.unwrap();
        write_control(&mut a, "BOGUS:1").await.unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(read_request(&mut b, timeout).await.unwrap(), Request::Chunk);
        assert!(matches!(
            read_request(&mut b, timeout).await,
            Err(Error::ProtocolViolation(_))
        ));
    }
}
