//! 청크 계획과 조립
//!
//! - ChunkJob: 파일 바이트 범위 `[0, file_size)`를 N개로 나눈 연속 구간
//! - ChunkBuffer: 워커 하나가 독점하는 수신 버퍼
//! - 조립: 크기 검증이 끝난 뒤에만 인덱스 순서대로 파일 기록

use std::fmt;
use std::io::Write;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::{Error, Result};

/// 청크 작업 (파일 내 연속 바이트 구간)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkJob {
    /// 청크 인덱스 (0..N)
    pub index: usize,

    /// 시작 오프셋 (포함)
    pub start: u64,

    /// 끝 오프셋 (미포함)
    pub end: u64,

    /// 구간 크기 (end - start)
    pub size: u64,
}

impl ChunkJob {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            size: end.saturating_sub(start),
        }
    }

    /// 와이어 형식의 마지막 바이트 오프셋 (포함), 빈 구간이면 None
    pub fn last_byte(&self) -> Option<u64> {
        if self.size == 0 {
            None
        } else {
            Some(self.end - 1)
        }
    }

    /// 와이어 형식 `start:end` (end 포함)에서 복원
    pub fn from_inclusive(index: usize, start: u64, last: u64) -> Result<Self> {
        if last < start {
            return Err(Error::protocol(format!(
                "잘못된 청크 범위: start={} end={}",
                start, last
            )));
        }
        let end = last
            .checked_add(1)
            .ok_or_else(|| Error::protocol("청크 범위 오버플로우"))?;
        Ok(Self::new(index, start, end))
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Display for ChunkJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_byte() {
            Some(last) => write!(f, "#{} [{}, {}]", self.index, self.start, last),
            None => write!(f, "#{} [empty]", self.index),
        }
    }
}

/// 파일을 `workers`개의 청크로 분할
///
/// 마지막 청크가 나머지 바이트를 흡수한다. `file_size < workers`이면
/// 앞쪽 청크들은 빈 구간이 된다.
pub fn plan_chunks(file_size: u64, workers: usize) -> Vec<ChunkJob> {
    let workers = workers.max(1);
    let base = file_size / workers as u64;

    (0..workers)
        .map(|index| {
            let start = index as u64 * base;
            let end = if index == workers - 1 {
                file_size
            } else {
                start + base
            };
            ChunkJob::new(index, start, end)
        })
        .collect()
}

/// 수신 버퍼 초기 예약 상한 (1MB), 이후는 수신량만큼 증가
const INITIAL_CAPACITY: u64 = 1024 * 1024;

/// 청크 수신 버퍼 (워커 독점)
#[derive(Debug)]
pub struct ChunkBuffer {
    job: ChunkJob,
    data: BytesMut,
}

impl ChunkBuffer {
    pub fn new(job: ChunkJob) -> Self {
        Self {
            job,
            data: BytesMut::with_capacity(job.size.min(INITIAL_CAPACITY) as usize),
        }
    }

    pub fn job(&self) -> &ChunkJob {
        &self.job
    }

    /// 수신된 바이트 수
    pub fn received(&self) -> u64 {
        self.data.len() as u64
    }

    /// 남은 바이트 수
    pub fn remaining(&self) -> u64 {
        self.job.size - self.received()
    }

    /// 파일 기준 다음 기대 오프셋
    pub fn next_offset(&self) -> u64 {
        self.job.start + self.received()
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.job.size
    }

    /// 데이터 추가 (청크 크기 초과 시 거부)
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > self.remaining() {
            return Err(Error::protocol(format!(
                "청크 {} 범위 초과: {} bytes 남음, {} bytes 수신",
                self.job.index,
                self.remaining(),
                bytes.len()
            )));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// 읽기 전용 완료 청크로 변환
    pub fn freeze(self) -> CompletedChunk {
        CompletedChunk {
            index: self.job.index,
            data: self.data.freeze(),
        }
    }
}

/// 워커가 완료 보고한 읽기 전용 청크
#[derive(Debug, Clone)]
pub struct CompletedChunk {
    pub index: usize,
    pub data: Bytes,
}

impl CompletedChunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 전달된 바이트 합계 검증 후 인덱스 순서대로 조립
pub fn assemble(file_size: u64, chunks: &[CompletedChunk]) -> Result<Bytes> {
    let ordered = validate(file_size, chunks)?;

    // 알린 크기가 아니라 실제로 받은 바이트만큼 예약
    let total = ordered.iter().map(|c| c.data.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for chunk in ordered {
        out.extend_from_slice(&chunk.data);
    }
    Ok(out.freeze())
}

/// 검증 후 임시 파일에 기록하고 원자적으로 `dest`로 이동
///
/// 검증 실패 시 파일 시스템은 변경되지 않는다.
pub fn write_assembled(dest: &Path, file_size: u64, chunks: &[CompletedChunk]) -> Result<()> {
    let ordered = validate(file_size, chunks)?;

    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    for chunk in ordered {
        tmp.write_all(&chunk.data)?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| Error::Io(e.error))?;

    debug!("파일 기록 완료: {:?} ({} bytes)", dest, file_size);
    Ok(())
}

/// 인덱스 0..N 순서로 정렬하고 총 크기 확인
fn validate(file_size: u64, chunks: &[CompletedChunk]) -> Result<Vec<&CompletedChunk>> {
    let mut ordered: Vec<&CompletedChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let contiguous = ordered.iter().enumerate().all(|(i, c)| c.index == i);
    let total: u64 = ordered.iter().map(|c| c.len()).sum();

    if !contiguous || total != file_size {
        return Err(Error::SizeMismatch {
            expected: file_size,
            got: total,
        });
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(file_size: u64, workers: usize) {
        let jobs = plan_chunks(file_size, workers);
        assert_eq!(jobs.len(), workers);

        let mut cursor = 0;
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.index, i);
            assert_eq!(job.start, cursor, "gap/overlap at {}", job);
            assert_eq!(job.size, job.end - job.start);
            cursor = job.end;
        }
        assert_eq!(cursor, file_size);
        assert_eq!(jobs.iter().map(|j| j.size).sum::<u64>(), file_size);
    }

    #[test]
    fn test_plan_example_4001() {
        let jobs = plan_chunks(4001, 4);
        let ranges: Vec<(u64, u64)> = jobs
            .iter()
            .map(|j| (j.start, j.last_byte().unwrap()))
            .collect();
        assert_eq!(
            ranges,
            vec![(0, 999), (1000, 1999), (2000, 2999), (3000, 4000)]
        );
        let sizes: Vec<u64> = jobs.iter().map(|j| j.size).collect();
        assert_eq!(sizes, vec![1000, 1000, 1000, 1001]);
    }

    #[test]
    fn test_plan_partitions_many_sizes() {
        for size in [0, 1, 3, 4, 5, 1000, 4001, 65_537, 1 << 20] {
            for workers in 1..=8 {
                assert_partition(size, workers);
            }
        }
    }

    #[test]
    fn test_plan_smaller_than_workers() {
        let jobs = plan_chunks(3, 4);
        assert!(jobs[..3].iter().all(|j| j.is_empty()));
        assert_eq!(jobs[3].size, 3);
        assert_eq!(jobs[3].to_string(), "#3 [0, 2]");
    }

    #[test]
    fn test_inclusive_round_trip() {
        let job = ChunkJob::from_inclusive(2, 2000, 2999).unwrap();
        assert_eq!(job.size, 1000);
        assert_eq!(job.last_byte(), Some(2999));
        assert!(ChunkJob::from_inclusive(0, 10, 9).is_err());
    }

    #[test]
    fn test_buffer_rejects_overflow() {
        let mut buffer = ChunkBuffer::new(ChunkJob::new(0, 100, 110));
        buffer.append(&[1; 6]).unwrap();
        assert_eq!(buffer.next_offset(), 106);
        assert!(buffer.append(&[2; 5]).is_err());
        buffer.append(&[3; 4]).unwrap();
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_huge_advertised_size_reserves_little() {
        let job = plan_chunks(u64::MAX, 4)[0];
        let mut buffer = ChunkBuffer::new(job);
        assert!(buffer.data.capacity() as u64 <= INITIAL_CAPACITY);

        buffer.append(b"abc").unwrap();
        assert_eq!(buffer.received(), 3);
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_assemble_in_index_order() {
        // 완료 순서와 무관하게 인덱스 순서로 조립
        let chunks = vec![
            CompletedChunk { index: 1, data: Bytes::from_static(b"world") },
            CompletedChunk { index: 0, data: Bytes::from_static(b"hello ") },
        ];
        assert_eq!(assemble(11, &chunks).unwrap().as_ref(), b"hello world");
    }

    #[test]
    fn test_size_mismatch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let chunks = vec![
            CompletedChunk { index: 0, data: Bytes::from_static(b"abc") },
            CompletedChunk { index: 1, data: Bytes::from_static(b"de") },
        ];

        let err = write_assembled(&dest, 6, &chunks).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 6, got: 5 }));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_index_is_mismatch() {
        let chunks = vec![
            CompletedChunk { index: 0, data: Bytes::from_static(b"abc") },
            CompletedChunk { index: 2, data: Bytes::from_static(b"def") },
        ];
        assert!(matches!(assemble(6, &chunks), Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_write_assembled() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let chunks = vec![
            CompletedChunk { index: 0, data: Bytes::from_static(b"abc") },
            CompletedChunk { index: 1, data: Bytes::from_static(b"def") },
        ];
        write_assembled(&dest, 6, &chunks).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
    }
}
