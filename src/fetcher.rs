//! 병렬 청크 수신기
//!
//! 청크마다 워커 태스크 하나를 띄우고 모두 합류시킨다. 첫 실패에서 나머지
//! 워커를 중단하며, 다른 워커 실패로 파생된 에러가 근본 원인을 가리지 않는다.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chunk::{plan_chunks, write_assembled, ChunkJob, CompletedChunk};
use crate::{Error, Result};

/// 다운로드 결과
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub dest: PathBuf,
    pub file_size: u64,
    pub chunks: usize,
    pub elapsed: Duration,
}

impl DownloadReport {
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.file_size as f64 / secs
    }
}

/// 청크 작업을 병렬로 수신
///
/// 빈 청크는 네트워크 교환 없이 로컬에서 완료한다. 결과는 인덱스 순서.
pub async fn fetch_chunks<F, Fut>(jobs: Vec<ChunkJob>, worker: F) -> Result<Vec<CompletedChunk>>
where
    F: Fn(ChunkJob) -> Fut,
    Fut: Future<Output = Result<CompletedChunk>> + Send + 'static,
{
    let mut completed = Vec::with_capacity(jobs.len());
    let mut set = JoinSet::new();

    for job in jobs {
        if job.is_empty() {
            completed.push(CompletedChunk {
                index: job.index,
                data: Bytes::new(),
            });
            continue;
        }
        let fut = worker(job);
        set.spawn(async move { (job.index, fut.await) });
    }

    let mut failure: Option<Error> = None;
    while let Some(joined) = set.join_next().await {
        let error = match joined {
            Ok((_, Ok(chunk))) => {
                debug!("청크 {} 완료 ({} bytes)", chunk.index, chunk.len());
                completed.push(chunk);
                continue;
            }
            Ok((index, Err(e))) => Error::ChunkFailed {
                index,
                source: Box::new(e),
            },
            Err(e) if e.is_cancelled() => continue,
            Err(e) => Error::WorkerAborted(e.to_string()),
        };

        // 파생 에러만으로는 중단하지 않고 근본 원인을 기다림
        if !is_secondary(&error) {
            set.abort_all();
        }
        let replace = match &failure {
            None => true,
            Some(current) => is_secondary(current) && !is_secondary(&error),
        };
        if replace {
            failure = Some(error);
        } else {
            debug!("추가 워커 실패 무시: {}", error);
        }
    }

    if let Some(error) = failure {
        warn!("{}", error);
        return Err(error);
    }

    completed.sort_by_key(|c| c.index);
    Ok(completed)
}

fn is_secondary(error: &Error) -> bool {
    match error {
        Error::ChunkFailed { source, .. } => source.is_secondary(),
        other => other.is_secondary(),
    }
}

/// 계획 → 병렬 수신 → 검증 → 원자적 기록
pub async fn download<F, Fut>(dest: &Path, file_size: u64, workers: usize, worker: F) -> Result<DownloadReport>
where
    F: Fn(ChunkJob) -> Fut,
    Fut: Future<Output = Result<CompletedChunk>> + Send + 'static,
{
    let started = Instant::now();
    let jobs = plan_chunks(file_size, workers);
    let count = jobs.len();

    let chunks = fetch_chunks(jobs, worker).await?;

    let path = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_assembled(&path, file_size, &chunks))
        .await
        .map_err(|e| Error::WorkerAborted(e.to_string()))??;

    let report = DownloadReport {
        dest: dest.to_path_buf(),
        file_size,
        chunks: count,
        elapsed: started.elapsed(),
    };
    info!(
        "다운로드 완료: {:?} ({} bytes, {} chunks, {:.2}s)",
        report.dest,
        report.file_size,
        report.chunks,
        report.elapsed.as_secs_f64()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>())
    }

    fn slice_worker(data: Bytes) -> impl Fn(ChunkJob) -> std::future::Ready<Result<CompletedChunk>> {
        move |job| {
            std::future::ready(Ok(CompletedChunk {
                index: job.index,
                data: data.slice(job.start as usize..job.end as usize),
            }))
        }
    }

    #[tokio::test]
    async fn test_download_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let data = sample(4001);

        let report = download(&dest, 4001, 4, slice_worker(data.clone())).await.unwrap();
        assert_eq!(report.chunks, 4);
        assert_eq!(std::fs::read(&dest).unwrap(), data.as_ref());
    }

    #[tokio::test]
    async fn test_empty_chunks_are_local() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tiny.bin");

        // 크기 3, 워커 4: 앞의 세 청크는 비어 있으므로 워커를 호출하지 않음
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let worker = move |job: ChunkJob| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                Ok::<_, Error>(CompletedChunk {
                    index: job.index,
                    data: Bytes::from_static(b"abc"),
                })
            }
        };

        download(&dest, 3, 4, worker).await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_zero_size_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty.bin");
        download(&dest, 0, 4, slice_worker(Bytes::new())).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_root_cause_not_masked() {
        let jobs = plan_chunks(400, 4);
        let worker = |job: ChunkJob| async move {
            match job.index {
                // 파생 에러가 먼저 도착
                0 | 1 => Err::<CompletedChunk, _>(Error::BarrierBroken),
                2 => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(Error::Timeout { index: 2, stalls: 3 })
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Err(Error::BarrierBroken)
                }
            }
        };

        let err = fetch_chunks(jobs, worker).await.unwrap_err();
        match err {
            Error::ChunkFailed { index, source } => {
                assert_eq!(index, 2);
                assert!(matches!(*source, Error::Timeout { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_aborts_siblings() {
        let jobs = plan_chunks(400, 4);
        let worker = |job: ChunkJob| async move {
            if job.index == 1 {
                return Err(Error::ConnectionClosed);
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CompletedChunk {
                index: job.index,
                data: Bytes::new(),
            })
        };

        let started = Instant::now();
        let err = fetch_chunks(jobs, worker).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(err.to_string(), "chunk 1 failed: 연결 종료");
    }

    #[tokio::test]
    async fn test_short_chunk_fails_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("short.bin");
        let worker = |job: ChunkJob| async move {
            Ok::<_, Error>(CompletedChunk {
                index: job.index,
                data: Bytes::from(vec![0u8; (job.size as usize).saturating_sub(1)]),
            })
        };

        let err = download(&dest, 100, 2, worker).await.unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 100, got: 98 }));
        assert!(!dest.exists());
    }
}
