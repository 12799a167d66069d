//! 전송 통계
//!
//! 전송 정확성 상태와 분리된 자체 락으로 보호된다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::chunk::ChunkJob;

/// 청크별 진행 상황
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    pub index: usize,

    /// 청크 크기
    pub expected: u64,

    /// 수신 확정 바이트
    pub received: u64,

    /// 수락된 프레임 수
    pub accepted_frames: u64,

    /// 중복 수신 프레임 수
    pub duplicates: u64,

    /// 다이제스트 불일치 프레임 수
    pub corrupt: u64,

    /// 재전송 요청 수
    pub resends: u64,

    /// 수신 타임아웃 횟수
    pub timeouts: u64,
}

/// 다운로드 하나의 전송 통계
#[derive(Debug)]
pub struct TransferStats {
    file: String,
    file_size: u64,
    start_time: Instant,
    chunks: Mutex<Vec<ChunkProgress>>,
}

impl TransferStats {
    pub fn new(file: impl Into<String>, file_size: u64, jobs: &[ChunkJob]) -> Self {
        let chunks = jobs
            .iter()
            .map(|job| ChunkProgress {
                index: job.index,
                expected: job.size,
                ..ChunkProgress::default()
            })
            .collect();
        Self {
            file: file.into(),
            file_size,
            start_time: Instant::now(),
            chunks: Mutex::new(chunks),
        }
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut ChunkProgress)) {
        let mut chunks = self.chunks.lock();
        if let Some(progress) = chunks.iter_mut().find(|p| p.index == index) {
            f(progress);
        }
    }

    /// 수락된 프레임 기록
    pub fn record_accepted(&self, index: usize, len: usize) {
        self.update(index, |p| {
            p.accepted_frames += 1;
            p.received += len as u64;
        });
    }

    pub fn record_duplicate(&self, index: usize) {
        self.update(index, |p| p.duplicates += 1);
    }

    pub fn record_corrupt(&self, index: usize) {
        self.update(index, |p| p.corrupt += 1);
    }

    pub fn record_resend(&self, index: usize) {
        self.update(index, |p| p.resends += 1);
    }

    pub fn record_timeout(&self, index: usize) {
        self.update(index, |p| p.timeouts += 1);
    }

    pub fn snapshot(&self) -> Vec<ChunkProgress> {
        self.chunks.lock().clone()
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// 총 수신 바이트
    pub fn total_received(&self) -> u64 {
        self.chunks.lock().iter().map(|p| p.received).sum()
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_received() as f64 / elapsed
    }

    /// 진행률 (0.0 ~ 1.0)
    pub fn fraction(&self) -> f64 {
        if self.file_size == 0 {
            return 1.0;
        }
        self.total_received() as f64 / self.file_size as f64
    }

    /// 진행률 한 줄
    pub fn progress_line(&self) -> String {
        let chunks = self.snapshot();
        let per_chunk: Vec<String> = chunks
            .iter()
            .map(|p| {
                let pct = if p.expected == 0 {
                    100.0
                } else {
                    p.received as f64 * 100.0 / p.expected as f64
                };
                format!("#{} {:.0}%", p.index, pct)
            })
            .collect();
        format!(
            "{}: {:.1}% ({}) | {:.2} MB/s",
            self.file,
            self.fraction() * 100.0,
            per_chunk.join(" "),
            self.throughput() / 1_000_000.0,
        )
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let chunks = self.snapshot();
        let sum = |f: fn(&ChunkProgress) -> u64| chunks.iter().map(f).sum::<u64>();
        format!(
            "{}: {}/{} bytes in {:.2}s | {:.2} MB/s | frames: {} | dup: {} | corrupt: {} | resends: {} | timeouts: {}",
            self.file,
            sum(|p| p.received),
            self.file_size,
            self.elapsed().as_secs_f64(),
            self.throughput() / 1_000_000.0,
            sum(|p| p.accepted_frames),
            sum(|p| p.duplicates),
            sum(|p| p.corrupt),
            sum(|p| p.resends),
            sum(|p| p.timeouts),
        )
    }

    /// 주기적 진행률 로그 태스크 (호출측이 abort)
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("{}", stats.progress_line());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::plan_chunks;

    #[test]
    fn test_counters_per_chunk() {
        let jobs = plan_chunks(4001, 4);
        let stats = TransferStats::new("a.bin", 4001, &jobs);

        stats.record_accepted(3, 1001);
        stats.record_accepted(0, 500);
        stats.record_duplicate(0);
        stats.record_corrupt(1);
        stats.record_resend(1);
        stats.record_timeout(2);
        stats.record_accepted(9, 10); // 없는 청크는 무시

        let snapshot = stats.snapshot();
        assert_eq!(snapshot[0].received, 500);
        assert_eq!(snapshot[0].duplicates, 1);
        assert_eq!(snapshot[1].corrupt, 1);
        assert_eq!(snapshot[1].resends, 1);
        assert_eq!(snapshot[2].timeouts, 1);
        assert_eq!(snapshot[3].received, 1001);
        assert_eq!(stats.total_received(), 1501);

        let summary = stats.summary();
        assert!(summary.contains("1501/4001 bytes"));
        assert!(summary.contains("resends: 1"));
        assert!(stats.progress_line().contains("#3 100%"));
    }

    #[test]
    fn test_empty_file_is_complete() {
        let stats = TransferStats::new("empty", 0, &plan_chunks(0, 4));
        assert_eq!(stats.fraction(), 1.0);
    }
}
