//! 랑데부 배리어 (TCP lockstep 동기화)
//!
//! 모든 참가자가 한 라운드를 마칠 때까지 다음 라운드로 넘어가지 않는다.
//! `tokio::sync::Barrier`와 달리 참가자 이탈(`leave`)과 중단(`abandon`)을
//! 지원하여, 먼저 끝난 워커나 실패한 워커가 나머지를 교착시키지 않는다.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{Error, Result};

#[derive(Debug)]
struct State {
    /// 남아 있는 참가자 수
    parties: usize,
    /// 현재 라운드에 도착한 참가자 수
    arrived: usize,
    /// 완료된 라운드 수
    generation: u64,
    broken: bool,
}

impl State {
    fn release(&mut self) {
        self.arrived = 0;
        self.generation += 1;
    }
}

/// 라운드 배리어
#[derive(Debug)]
pub struct RoundBarrier {
    state: Mutex<State>,
    notify: Notify,
}

impl RoundBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(State {
                parties,
                arrived: 0,
                generation: 0,
                broken: false,
            }),
            notify: Notify::new(),
        }
    }

    /// 현재 라운드의 모든 참가자를 기다림
    ///
    /// 타임아웃 시 배리어를 중단시키고 `BarrierTimeout`을 반환한다.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let generation = {
            let mut state = self.state.lock();
            if state.broken {
                return Err(Error::BarrierBroken);
            }
            state.arrived += 1;
            if state.arrived >= state.parties {
                state.release();
                drop(state);
                self.notify.notify_waiters();
                return Ok(());
            }
            state.generation
        };

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // 상태 확인 전에 등록해야 notify_waiters를 놓치지 않음
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.generation != generation {
                    return Ok(());
                }
                if state.broken {
                    return Err(Error::BarrierBroken);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return Ok(());
                }
                state.broken = true;
                drop(state);
                self.notify.notify_waiters();
                return Err(Error::BarrierTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// 정상 종료한 참가자 이탈
    pub fn leave(&self) {
        let mut state = self.state.lock();
        state.parties = state.parties.saturating_sub(1);
        if state.arrived > 0 && state.arrived >= state.parties {
            state.release();
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// 실패한 참가자가 배리어 중단
    pub fn abandon(&self) {
        self.state.lock().broken = true;
        self.notify.notify_waiters();
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }

    /// 완료된 라운드 수
    pub fn rounds(&self) -> u64 {
        self.state.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lockstep_bound() {
        let workers = 4;
        let rounds_per_worker = [5u64, 8, 8, 12];
        let barrier = Arc::new(RoundBarrier::new(workers));
        let counts: Arc<Vec<AtomicU64>> = Arc::new((0..workers).map(|_| AtomicU64::new(0)).collect());
        let finished: Arc<Vec<AtomicBool>> = Arc::new((0..workers).map(|_| AtomicBool::new(false)).collect());

        let mut handles = Vec::new();
        for (me, &rounds) in rounds_per_worker.iter().enumerate() {
            let barrier = barrier.clone();
            let counts = counts.clone();
            let finished = finished.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..rounds {
                    let mine = counts[me].fetch_add(1, Ordering::SeqCst) + 1;
                    for other in 0..counts.len() {
                        if other == me || finished[other].load(Ordering::SeqCst) {
                            continue;
                        }
                        let theirs = counts[other].load(Ordering::SeqCst);
                        assert!(mine.abs_diff(theirs) <= 1, "worker {} at {}, worker {} at {}", me, mine, other, theirs);
                    }
                    tokio::task::yield_now().await;
                    barrier.wait(WAIT).await.unwrap();
                }
                finished[me].store(true, Ordering::SeqCst);
                barrier.leave();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(barrier.rounds(), 12);
    }

    #[tokio::test]
    async fn test_abandon_wakes_waiters() {
        let barrier = Arc::new(RoundBarrier::new(3));

        let a = tokio::spawn({
            let barrier = barrier.clone();
            async move { barrier.wait(WAIT).await }
        });
        let b = tokio::spawn({
            let barrier = barrier.clone();
            async move { barrier.wait(WAIT).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        barrier.abandon();

        assert!(matches!(a.await.unwrap(), Err(Error::BarrierBroken)));
        assert!(matches!(b.await.unwrap(), Err(Error::BarrierBroken)));
        assert!(matches!(barrier.wait(WAIT).await, Err(Error::BarrierBroken)));
    }

    #[tokio::test]
    async fn test_timeout_breaks_barrier() {
        let barrier = RoundBarrier::new(2);
        let err = barrier.wait(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, Error::BarrierTimeout { waited_ms: 30 }));
        assert!(barrier.is_broken());
    }

    #[tokio::test]
    async fn test_leave_releases_current_round() {
        let barrier = Arc::new(RoundBarrier::new(2));
        let waiter = tokio::spawn({
            let barrier = barrier.clone();
            async move { barrier.wait(WAIT).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        barrier.leave();
        waiter.await.unwrap().unwrap();

        // 남은 참가자 혼자서는 즉시 통과
        barrier.wait(WAIT).await.unwrap();
        assert_eq!(barrier.rounds(), 2);
    }
}
