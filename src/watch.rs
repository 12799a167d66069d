//! 다운로드 감시 목록
//!
//! 감시 파일(개행 구분 이름 목록)을 다시 읽어 아직 처리하지 않은 이름만 돌려준다.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::message::parse_catalog;

#[derive(Debug)]
pub struct WatchList {
    path: PathBuf,
    handled: HashSet<String>,
}

impl WatchList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handled: HashSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 새 이름 목록 (파일 순서 유지, 중복 제거)
    ///
    /// 파일이 없거나 읽을 수 없으면 경고 후 빈 목록.
    pub fn poll(&self) -> Vec<String> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                warn!("감시 파일 {:?} 읽기 실패: {}", self.path, e);
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        parse_catalog(&text)
            .into_iter()
            .filter(|name| !self.handled.contains(name) && seen.insert(name.clone()))
            .collect()
    }

    /// 처리 완료 기록 (성공/실패 무관, 다시 요청하지 않음)
    pub fn mark_handled(&mut self, name: &str) {
        self.handled.insert(name.to_string());
    }

    pub fn is_handled(&self, name: &str) -> bool {
        self.handled.contains(name)
    }
}
