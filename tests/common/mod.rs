#![allow(dead_code)]

use std::path::Path;

use cfp::{Catalog, Config};
use tempfile::TempDir;

pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// 서버 루트와 다운로드 디렉토리
pub struct Fixture {
    pub root: TempDir,
    pub dest: TempDir,
}

impl Fixture {
    /// `files`를 루트에 만들고 `extra` 이름은 목록에만 등록
    pub fn new(files: &[(&str, usize)], extra: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let mut list = String::new();
        for (name, size) in files {
            std::fs::write(root.path().join(name), sample(*size)).unwrap();
            list.push_str(name);
            list.push('\n');
        }
        for name in extra {
            list.push_str(name);
            list.push('\n');
        }
        std::fs::write(root.path().join("files.txt"), list).unwrap();
        Self { root, dest }
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::load(self.root.path(), &self.root.path().join("files.txt")).unwrap()
    }

    pub fn dest_path(&self, name: &str) -> std::path::PathBuf {
        self.dest.path().join(name)
    }

    pub fn source(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.root.path().join(name)).unwrap()
    }
}

pub fn assert_same(a: &Path, expected: &[u8]) {
    let got = std::fs::read(a).unwrap();
    assert_eq!(got.len(), expected.len(), "size differs for {:?}", a);
    assert!(got == expected, "content differs for {:?}", a);
}

/// 루프백 테스트용 짧은 타임아웃
pub fn fast_config(workers: usize) -> Config {
    Config {
        workers,
        pacing_us: 50,
        initial_timeout_ms: 100,
        max_timeout_ms: 400,
        max_stalls: 30,
        control_timeout_ms: 500,
        ack_timeout_ms: 5000,
        barrier_timeout_ms: 10_000,
        progress_interval_ms: 60_000,
        ..Config::default()
    }
}
