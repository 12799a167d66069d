//! 서버 파일 카탈로그
//!
//! 목록 파일(개행 구분)에 등록되어 있고 루트 디렉토리 아래에 실제로 존재하는
//! 일반 파일만 제공한다.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::message::{encode_catalog, parse_catalog, validate_name};
use crate::Result;

/// 조회 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// 파일 카탈로그
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    names: Vec<String>,
}

impl Catalog {
    /// 목록 파일에서 카탈로그 로드 (빈 줄 무시)
    pub fn load(root: impl Into<PathBuf>, list_file: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(list_file)?;
        let catalog = Self::from_names(root, parse_catalog(&text));
        debug!("카탈로그 로드: {:?}, {}개 항목", list_file, catalog.names.len());
        Ok(catalog)
    }

    /// 이름 목록으로 카탈로그 생성
    ///
    /// 파일 이름으로 쓸 수 없는 항목은 경고 후 제외한다.
    pub fn from_names<I, S>(root: impl Into<PathBuf>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| match validate_name(name) {
                Ok(_) => true,
                Err(e) => {
                    warn!("카탈로그 항목 제외: {}", e);
                    false
                }
            })
            .collect();
        Self {
            root: root.into(),
            names,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// 클라이언트에 보낼 목록 텍스트
    pub fn listing(&self) -> String {
        encode_catalog(&self.names)
    }

    /// 이름 조회: 등록되어 있고 루트 아래 일반 파일일 때만 성공
    pub fn lookup(&self, name: &str) -> Option<CatalogEntry> {
        if validate_name(name).is_err() || !self.names.iter().any(|n| n == name) {
            return None;
        }

        let path = self.root.join(name);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Some(CatalogEntry {
                name: name.to_string(),
                path,
                size: meta.len(),
            }),
            Ok(_) => None,
            Err(e) => {
                debug!("카탈로그 파일 없음: {:?} ({})", path, e);
                None
            }
        }
    }
}
