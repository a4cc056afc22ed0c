//! SQLite 저장소 어댑터.
//!
//! - `deferred`: 오프라인 지연 요청 저장 (`DeferredStore` 포트)

mod deferred;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tether_core::error::CoreError;
use tracing::info;

use crate::migration;

/// SQLite 저장소
///
/// 연결 하나를 뮤텍스로 직렬화한다. 파일 모드는 WAL 저널을 사용한다.
pub struct SqliteStorage {
    pub(super) conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// 파일 기반 저장소 (상위 디렉토리가 없으면 생성)
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Storage(format!("DB 디렉토리 생성 실패: {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("SQLite 열기 실패: {e}")))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )
        .map_err(|e| CoreError::Storage(format!("PRAGMA 설정 실패: {e}")))?;

        let storage = Self::prepare(conn)?;
        info!("SQLite 저장소 초기화: {}", path.display());
        Ok(storage)
    }

    /// 인메모리 저장소 (테스트, 임시 실행)
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Storage(format!("인메모리 SQLite 생성 실패: {e}")))?;
        Self::prepare(conn)
    }

    fn prepare(mut conn: Connection) -> Result<Self, CoreError> {
        migration::run_migrations(&mut conn)
            .map_err(|e| CoreError::Storage(format!("마이그레이션 실패: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
