//! 스키마 마이그레이션.
//!
//! 버전 순서대로 나열된 스크립트 중 아직 적용되지 않은 것만 트랜잭션 단위로 실행한다.

use rusqlite::Connection;
use tracing::{debug, info};

/// (버전, 설명, SQL)
const MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "deferred_requests 테이블",
        "
        CREATE TABLE IF NOT EXISTS deferred_requests (
            id TEXT PRIMARY KEY,
            target TEXT NOT NULL,
            method TEXT NOT NULL,
            content_type TEXT,
            payload BLOB,
            entity_type TEXT,
            entity_id TEXT,
            priority INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'PENDING',
            enqueued_at TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            last_error TEXT,
            next_attempt_at TEXT NOT NULL
        );

        -- 처리 순서: 상태별 → 우선순위 높은 순 → 제출 순
        CREATE INDEX IF NOT EXISTS idx_deferred_status_order
            ON deferred_requests(status, priority DESC, sequence);
        ",
    ),
    (
        2,
        "엔티티 인덱스, updated_at 컬럼",
        "
        ALTER TABLE deferred_requests ADD COLUMN updated_at TEXT;

        CREATE INDEX IF NOT EXISTS idx_deferred_entity
            ON deferred_requests(entity_type, entity_id, sequence);
        ",
    ),
];

/// 최신 스키마 버전
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |(version, _, _)| *version)
}

/// 미적용 마이그레이션 실행
pub fn run_migrations(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    info!("현재 스키마 버전: {current}, 목표: {}", latest_version());

    for (version, description, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > current) {
        debug!("마이그레이션 V{version} 실행: {description}");
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()?;
        info!("마이그레이션 V{version} 완료");
    }
    Ok(())
}
