//! 지연 요청 저장소 (DeferredStore 포트 구현).
//!
//! 요청 저장, 상태 갱신, 삭제, 상태별 조회.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tether_core::error::CoreError;
use tether_core::models::deferred::{DeferredRequest, DeferredStatus};
use tether_core::models::request::{EntityRef, Payload, RequestPriority};
use tether_core::ports::deferred_store::DeferredStore;
use tracing::debug;

use super::SqliteStorage;

const SELECT_COLUMNS: &str = "id, target, method, content_type, payload, entity_type, entity_id, \
     priority, status, enqueued_at, sequence, retry_count, max_retries, last_error, next_attempt_at";

/// DB 행 원본 (도메인 변환 전)
struct DeferredRow {
    id: String,
    target: String,
    method: String,
    content_type: Option<String>,
    payload: Option<Vec<u8>>,
    entity_type: Option<String>,
    entity_id: Option<String>,
    priority: i64,
    status: String,
    enqueued_at: String,
    sequence: i64,
    retry_count: u32,
    max_retries: u32,
    last_error: Option<String>,
    next_attempt_at: String,
}

impl DeferredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target: row.get(1)?,
            method: row.get(2)?,
            content_type: row.get(3)?,
            payload: row.get(4)?,
            entity_type: row.get(5)?,
            entity_id: row.get(6)?,
            priority: row.get(7)?,
            status: row.get(8)?,
            enqueued_at: row.get(9)?,
            sequence: row.get(10)?,
            retry_count: row.get(11)?,
            max_retries: row.get(12)?,
            last_error: row.get(13)?,
            next_attempt_at: row.get(14)?,
        })
    }

    fn into_request(self) -> Result<DeferredRequest, CoreError> {
        let payload = match (self.content_type, self.payload) {
            (Some(content_type), Some(body)) => Some(Payload { content_type, body }),
            _ => None,
        };
        let entity = match (self.entity_type, self.entity_id) {
            (Some(entity_type), Some(entity_id)) => Some(EntityRef {
                entity_type,
                entity_id,
            }),
            _ => None,
        };

        Ok(DeferredRequest {
            id: self.id,
            target: self.target,
            method: self
                .method
                .parse()
                .map_err(|e| CoreError::Storage(format!("메서드 복원 실패: {e}")))?,
            payload,
            entity,
            priority: RequestPriority::from_rank(self.priority),
            status: self.status.parse()?,
            enqueued_at: parse_time(&self.enqueued_at)?,
            sequence: self.sequence,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error,
            next_attempt_at: parse_time(&self.next_attempt_at)?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::Storage(format!("시각 파싱 실패 ({value}): {e}")))
}

impl SqliteStorage {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|e| CoreError::Storage(format!("잠금 획득 실패: {e}")))
    }
}

#[async_trait]
impl DeferredStore for SqliteStorage {
    async fn add(&self, request: &DeferredRequest) -> Result<(), CoreError> {
        let conn = self.lock_conn()?;
        let (content_type, body) = match &request.payload {
            Some(p) => (Some(p.content_type.as_str()), Some(p.body.as_slice())),
            None => (None, None),
        };
        let (entity_type, entity_id) = match &request.entity {
            Some(e) => (Some(e.entity_type.as_str()), Some(e.entity_id.as_str())),
            None => (None, None),
        };

        conn.execute(
            "INSERT INTO deferred_requests (
                id, target, method, content_type, payload, entity_type, entity_id,
                priority, status, enqueued_at, sequence, retry_count, max_retries,
                last_error, next_attempt_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?10)",
            params![
                request.id,
                request.target,
                request.method.as_str(),
                content_type,
                body,
                entity_type,
                entity_id,
                request.priority.rank(),
                request.status.as_str(),
                request.enqueued_at.to_rfc3339(),
                request.sequence,
                request.retry_count,
                request.max_retries,
                request.last_error,
                request.next_attempt_at.to_rfc3339(),
            ],
        )
        .map_err(|e| CoreError::Storage(format!("지연 요청 저장 실패: {e}")))?;

        debug!(
            "지연 요청 저장: {} {} {}",
            request.id, request.method, request.target
        );
        Ok(())
    }

    async fn update(&self, request: &DeferredRequest) -> Result<(), CoreError> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE deferred_requests
                 SET status = ?2, retry_count = ?3, max_retries = ?4, last_error = ?5,
                     next_attempt_at = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    request.id,
                    request.status.as_str(),
                    request.retry_count,
                    request.max_retries,
                    request.last_error,
                    request.next_attempt_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| CoreError::Storage(format!("지연 요청 갱신 실패: {e}")))?;

        if changed == 0 {
            return Err(CoreError::NotFound {
                resource_type: "DeferredRequest".to_string(),
                id: request.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, CoreError> {
        let conn = self.lock_conn()?;
        let deleted = conn
            .execute("DELETE FROM deferred_requests WHERE id = ?1", params![id])
            .map_err(|e| CoreError::Storage(format!("지연 요청 삭제 실패: {e}")))?;
        Ok(deleted > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<DeferredRequest>, CoreError> {
        let row = {
            let conn = self.lock_conn()?;
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM deferred_requests WHERE id = ?1"),
                params![id],
                DeferredRow::from_row,
            )
            .optional()
            .map_err(|e| CoreError::Storage(format!("지연 요청 조회 실패: {e}")))?
        };
        row.map(DeferredRow::into_request).transpose()
    }

    async fn list_by_status(
        &self,
        status: DeferredStatus,
    ) -> Result<Vec<DeferredRequest>, CoreError> {
        let rows = {
            let conn = self.lock_conn()?;
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {SELECT_COLUMNS} FROM deferred_requests
                     WHERE status = ?1
                     ORDER BY priority DESC, sequence ASC"
                ))
                .map_err(|e| CoreError::Storage(format!("쿼리 준비 실패: {e}")))?;

            let rows = stmt
                .query_map(params![status.as_str()], DeferredRow::from_row)
                .map_err(|e| CoreError::Storage(format!("지연 요청 목록 조회 실패: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CoreError::Storage(format!("행 읽기 실패: {e}")))?;
            rows
        };

        rows.into_iter().map(DeferredRow::into_request).collect()
    }

    async fn count_by_status(&self, status: DeferredStatus) -> Result<usize, CoreError> {
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM deferred_requests WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| CoreError::Storage(format!("지연 요청 개수 조회 실패: {e}")))?;
        Ok(count as usize)
    }

    async fn max_sequence(&self) -> Result<i64, CoreError> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM deferred_requests",
            [],
            |row| row.get(0),
        )
        .map_err(|e| CoreError::Storage(format!("최대 순번 조회 실패: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tether_core::models::request::HttpMethod;
    use tempfile::TempDir;

    fn make_request(sequence: i64, priority: RequestPriority) -> DeferredRequest {
        let now = Utc::now();
        DeferredRequest {
            id: uuid::Uuid::new_v4().to_string(),
            target: "/tasks".to_string(),
            method: HttpMethod::Post,
            payload: Some(Payload::json(&serde_json::json!({"title": "X"})).unwrap()),
            entity: Some(EntityRef::new("task", "t-1")),
            priority,
            status: DeferredStatus::Pending,
            enqueued_at: now,
            sequence,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            next_attempt_at: now,
        }
    }

    #[tokio::test]
    async fn add_and_get_preserves_fields() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = make_request(1, RequestPriority::Entity);
        storage.add(&req).await.unwrap();

        let loaded = storage.get(&req.id).await.unwrap().unwrap();
        assert_eq!(loaded.target, "/tasks");
        assert_eq!(loaded.method, HttpMethod::Post);
        assert_eq!(loaded.payload, req.payload);
        assert_eq!(loaded.entity, req.entity);
        assert_eq!(loaded.status, DeferredStatus::Pending);
        assert_eq!(loaded.sequence, 1);
        assert_eq!(
            loaded.enqueued_at.timestamp_micros(),
            req.enqueued_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn list_orders_by_priority_then_sequence() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let bg = make_request(1, RequestPriority::Background);
        let e1 = make_request(2, RequestPriority::Entity);
        let auth = make_request(3, RequestPriority::Auth);
        let e2 = make_request(4, RequestPriority::Entity);
        for r in [&bg, &e1, &auth, &e2] {
            storage.add(r).await.unwrap();
        }

        let ids: Vec<String> = storage
            .list_by_status(DeferredStatus::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![auth.id, e1.id, e2.id, bg.id]);
    }

    #[tokio::test]
    async fn update_moves_between_statuses() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut req = make_request(1, RequestPriority::Entity);
        storage.add(&req).await.unwrap();

        req.status = DeferredStatus::Failed;
        req.retry_count = 3;
        req.last_error = Some("네트워크 에러".to_string());
        req.next_attempt_at = Utc::now() + Duration::seconds(30);
        storage.update(&req).await.unwrap();

        assert_eq!(
            storage.count_by_status(DeferredStatus::Pending).await.unwrap(),
            0
        );
        let failed = storage.list_by_status(DeferredStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 3);
        assert_eq!(failed[0].last_error.as_deref(), Some("네트워크 에러"));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = make_request(1, RequestPriority::Entity);
        assert!(matches!(
            storage.update(&req).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = make_request(1, RequestPriority::Entity);
        storage.add(&req).await.unwrap();

        assert!(storage.delete(&req.id).await.unwrap());
        assert!(!storage.delete(&req.id).await.unwrap());
        assert!(storage.get(&req.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_storage_error() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let req = make_request(1, RequestPriority::Entity);
        storage.add(&req).await.unwrap();
        assert!(matches!(
            storage.add(&req).await,
            Err(CoreError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue").join("tether.db");
        let req = make_request(7, RequestPriority::Auth);

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.add(&req).await.unwrap();
        }

        let reopened = SqliteStorage::open(&path).unwrap();
        let pending = reopened
            .list_by_status(DeferredStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, req.id);
        assert_eq!(pending[0].priority, RequestPriority::Auth);
        assert_eq!(reopened.max_sequence().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn max_sequence_of_empty_store_is_zero() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(storage.max_sequence().await.unwrap(), 0);

        storage.add(&make_request(42, RequestPriority::Entity)).await.unwrap();
        storage.add(&make_request(9, RequestPriority::Auth)).await.unwrap();
        assert_eq!(storage.max_sequence().await.unwrap(), 42);
    }
}
