//! 오프라인 지연 쓰기 요청 모델.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::request::{EntityRef, HttpMethod, Payload, RequestPriority};
use crate::error::CoreError;

/// 지연 요청 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeferredStatus {
    Pending,
    Completed,
    /// 재시도 소진 또는 재시도 불가 에러: 사용자 확인 필요
    Failed,
}

impl DeferredStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeferredStatus::Pending => "PENDING",
            DeferredStatus::Completed => "COMPLETED",
            DeferredStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DeferredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeferredStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeferredStatus::Pending),
            "COMPLETED" => Ok(DeferredStatus::Completed),
            "FAILED" => Ok(DeferredStatus::Failed),
            other => Err(CoreError::Storage(format!("알 수 없는 요청 상태: {other}"))),
        }
    }
}

/// 큐 저장 전 요청 (id, 순번, 상태는 큐가 부여)
#[derive(Debug, Clone)]
pub struct NewDeferredRequest {
    pub method: HttpMethod,
    pub target: String,
    pub payload: Option<Payload>,
    pub entity: Option<EntityRef>,
    pub priority: RequestPriority,
}

impl NewDeferredRequest {
    pub fn new(method: HttpMethod, target: &str) -> Self {
        Self {
            method,
            target: target.to_string(),
            payload: None,
            entity: None,
            priority: RequestPriority::default(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_entity(mut self, entity_type: &str, entity_id: &str) -> Self {
        self.entity = Some(EntityRef::new(entity_type, entity_id));
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// 영속화된 지연 요청
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredRequest {
    /// UUID v4
    pub id: String,
    /// 대상 경로
    pub target: String,
    pub method: HttpMethod,
    pub payload: Option<Payload>,
    pub entity: Option<EntityRef>,
    pub priority: RequestPriority,
    pub status: DeferredStatus,
    pub enqueued_at: DateTime<Utc>,
    /// 제출 순번 (단조 증가)
    pub sequence: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// 이 시각 이전에는 재시도하지 않음
    pub next_attempt_at: DateTime<Utc>,
}

impl DeferredRequest {
    /// 지금 시도할 수 있는지
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeferredStatus::Pending && self.next_attempt_at <= now
    }

    /// 순서 보장 단위 (엔티티, 없으면 대상 경로)
    pub fn chain_key(&self) -> EntityRef {
        chain_key(self.entity.as_ref(), &self.target)
    }
}

/// 같은 키의 요청은 제출 순서대로만 전송된다.
pub fn chain_key(entity: Option<&EntityRef>, target: &str) -> EntityRef {
    entity
        .cloned()
        .unwrap_or_else(|| EntityRef::for_path(target))
}

/// 큐 현황
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub failed: usize,
}

/// 단일 처리 패스 결과
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    /// 전송 시도 수
    pub attempted: usize,
    pub completed: usize,
    /// PENDING으로 남아 다음 패스에서 재시도
    pub retried: usize,
    /// 이번 패스에서 FAILED로 전환
    pub failed: usize,
    /// 백오프 대기 또는 선행 요청 실패로 건너뜀
    pub skipped: usize,
}

/// 지연 요청 처리 결과 (관찰자 통지용)
#[derive(Debug, Clone)]
pub enum DeferredOutcome {
    Completed { id: String },
    Retrying { id: String, retry_count: u32, error: String },
    Failed { id: String, error: String },
}
