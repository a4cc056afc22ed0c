//! 디스패처 응답 봉투 (`ApiResult`).
//!
//! 성공, 실패, 오프라인 큐 저장 모두 같은 형태로 호출자에게 전달된다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// 정규화된 에러 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Network,
    Validation,
    Auth,
    NotFound,
    RateLimited,
    ServiceUnavailable,
    Storage,
    ChannelExhausted,
    Internal,
}

/// 에러 상세
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// 재시도까지 대기 시간 (레이트 리밋)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&CoreError> for ApiErrorDetail {
    fn from(err: &CoreError) -> Self {
        let (code, field, retry_after_ms) = match err {
            CoreError::Network(_) => (ErrorCode::Network, None, None),
            CoreError::Validation { field, .. } => {
                (ErrorCode::Validation, Some(field.clone()), None)
            }
            CoreError::Auth(_) => (ErrorCode::Auth, None, None),
            CoreError::NotFound { .. } => (ErrorCode::NotFound, None, None),
            CoreError::RateLimit { retry_after_secs } => (
                ErrorCode::RateLimited,
                None,
                Some(retry_after_secs.saturating_mul(1000)),
            ),
            CoreError::Throttled { retry_after_ms, .. } => {
                (ErrorCode::RateLimited, None, Some(*retry_after_ms))
            }
            CoreError::ServiceUnavailable(_) => (ErrorCode::ServiceUnavailable, None, None),
            CoreError::Storage(_) => (ErrorCode::Storage, None, None),
            CoreError::ChannelExhausted { .. } => (ErrorCode::ChannelExhausted, None, None),
            CoreError::Serialization(_)
            | CoreError::Config(_)
            | CoreError::Internal(_)
            | CoreError::Io(_) => (ErrorCode::Internal, None, None),
        };
        let message = match err {
            CoreError::Validation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            code,
            message,
            field,
            retry_after_ms,
        }
    }
}

/// 통일된 응답 봉투
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiErrorDetail>,
    pub timestamp: DateTime<Utc>,
    /// 오프라인 큐에 저장되었음 (네트워크 I/O 없음)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub offline: bool,
    /// 오프라인 큐 항목 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_id: Option<String>,
}

impl ApiResult {
    /// 성공 응답
    pub fn ok(data: Option<serde_json::Value>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            errors: Vec::new(),
            timestamp: Utc::now(),
            offline: false,
            queued_id: None,
        }
    }

    /// 오프라인 큐 저장 응답 (성공으로 간주)
    pub fn queued(queued_id: String) -> Self {
        Self {
            success: true,
            message: "오프라인 상태: 연결 복구 후 전송됩니다".to_string(),
            data: None,
            errors: Vec::new(),
            timestamp: Utc::now(),
            offline: true,
            queued_id: Some(queued_id),
        }
    }

    /// 실패 응답
    pub fn failure(err: &CoreError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
            errors: vec![ApiErrorDetail::from(err)],
            timestamp: Utc::now(),
            offline: false,
            queued_id: None,
        }
    }

    /// 첫 번째 에러 코드
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.errors.first().map(|e| e.code)
    }

    /// 데이터를 원하는 타입으로 역직렬화
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, CoreError> {
        self.data
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(CoreError::from)
    }
}
