//! TETHER 핵심 에러 타입.
//!
//! 모든 어댑터 crate는 외부 에러를 `CoreError`로 매핑해서 반환한다.
//! 디스패처 경계 밖으로는 `Config` 에러만 전파되고, 나머지는 `ApiResult`로 정규화된다.

use thiserror::Error;

/// 코어 레이어 에러.
#[derive(Debug, Error)]
pub enum CoreError {
    /// JSON 직렬화/역직렬화 실패
    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 설정값 오류 (디스패처 밖으로 전파되는 유일한 에러)
    #[error("설정 에러: {0}")]
    Config(String),

    /// 서버가 요청을 거부함 (재시도하지 않음)
    #[error("유효성 검증 실패: {field}: {message}")]
    Validation {
        /// 검증 실패한 필드명 (서버가 알려주지 않으면 "body")
        field: String,
        /// 실패 사유
        message: String,
    },

    /// 인증 실패 (토큰 만료, 권한 없음 등)
    #[error("인증 에러: {0}")]
    Auth(String),

    /// 리소스를 찾을 수 없음
    #[error("{resource_type} 미발견: {id}")]
    NotFound {
        /// 리소스 종류 (예: "API", "DeferredRequest")
        resource_type: String,
        /// 리소스 식별자
        id: String,
    },

    /// 내부 에러 (예상치 못한 상황)
    #[error("내부 에러: {0}")]
    Internal(String),

    /// 네트워크 에러 (연결 실패, 타임아웃)
    #[error("네트워크 에러: {0}")]
    Network(String),

    /// 서버 Rate Limit 초과 (429)
    #[error("요청 한도 초과, {retry_after_secs}초 후 재시도")]
    RateLimit {
        /// 재시도 대기 시간 (초)
        retry_after_secs: u64,
    },

    /// 로컬 레이트 거버너가 요청을 거부함
    #[error("로컬 요청 한도 초과 ({endpoint}), {retry_after_ms}ms 후 재시도")]
    Throttled {
        /// 한도에 걸린 엔드포인트
        endpoint: String,
        /// 윈도우에 빈 자리가 생길 때까지 남은 시간 (밀리초)
        retry_after_ms: u64,
    },

    /// 서비스 일시 불가 (503)
    #[error("서비스 일시 불가: {0}")]
    ServiceUnavailable(String),

    /// 내구성 저장소 쓰기/읽기 실패
    #[error("저장소 에러: {0}")]
    Storage(String),

    /// 실시간 채널 재연결 시도 소진
    #[error("실시간 채널 재연결 {attempts}회 실패: 새로고침 필요")]
    ChannelExhausted {
        /// 시도한 재연결 횟수
        attempts: u32,
    },

    /// I/O 에러
    #[error("I/O 에러: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// 재시도로 회복될 수 있는 에러인지 판별
    ///
    /// 검증/인증/미발견 에러는 같은 요청을 다시 보내도 결과가 같다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Network(_)
                | CoreError::ServiceUnavailable(_)
                | CoreError::RateLimit { .. }
                | CoreError::Throttled { .. }
                | CoreError::Internal(_)
        )
    }

    /// 서버에 도달하지 못해서 생긴 에러인지 (연결 상태 판단용)
    pub fn is_unreachable(&self) -> bool {
        matches!(self, CoreError::Network(_))
    }

    /// 에러에 대응하는 HTTP 상태 코드 (메트릭 기록용)
    pub fn status_hint(&self) -> Option<u16> {
        match self {
            CoreError::Validation { .. } => Some(422),
            CoreError::Auth(_) => Some(401),
            CoreError::NotFound { .. } => Some(404),
            CoreError::RateLimit { .. } => Some(429),
            CoreError::ServiceUnavailable(_) => Some(503),
            CoreError::Internal(_) => Some(500),
            _ => None,
        }
    }
}
