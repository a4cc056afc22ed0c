//! 전송 계층 포트.
//!
//! 구현: `tether-network` crate (reqwest)

use async_trait::async_trait;

use crate::error::CoreError;
use crate::models::request::{HttpMethod, Payload, TransportRequest, TransportResponse};

/// HTTP 전송 인터페이스
///
/// 2xx 외 응답은 `CoreError`로 매핑해서 반환한다.
/// 연결 실패와 타임아웃은 `CoreError::Network`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// 요청 실행
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, CoreError>;

    async fn get(&self, path: &str) -> Result<TransportResponse, CoreError> {
        self.execute(TransportRequest::new(HttpMethod::Get, path))
            .await
    }

    async fn post(
        &self,
        path: &str,
        payload: Option<Payload>,
    ) -> Result<TransportResponse, CoreError> {
        self.execute(TransportRequest::new(HttpMethod::Post, path).with_payload(payload))
            .await
    }

    async fn put(
        &self,
        path: &str,
        payload: Option<Payload>,
    ) -> Result<TransportResponse, CoreError> {
        self.execute(TransportRequest::new(HttpMethod::Put, path).with_payload(payload))
            .await
    }

    async fn patch(
        &self,
        path: &str,
        payload: Option<Payload>,
    ) -> Result<TransportResponse, CoreError> {
        self.execute(TransportRequest::new(HttpMethod::Patch, path).with_payload(payload))
            .await
    }

    async fn delete(&self, path: &str) -> Result<TransportResponse, CoreError> {
        self.execute(TransportRequest::new(HttpMethod::Delete, path))
            .await
    }
}

/// 인증 토큰 공급자
///
/// 구현: `tether-network::auth::TokenManager`
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    /// 유효한 액세스 토큰 반환 (필요하면 갱신)
    async fn get_token(&self) -> Result<String, CoreError>;
}
