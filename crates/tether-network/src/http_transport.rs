//! HTTP REST 전송 어댑터.
//!
//! `Transport` 포트 구현. 기본 URL 결합, Bearer 토큰 주입, 상태 코드별 에러 매핑.
//! 재시도는 하지 않는다 (오프라인 큐와 디스패처가 담당).

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tether_core::error::CoreError;
use tether_core::models::request::{HttpMethod, TransportRequest, TransportResponse};
use tether_core::ports::transport::{TokenSupplier, Transport};
use tracing::{debug, warn};

/// Retry-After 헤더가 없을 때 기본 대기 시간 (초)
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// 검증 실패 응답 본문 (서버마다 필드명이 다름)
#[derive(Debug, Default, Deserialize)]
struct RejectionBody {
    field: Option<String>,
    message: Option<String>,
    detail: Option<String>,
}

/// REST 전송 어댑터: `Transport` 포트 구현
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token_supplier: Option<Arc<dyn TokenSupplier>>,
}

impl HttpTransport {
    /// 새 HTTP 전송 어댑터 생성
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Network(format!("HTTP 클라이언트 빌드 실패: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_supplier: None,
        })
    }

    /// 인증 토큰 공급자 설정 (없으면 Authorization 헤더 생략)
    pub fn with_token_supplier(mut self, supplier: Arc<dyn TokenSupplier>) -> Self {
        self.token_supplier = Some(supplier);
        self
    }

    /// 기본 URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    /// 요청 빌더 생성 (토큰, 헤더, 페이로드)
    async fn build_request(
        &self,
        request: TransportRequest,
    ) -> Result<reqwest::RequestBuilder, CoreError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(Self::to_reqwest_method(request.method), &url);

        if let Some(supplier) = &self.token_supplier {
            let token = supplier.get_token().await?;
            builder = builder.bearer_auth(token);
        }

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(payload) = request.payload {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, payload.content_type)
                .body(payload.body);
        }

        Ok(builder)
    }

    /// 응답 상태 코드 확인 및 에러 매핑
    async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, CoreError> {
        let status = resp.status();

        if status.is_success() || status.as_u16() == 304 {
            return Ok(resp);
        }

        let status_code = status.as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        let text = resp.text().await.unwrap_or_else(|e| {
            warn!("응답 본문 읽기 실패: {e}");
            String::new()
        });

        match status_code {
            400 | 409 | 422 => {
                let body: RejectionBody = serde_json::from_str(&text).unwrap_or_default();
                Err(CoreError::Validation {
                    field: body.field.unwrap_or_else(|| "body".to_string()),
                    message: body
                        .message
                        .or(body.detail)
                        .unwrap_or_else(|| format!("요청 거부 ({status}): {text}")),
                })
            }
            401 | 403 => Err(CoreError::Auth(format!("인증 실패 ({status}): {text}"))),
            404 => Err(CoreError::NotFound {
                resource_type: "API".to_string(),
                id: text,
            }),
            429 => Err(CoreError::RateLimit {
                retry_after_secs: retry_after,
            }),
            503 => Err(CoreError::ServiceUnavailable(text)),
            _ => Err(CoreError::Internal(format!("API 에러 ({status}): {text}"))),
        }
    }

    /// reqwest 전송 에러 매핑
    fn map_send_error(err: reqwest::Error) -> CoreError {
        if err.is_builder() {
            CoreError::Internal(format!("요청 생성 실패: {err}"))
        } else if err.is_timeout() {
            CoreError::Network(format!("요청 타임아웃: {err}"))
        } else {
            CoreError::Network(format!("요청 전송 실패: {err}"))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, CoreError> {
        let method = request.method;
        let path = request.path.clone();
        debug!("HTTP {method} {path}");

        let builder = self.build_request(request).await?;
        let resp = builder.send().await.map_err(Self::map_send_error)?;
        let resp = Self::check_response(resp).await?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| CoreError::Network(format!("응답 본문 수신 실패: {e}")))?
            .to_vec();

        debug!("HTTP {method} {path} → {status} ({} bytes)", body.len());
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
