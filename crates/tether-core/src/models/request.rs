//! 요청/응답 모델.
//!
//! 디스패처와 전송 계층이 주고받는 정규화된 요청·응답, 우선순위, 페이로드를 정의.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// HTTP 메서드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// 서버 상태를 변경하는 메서드인지 (오프라인 큐 대상)
    pub fn is_mutating(self) -> bool {
        !matches!(self, HttpMethod::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(CoreError::Config(format!("지원하지 않는 HTTP 메서드: {other}"))),
        }
    }
}

/// 요청 우선순위: Auth > Entity > Background
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    /// 백그라운드 동기화, 분석 등
    Background,
    /// 도메인 엔티티 조회/변경
    #[default]
    Entity,
    /// 인증/세션
    Auth,
}

impl RequestPriority {
    /// 저장소 컬럼 값 (클수록 우선)
    pub fn rank(self) -> i64 {
        match self {
            RequestPriority::Background => 0,
            RequestPriority::Entity => 1,
            RequestPriority::Auth => 2,
        }
    }

    /// 저장소 컬럼 값에서 복원 (알 수 없는 값은 Entity)
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => RequestPriority::Background,
            2 => RequestPriority::Auth,
            _ => RequestPriority::Entity,
        }
    }
}

/// 불투명 페이로드: 전송 계층만 해석한다
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// 콘텐츠 타입 (예: "application/json")
    pub content_type: String,
    /// 직렬화된 본문
    pub body: Vec<u8>,
}

impl Payload {
    /// JSON 페이로드 생성
    pub fn json<T: Serialize>(value: &T) -> Result<Self, CoreError> {
        Ok(Self {
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(value)?,
        })
    }

    /// 원시 바이트 페이로드 생성
    pub fn raw(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            body,
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// 요청 대상 엔티티 (같은 엔티티의 오프라인 요청은 제출 순서대로 적용)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// 엔티티 지정이 없는 요청의 기본 체인 키: 쿼리/프래그먼트를 뗀 대상 경로
    pub fn for_path(target: &str) -> Self {
        let path = target.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        Self::new("path", if path.is_empty() { "/" } else { path })
    }
}

/// 디스패처 요청 옵션
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// 우선순위 (레이트 리밋 대기 순서, 오프라인 큐 처리 순서)
    pub priority: RequestPriority,
    /// 대상 엔티티
    pub entity: Option<EntityRef>,
    /// 추가 헤더
    pub headers: Vec<(String, String)>,
    /// 성공 시 알림 표시
    pub notify_success: bool,
}

impl RequestOptions {
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_entity(mut self, entity_type: &str, entity_id: &str) -> Self {
        self.entity = Some(EntityRef::new(entity_type, entity_id));
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn notify_on_success(mut self) -> Self {
        self.notify_success = true;
        self
    }
}

/// 전송 계층 요청
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    /// 기본 URL 기준 상대 경로 (예: "/tasks/1")
    pub path: String,
    pub payload: Option<Payload>,
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            payload: None,
            headers: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Option<Payload>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

/// 전송 계층 응답 (읽기 전용 래퍼)
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// 헤더 값 조회 (대소문자 무시)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 응답 본문 크기 (바이트)
    pub fn body_len(&self) -> u64 {
        self.body.len() as u64
    }

    /// 캐시에서 응답했는지 (304 또는 `x-cache: HIT`)
    pub fn is_cached(&self) -> bool {
        self.status == 304
            || self
                .header("x-cache")
                .is_some_and(|v| v.to_ascii_uppercase().starts_with("HIT"))
    }

    /// 본문을 JSON으로 해석 (JSON이 아니면 문자열, 비어 있으면 None)
    pub fn json_body(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok().or_else(|| {
            Some(serde_json::Value::String(
                String::from_utf8_lossy(&self.body).into_owned(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_get_is_read() {
        assert!(!HttpMethod::Get.is_mutating());
        assert!(HttpMethod::Post.is_mutating());
        assert!(HttpMethod::Patch.is_mutating());
        assert!(HttpMethod::Delete.is_mutating());
    }

    #[test]
    fn method_parse() {
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn priority_ordering() {
        assert!(RequestPriority::Auth > RequestPriority::Entity);
        assert!(RequestPriority::Entity > RequestPriority::Background);
        for p in [
            RequestPriority::Background,
            RequestPriority::Entity,
            RequestPriority::Auth,
        ] {
            assert_eq!(RequestPriority::from_rank(p.rank()), p);
        }
    }

    #[test]
    fn path_chain_key_ignores_query_and_trailing_slash() {
        assert_eq!(EntityRef::for_path("/tasks/3"), EntityRef::new("path", "/tasks/3"));
        assert_eq!(EntityRef::for_path("/tasks/3/?x=1"), EntityRef::for_path("/tasks/3"));
        assert_ne!(EntityRef::for_path("/tasks/3"), EntityRef::for_path("/tasks/4"));
        assert_eq!(EntityRef::for_path("/"), EntityRef::new("path", "/"));
    }

    #[test]
    fn cached_detection() {
        let mut resp = TransportResponse::new(200, b"{}".to_vec());
        assert!(!resp.is_cached());
        resp.headers.push(("X-Cache".to_string(), "hit from edge".to_string()));
        assert!(resp.is_cached());
        assert!(TransportResponse::new(304, vec![]).is_cached());
    }

    #[test]
    fn json_body_falls_back_to_text() {
        let resp = TransportResponse::new(200, br#"{"id":1}"#.to_vec());
        assert_eq!(resp.json_body().unwrap()["id"], 1);

        let text = TransportResponse::new(200, b"ok".to_vec());
        assert_eq!(text.json_body().unwrap(), serde_json::json!("ok"));

        assert!(TransportResponse::new(204, vec![]).json_body().is_none());
    }
}
