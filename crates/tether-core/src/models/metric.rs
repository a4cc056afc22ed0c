//! 성능 메트릭 모델.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::request::HttpMethod;

/// 엔드포인트 집계 키: (메서드, 정규화된 경로)
///
/// 쿼리 스트링과 끝 슬래시를 제거하고, 숫자/UUID 경로 세그먼트를 `:id`로 치환한다.
/// `/tasks/1`과 `/tasks/2`는 같은 키(`/tasks/:id`)로 집계된다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    pub method: HttpMethod,
    pub path: String,
}

impl EndpointKey {
    pub fn new(method: HttpMethod, raw_path: &str) -> Self {
        Self {
            method,
            path: normalize_endpoint(raw_path),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// 경로 정규화
pub fn normalize_endpoint(raw: &str) -> String {
    let path = raw.split(['?', '#']).next().unwrap_or_default();
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| if is_identifier(s) { ":id" } else { s })
        .collect();
    format!("/{}", segments.join("/"))
}

fn is_identifier(segment: &str) -> bool {
    segment.bytes().all(|b| b.is_ascii_digit()) || uuid::Uuid::parse_str(segment).is_ok()
}

/// 단일 요청 메트릭
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    /// 정규화된 엔드포인트 경로
    pub endpoint: String,
    pub method: HttpMethod,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// HTTP 상태 코드 (네트워크 실패 시 None)
    pub status: Option<u16>,
    pub success: bool,
    /// 캐시 응답 여부
    pub cached: bool,
    /// 응답 본문 크기 (바이트)
    pub payload_size: u64,
    pub retry_count: u32,
}

impl RequestMetric {
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            method: self.method,
            path: self.endpoint.clone(),
        }
    }
}

/// 엔드포인트별 누적 통계
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub method: HttpMethod,
    /// 호출 횟수
    pub count: u64,
    pub total_duration_ms: u64,
    /// total / count
    pub average_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    /// 성공 비율 (0.0 ~ 1.0)
    pub success_rate: f64,
    /// 95번째 백분위 응답 시간 (보존된 샘플 기준)
    pub p95_duration_ms: u64,
    /// 캐시 적중 비율 (0.0 ~ 1.0)
    pub cache_hit_rate: f64,
    pub last_called: DateTime<Utc>,
}

/// 성능 리포트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// 종합 점수 (0 ~ 100)
    pub score: u8,
    pub total_requests: u64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    /// 평균 응답 시간이 가장 긴 엔드포인트 (최대 5개)
    pub slowest: Vec<EndpointStats>,
    /// 성공률이 가장 낮은 엔드포인트 (최대 5개)
    pub least_reliable: Vec<EndpointStats>,
    pub generated_at: DateTime<Utc>,
}
