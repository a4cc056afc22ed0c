//! 성능 메트릭 집계기.
//!
//! 요청별 타이밍/결과 샘플을 엔드포인트별 통계로 누적하고 성능 점수를 계산한다.
//! 모든 변경은 짧은 잠금 하나 안에서 끝나며, 관찰자 통지는 잠금 해제 후 실행된다.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tether_core::config::MetricsConfig;
use tether_core::models::metric::{
    normalize_endpoint, EndpointKey, EndpointStats, PerformanceReport, RequestMetric,
};
use tether_core::models::request::HttpMethod;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::observer::{ObserverRegistry, Subscription};

/// 리포트에 포함되는 최소 호출 수
const REPORT_MIN_CALLS: u64 = 5;
/// 리포트 목록 최대 길이
const REPORT_TOP_N: usize = 5;

/// 요청 시작 마커
#[derive(Debug, Clone)]
pub struct TimingMarker {
    pub endpoint: String,
    pub method: HttpMethod,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// 요청 결과 (마커와 함께 기록)
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub status: Option<u16>,
    pub success: bool,
    pub cached: bool,
    pub payload_size: u64,
    pub retry_count: u32,
}

impl RequestOutcome {
    pub fn succeeded(status: u16, cached: bool, payload_size: u64) -> Self {
        Self {
            status: Some(status),
            success: true,
            cached,
            payload_size,
            retry_count: 0,
        }
    }

    pub fn failed(status: Option<u16>) -> Self {
        Self {
            status,
            success: false,
            ..Self::default()
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// 엔드포인트별 누적 상태
struct EndpointAccumulator {
    stats: EndpointStats,
    successes: u64,
    cache_hits: u64,
    /// p95 계산용 최근 샘플 (링 버퍼)
    samples: VecDeque<u64>,
}

impl EndpointAccumulator {
    fn new(metric: &RequestMetric) -> Self {
        Self {
            stats: EndpointStats {
                endpoint: metric.endpoint.clone(),
                method: metric.method,
                count: 0,
                total_duration_ms: 0,
                average_duration_ms: 0.0,
                min_duration_ms: u64::MAX,
                max_duration_ms: 0,
                success_rate: 0.0,
                p95_duration_ms: 0,
                cache_hit_rate: 0.0,
                last_called: metric.ended_at,
            },
            successes: 0,
            cache_hits: 0,
            samples: VecDeque::new(),
        }
    }

    fn apply(&mut self, metric: &RequestMetric, max_samples: usize) {
        let stats = &mut self.stats;
        stats.count += 1;
        stats.total_duration_ms += metric.duration_ms;
        stats.average_duration_ms = stats.total_duration_ms as f64 / stats.count as f64;
        stats.min_duration_ms = stats.min_duration_ms.min(metric.duration_ms);
        stats.max_duration_ms = stats.max_duration_ms.max(metric.duration_ms);
        stats.last_called = metric.ended_at;

        if metric.success {
            self.successes += 1;
        }
        if metric.cached {
            self.cache_hits += 1;
        }
        stats.success_rate = self.successes as f64 / stats.count as f64;
        stats.cache_hit_rate = self.cache_hits as f64 / stats.count as f64;

        self.samples.push_back(metric.duration_ms);
        while self.samples.len() > max_samples.max(1) {
            self.samples.pop_front();
        }
        stats.p95_duration_ms = percentile_95(&self.samples);
    }
}

/// 95번째 백분위: 정렬 후 floor(n * 0.95), n-1로 제한
fn percentile_95(samples: &VecDeque<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let index = ((sorted.len() as f64 * 0.95).floor() as usize).min(sorted.len() - 1);
    sorted[index]
}

#[derive(Default)]
struct MetricState {
    buffer: VecDeque<RequestMetric>,
    endpoints: HashMap<EndpointKey, EndpointAccumulator>,
}

/// 성능 메트릭 집계기
pub struct MetricAggregator {
    config: MetricsConfig,
    state: Mutex<MetricState>,
    metric_observers: ObserverRegistry<RequestMetric>,
    slow_observers: ObserverRegistry<RequestMetric>,
}

impl MetricAggregator {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MetricState::default()),
            metric_observers: ObserverRegistry::new(),
            slow_observers: ObserverRegistry::new(),
        }
    }

    /// 요청 타이밍 시작
    pub fn start_timing(&self, endpoint: &str, method: HttpMethod) -> TimingMarker {
        TimingMarker {
            endpoint: endpoint.to_string(),
            method,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// 요청 완료 기록: 마커 이후 경과 시간을 소요 시간으로 사용
    pub fn record_request(&self, marker: TimingMarker, outcome: RequestOutcome) -> RequestMetric {
        let elapsed = marker.started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let metric = RequestMetric {
            endpoint: normalize_endpoint(&marker.endpoint),
            method: marker.method,
            started_at: marker.started_at,
            ended_at: marker.started_at
                + ChronoDuration::milliseconds(duration_ms.min(i64::MAX as u64) as i64),
            duration_ms,
            status: outcome.status,
            success: outcome.success,
            cached: outcome.cached,
            payload_size: outcome.payload_size,
            retry_count: outcome.retry_count,
        };
        self.record_metric(metric.clone());
        metric
    }

    /// 완성된 메트릭 기록
    pub fn record_metric(&self, metric: RequestMetric) {
        {
            let mut state = self.state.lock();
            state.buffer.push_back(metric.clone());
            while state.buffer.len() > self.config.buffer_capacity.max(1) {
                state.buffer.pop_front();
            }

            state
                .endpoints
                .entry(metric.key())
                .or_insert_with(|| EndpointAccumulator::new(&metric))
                .apply(&metric, self.config.max_samples_per_endpoint);
        }

        debug!(
            "요청 메트릭: {} {} {}ms (성공={})",
            metric.method, metric.endpoint, metric.duration_ms, metric.success
        );

        self.metric_observers.notify(&metric);
        if metric.duration_ms > self.config.slow_threshold_ms {
            warn!(
                "느린 요청: {} {} {}ms (임계값 {}ms)",
                metric.method, metric.endpoint, metric.duration_ms, self.config.slow_threshold_ms
            );
            self.slow_observers.notify(&metric);
        }
    }

    /// 모든 메트릭 관찰자 등록
    pub fn on_metric<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RequestMetric) + Send + Sync + 'static,
    {
        self.metric_observers.subscribe(handler)
    }

    /// 느린 요청 관찰자 등록
    pub fn on_slow_request<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RequestMetric) + Send + Sync + 'static,
    {
        self.slow_observers.subscribe(handler)
    }

    /// 엔드포인트 통계 조회 (경로는 정규화 후 조회)
    pub fn endpoint_stats(&self, method: HttpMethod, endpoint: &str) -> Option<EndpointStats> {
        let key = EndpointKey::new(method, endpoint);
        self.state
            .lock()
            .endpoints
            .get(&key)
            .map(|acc| acc.stats.clone())
    }

    /// 전체 엔드포인트 통계 (키 순)
    pub fn all_stats(&self) -> Vec<EndpointStats> {
        let state = self.state.lock();
        let mut entries: Vec<(&EndpointKey, &EndpointAccumulator)> =
            state.endpoints.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, acc)| acc.stats.clone()).collect()
    }

    /// 최근 메트릭 (오래된 것부터, 최대 `limit`개)
    pub fn recent_metrics(&self, limit: usize) -> Vec<RequestMetric> {
        let state = self.state.lock();
        let skip = state.buffer.len().saturating_sub(limit);
        state.buffer.iter().skip(skip).cloned().collect()
    }

    /// 보존 기간이 지난 메트릭 제거, 제거된 개수 반환
    pub fn prune_expired(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(self.config.retention_hours));
        let mut state = self.state.lock();
        let before = state.buffer.len();
        state.buffer.retain(|m| m.ended_at >= cutoff);
        let removed = before - state.buffer.len();
        if removed > 0 {
            debug!("만료 메트릭 {removed}개 제거");
        }
        removed
    }

    /// 모든 메트릭과 통계 초기화
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.buffer.clear();
        state.endpoints.clear();
    }

    /// 종합 성능 점수 (0 ~ 100, 샘플이 없으면 100)
    pub fn performance_score(&self) -> u8 {
        let stats = self.all_stats();
        self.score_of(&stats)
    }

    fn score_of(&self, stats: &[EndpointStats]) -> u8 {
        let mut weighted = 0.0;
        let mut weights = 0.0;
        for s in stats.iter().filter(|s| s.count > 0) {
            let weight = ((s.count + 1) as f64).ln();
            weighted += self.endpoint_score(s) * weight;
            weights += weight;
        }
        if weights == 0.0 {
            return 100;
        }
        (weighted / weights).round().clamp(0.0, 100.0) as u8
    }

    /// 엔드포인트 점수 = 속도(40) + 신뢰도(40) + 일관성(20)
    fn endpoint_score(&self, stats: &EndpointStats) -> f64 {
        let avg = stats.average_duration_ms;
        let slow = self.config.slow_threshold_ms as f64;
        let speed = if avg < slow / 2.0 {
            40.0
        } else if avg < slow {
            30.0
        } else if avg < self.config.very_slow_threshold_ms as f64 {
            20.0
        } else if avg < self.config.timeout_threshold_ms as f64 {
            10.0
        } else {
            0.0
        };

        let reliability = (stats.success_rate * 40.0).round();

        let ratio = if avg > 0.0 {
            stats.p95_duration_ms as f64 / avg
        } else {
            1.0
        };
        let consistency = if ratio < 1.5 {
            20.0
        } else if ratio < 2.0 {
            15.0
        } else if ratio < 3.0 {
            10.0
        } else if ratio < 5.0 {
            5.0
        } else {
            0.0
        };

        speed + reliability + consistency
    }

    /// 성능 리포트
    pub fn performance_report(&self) -> PerformanceReport {
        let stats = self.all_stats();
        let score = self.score_of(&stats);

        let total_requests: u64 = stats.iter().map(|s| s.count).sum();
        let (success_rate, cache_hit_rate) = if total_requests == 0 {
            (1.0, 0.0)
        } else {
            let successes: f64 = stats.iter().map(|s| s.success_rate * s.count as f64).sum();
            let hits: f64 = stats.iter().map(|s| s.cache_hit_rate * s.count as f64).sum();
            (
                successes / total_requests as f64,
                hits / total_requests as f64,
            )
        };

        let eligible: Vec<&EndpointStats> = stats
            .iter()
            .filter(|s| s.count >= REPORT_MIN_CALLS)
            .collect();

        let mut slowest = eligible.clone();
        slowest.sort_by(|a, b| b.average_duration_ms.total_cmp(&a.average_duration_ms));
        let mut least_reliable = eligible;
        least_reliable.sort_by(|a, b| a.success_rate.total_cmp(&b.success_rate));

        PerformanceReport {
            score,
            total_requests,
            success_rate,
            cache_hit_rate,
            slowest: slowest.into_iter().take(REPORT_TOP_N).cloned().collect(),
            least_reliable: least_reliable
                .into_iter()
                .take(REPORT_TOP_N)
                .cloned()
                .collect(),
            generated_at: Utc::now(),
        }
    }
}
