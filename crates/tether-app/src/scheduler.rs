//! 2-루프 스케줄러.
//!
//! 헬스 체크(오프라인 동안 10초), 상태 보고(1분) 오케스트레이션.
//! 오프라인 큐 루프와 실시간 채널은 `AppContext::start()`가 띄운다.

use std::sync::Arc;
use std::time::Duration;
use tether_client::metrics::MetricAggregator;
use tether_client::offline_queue::DeferredQueue;
use tether_client::rate_limit::RateGovernor;
use tether_core::ports::connectivity::ConnectivitySignal;
use tether_core::ports::transport::Transport;
use tether_network::connectivity::ConnectivityManager;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 스로틀 경고 기준 (윈도우 사용률)
const THROTTLE_WARN_RATIO: f64 = 0.9;

/// 스케줄러 설정
pub struct SchedulerConfig {
    /// 오프라인 동안 헬스 체크 간격
    pub probe_interval: Duration,
    /// 상태 보고 및 메트릭 정리 간격
    pub report_interval: Duration,
    /// 헬스 체크 경로
    pub health_path: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            report_interval: Duration::from_secs(60),
            health_path: "/health".to_string(),
        }
    }
}

/// 주기 보고 한 번의 결과
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub online: bool,
    pub performance_score: u8,
    pub pruned_metrics: usize,
    pub pending_requests: usize,
    pub failed_requests: usize,
    /// 사용률이 경고 기준 이상인 엔드포인트
    pub saturated_endpoints: Vec<String>,
}

/// 백그라운드 루프 스케줄러
pub struct Scheduler {
    config: SchedulerConfig,
    connectivity: Arc<ConnectivityManager>,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricAggregator>,
    governor: Arc<RateGovernor>,
    queue: Arc<DeferredQueue>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        connectivity: Arc<ConnectivityManager>,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricAggregator>,
        governor: Arc<RateGovernor>,
        queue: Arc<DeferredQueue>,
    ) -> Self {
        Self {
            config,
            connectivity,
            transport,
            metrics,
            governor,
            queue,
        }
    }

    /// 모든 루프 실행 (종료 신호까지 대기)
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) {
        info!(
            "스케줄러 시작: 헬스 체크={}ms, 상태 보고={}ms",
            self.config.probe_interval.as_millis(),
            self.config.report_interval.as_millis(),
        );

        // ============================================================
        // 1. 헬스 체크 루프
        // ============================================================
        let probe_task = tokio::spawn(self.connectivity.clone().run_probe(
            self.transport.clone(),
            self.config.health_path.clone(),
            self.config.probe_interval,
            shutdown_rx.clone(),
        ));

        // ============================================================
        // 2. 상태 보고 루프
        // ============================================================
        let report_interval = self.config.report_interval;
        let mut shutdown2 = shutdown_rx.clone();
        let reporter = self.reporter();
        let report_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(report_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 첫 틱은 즉시 발생하므로 건너뜀
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        reporter.report().await;
                    }
                    _ = shutdown2.changed() => {
                        info!("상태 보고 루프 종료");
                        break;
                    }
                }
            }
        });

        if let Err(e) = probe_task.await {
            warn!("헬스 체크 태스크 비정상 종료: {e}");
        }
        if let Err(e) = report_task.await {
            warn!("상태 보고 태스크 비정상 종료: {e}");
        }
        info!("스케줄러 종료");
    }

    /// 상태 보고 1회 실행
    pub async fn report_now(&self) -> StatusSnapshot {
        self.reporter().report().await
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            connectivity: self.connectivity.clone(),
            metrics: self.metrics.clone(),
            governor: self.governor.clone(),
            queue: self.queue.clone(),
        }
    }
}

struct Reporter {
    connectivity: Arc<ConnectivityManager>,
    metrics: Arc<MetricAggregator>,
    governor: Arc<RateGovernor>,
    queue: Arc<DeferredQueue>,
}

impl Reporter {
    async fn report(&self) -> StatusSnapshot {
        let pruned_metrics = self.metrics.prune_expired();
        if pruned_metrics > 0 {
            debug!("만료 메트릭 정리: {pruned_metrics}개");
        }

        let (pending_requests, failed_requests) = match self.queue.stats().await {
            Ok(stats) => (stats.pending, stats.failed),
            Err(e) => {
                warn!("오프라인 큐 통계 조회 실패: {e}");
                (0, 0)
            }
        };
        if failed_requests > 0 {
            warn!("검토 대기 중인 실패 요청: {failed_requests}개");
        }

        let saturated_endpoints: Vec<String> = self
            .governor
            .utilization()
            .into_iter()
            .filter(|u| u.ratio >= THROTTLE_WARN_RATIO)
            .map(|u| u.endpoint)
            .collect();
        for endpoint in &saturated_endpoints {
            warn!("레이트 리밋 임박: {endpoint}");
        }

        let snapshot = StatusSnapshot {
            online: self.connectivity.is_online(),
            performance_score: self.metrics.performance_score(),
            pruned_metrics,
            pending_requests,
            failed_requests,
            saturated_endpoints,
        };

        info!(
            "상태: 온라인={}, 성능 점수={}, 대기={}, 실패={}",
            snapshot.online,
            snapshot.performance_score,
            snapshot.pending_requests,
            snapshot.failed_requests
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tether_core::config::{MetricsConfig, RateLimitConfig, RetryConfig};
    use tether_core::error::CoreError;
    use tether_core::models::deferred::NewDeferredRequest;
    use tether_core::models::request::{
        HttpMethod, RequestPriority, TransportRequest, TransportResponse,
    };
    use tether_storage::sqlite::SqliteStorage;

    struct HealthyTransport;

    #[async_trait]
    impl Transport for HealthyTransport {
        async fn execute(&self, _request: TransportRequest) -> Result<TransportResponse, CoreError> {
            Ok(TransportResponse::new(200, b"{}".to_vec()))
        }
    }

    fn scheduler(config: SchedulerConfig, rate_limit: RateLimitConfig) -> Scheduler {
        let transport: Arc<dyn Transport> = Arc::new(HealthyTransport);
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        Scheduler::new(
            config,
            Arc::new(ConnectivityManager::new(1)),
            transport.clone(),
            Arc::new(MetricAggregator::new(MetricsConfig::default())),
            Arc::new(RateGovernor::new(rate_limit)),
            Arc::new(DeferredQueue::new(store, transport, RetryConfig::default())),
        )
    }

    #[tokio::test]
    async fn report_collects_queue_and_governor_state() {
        let rate_limit = RateLimitConfig {
            default_limit: 1,
            ..RateLimitConfig::default()
        };
        let sched = scheduler(SchedulerConfig::default(), rate_limit);

        sched
            .governor
            .limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();
        sched
            .queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/tasks"))
            .await
            .unwrap();

        let snapshot = sched.report_now().await;
        assert!(snapshot.online);
        assert_eq!(snapshot.performance_score, 100);
        assert_eq!(snapshot.pending_requests, 1);
        assert_eq!(snapshot.failed_requests, 0);
        assert_eq!(snapshot.saturated_endpoints, vec!["GET /tasks".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_restores_connectivity_and_stops_on_shutdown() {
        let sched = Arc::new(scheduler(
            SchedulerConfig {
                probe_interval: Duration::from_millis(100),
                report_interval: Duration::from_secs(1),
                health_path: "/health".to_string(),
            },
            RateLimitConfig::default(),
        ));
        sched.connectivity.record_failure();
        assert!(!sched.connectivity.is_online());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = sched.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sched.connectivity.is_online());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
