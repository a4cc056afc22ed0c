//! 내구성 지연 쓰기 큐.
//!
//! 오프라인 동안의 변경 요청을 `DeferredStore`에 저장하고,
//! 연결이 복구되면 우선순위/제출 순서대로 재전송한다.
//!
//! 같은 체인 키(엔티티, 엔티티가 없으면 대상 경로)의 요청은 반드시 제출 순서대로
//! 시도되며, 체인 중 하나가 실패하거나 아직 백오프 중이면 그 패스에서 나머지는 건너뛴다.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tether_core::config::RetryConfig;
use tether_core::error::CoreError;
use tether_core::models::deferred::{
    DeferredOutcome, DeferredRequest, DeferredStatus, NewDeferredRequest, ProcessReport,
    QueueStats,
};
use tether_core::models::request::{EntityRef, TransportRequest};
use tether_core::ports::connectivity::ConnectivitySignal;
use tether_core::ports::deferred_store::DeferredStore;
use tether_core::ports::notifier::Notifier;
use tether_core::ports::transport::Transport;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::{MetricAggregator, RequestOutcome};
use crate::observer::{ObserverRegistry, Subscription};

/// 주기 처리 최소 간격
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// 재시도 백오프 지연: `min(base * 2^retry_count, max)`
pub fn backoff_delay(retry_count: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    Duration::from_millis(base_delay_ms.saturating_mul(factor).min(max_delay_ms))
}

/// 지연 쓰기 큐
pub struct DeferredQueue {
    store: Arc<dyn DeferredStore>,
    transport: Arc<dyn Transport>,
    config: RetryConfig,
    metrics: Option<Arc<MetricAggregator>>,
    notifier: Option<Arc<dyn Notifier>>,
    /// 처리 패스 중복 방지
    processing: tokio::sync::Mutex<()>,
    /// 마지막으로 부여한 제출 순번
    last_sequence: parking_lot::Mutex<i64>,
    outcome_observers: ObserverRegistry<DeferredOutcome>,
}

impl DeferredQueue {
    pub fn new(
        store: Arc<dyn DeferredStore>,
        transport: Arc<dyn Transport>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            metrics: None,
            notifier: None,
            processing: tokio::sync::Mutex::new(()),
            last_sequence: parking_lot::Mutex::new(0),
            outcome_observers: ObserverRegistry::new(),
        }
    }

    /// 재전송 시도를 메트릭으로 기록
    pub fn with_metrics(mut self, metrics: Arc<MetricAggregator>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 재시도 소진 시 알림
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 단조 증가 순번
    ///
    /// 마이크로초 시각 기반이지만 저장소에 남은 최대 순번보다 항상 크다.
    fn next_sequence(&self, now: DateTime<Utc>, stored_max: i64) -> i64 {
        let mut last = self.last_sequence.lock();
        let next = now.timestamp_micros().max(*last + 1).max(stored_max + 1);
        *last = next;
        next
    }

    /// 요청 저장: 내구성 쓰기가 끝난 뒤에만 id 반환
    pub async fn enqueue(&self, request: NewDeferredRequest) -> Result<String, CoreError> {
        let stored_max = self.store.max_sequence().await?;
        let now = Utc::now();
        let entry = DeferredRequest {
            id: Uuid::new_v4().to_string(),
            target: request.target,
            method: request.method,
            payload: request.payload,
            entity: request.entity,
            priority: request.priority,
            status: DeferredStatus::Pending,
            enqueued_at: now,
            sequence: self.next_sequence(now, stored_max),
            retry_count: 0,
            max_retries: self.config.max_retries,
            last_error: None,
            next_attempt_at: now,
        };

        self.store.add(&entry).await?;
        info!(
            "오프라인 큐 저장: {} {} (id={})",
            entry.method, entry.target, entry.id
        );
        Ok(entry.id)
    }

    /// 대기 중인 요청 처리 (한 패스)
    ///
    /// 다른 패스가 진행 중이면 빈 리포트를 반환한다.
    pub async fn process_queue(&self) -> Result<ProcessReport, CoreError> {
        let Ok(_pass) = self.processing.try_lock() else {
            debug!("오프라인 큐 처리 중 - 중복 패스 건너뜀");
            return Ok(ProcessReport::default());
        };

        let pending = self.store.list_by_status(DeferredStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(ProcessReport::default());
        }
        debug!("오프라인 큐 처리 시작: {}건", pending.len());

        let now = Utc::now();
        let mut report = ProcessReport::default();
        let mut blocked: HashSet<EntityRef> = HashSet::new();

        for entry in chain_order(pending) {
            let key = entry.chain_key();
            if blocked.contains(&key) {
                report.skipped += 1;
                continue;
            }
            if !entry.is_due(now) {
                report.skipped += 1;
                blocked.insert(key);
                continue;
            }

            report.attempted += 1;
            let outcome = self.attempt(entry).await?;
            match &outcome {
                DeferredOutcome::Completed { .. } => report.completed += 1,
                DeferredOutcome::Retrying { .. } => report.retried += 1,
                DeferredOutcome::Failed { .. } => report.failed += 1,
            }
            if !matches!(outcome, DeferredOutcome::Completed { .. }) {
                blocked.insert(key);
            }
            self.outcome_observers.notify(&outcome);
        }

        Ok(report)
    }

    /// 요청 하나 전송 후 결과 반영
    async fn attempt(&self, mut entry: DeferredRequest) -> Result<DeferredOutcome, CoreError> {
        let marker = self
            .metrics
            .as_ref()
            .map(|m| m.start_timing(&entry.target, entry.method));
        let request = TransportRequest::new(entry.method, &entry.target)
            .with_payload(entry.payload.clone());

        match self.transport.execute(request).await {
            Ok(response) => {
                if let (Some(metrics), Some(marker)) = (&self.metrics, marker) {
                    metrics.record_request(
                        marker,
                        RequestOutcome::succeeded(
                            response.status,
                            response.is_cached(),
                            response.body_len(),
                        )
                        .with_retry_count(entry.retry_count),
                    );
                }
                self.store.delete(&entry.id).await?;
                info!(
                    "오프라인 요청 전송 완료: {} {} (id={})",
                    entry.method, entry.target, entry.id
                );
                Ok(DeferredOutcome::Completed { id: entry.id })
            }
            Err(e) => {
                if let (Some(metrics), Some(marker)) = (&self.metrics, marker) {
                    metrics.record_request(
                        marker,
                        RequestOutcome::failed(e.status_hint())
                            .with_retry_count(entry.retry_count),
                    );
                }

                entry.retry_count += 1;
                entry.last_error = Some(e.to_string());

                if !e.is_retryable() || entry.retry_count >= entry.max_retries {
                    entry.status = DeferredStatus::Failed;
                    self.store.update(&entry).await?;
                    error!(
                        "오프라인 요청 최종 실패 ({}회 시도): {} {} (id={}): {e}",
                        entry.retry_count, entry.method, entry.target, entry.id
                    );
                    self.notify_review_required(&entry, &e).await;
                    return Ok(DeferredOutcome::Failed {
                        id: entry.id,
                        error: e.to_string(),
                    });
                }

                let delay = backoff_delay(
                    entry.retry_count,
                    self.config.base_delay_ms,
                    self.config.max_delay_ms,
                );
                entry.next_attempt_at = Utc::now()
                    + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
                self.store.update(&entry).await?;
                warn!(
                    "오프라인 요청 실패, {}ms 후 재시도 ({}/{}): {} {}: {e}",
                    delay.as_millis(),
                    entry.retry_count,
                    entry.max_retries,
                    entry.method,
                    entry.target
                );
                Ok(DeferredOutcome::Retrying {
                    id: entry.id,
                    retry_count: entry.retry_count,
                    error: e.to_string(),
                })
            }
        }
    }

    async fn notify_review_required(&self, entry: &DeferredRequest, err: &CoreError) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let body = format!(
            "{} {} 요청을 전송하지 못했습니다. 확인이 필요합니다: {err}",
            entry.method, entry.target
        );
        if let Err(e) = notifier.notify_error("오프라인 요청 실패", &body).await {
            warn!("알림 전송 실패: {e}");
        }
    }

    /// 연결 복구 시 및 주기적으로 큐 처리
    ///
    /// 오프라인 → 온라인 전환마다, 그리고 온라인인 동안 `sweep_interval`마다 한 패스씩 실행한다.
    pub async fn run(
        self: Arc<Self>,
        connectivity: Arc<dyn ConnectivitySignal>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut online_rx = connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();

        let mut ticker = tokio::time::interval(self.config.sweep_interval().max(MIN_SWEEP_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("오프라인 큐 루프 시작");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if connectivity.is_online() {
                        self.run_pass().await;
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        warn!("연결 상태 채널 닫힘 - 오프라인 큐 루프 종료");
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        info!("연결 복구 - 오프라인 큐 처리");
                        self.run_pass().await;
                    }
                    was_online = online;
                }
                _ = shutdown_rx.changed() => {
                    info!("오프라인 큐 루프 종료");
                    break;
                }
            }
        }
    }

    async fn run_pass(&self) {
        match self.process_queue().await {
            Ok(report) if report.attempted > 0 => {
                info!(
                    "오프라인 큐 처리: 시도 {}, 완료 {}, 재시도 {}, 실패 {}, 건너뜀 {}",
                    report.attempted,
                    report.completed,
                    report.retried,
                    report.failed,
                    report.skipped
                );
            }
            Ok(_) => {}
            Err(e) => warn!("오프라인 큐 처리 실패: {e}"),
        }
    }

    // ============================================================
    // 검토용 조회/조작
    // ============================================================

    /// 대기/실패 건수
    pub async fn stats(&self) -> Result<QueueStats, CoreError> {
        Ok(QueueStats {
            pending: self.store.count_by_status(DeferredStatus::Pending).await?,
            failed: self.store.count_by_status(DeferredStatus::Failed).await?,
        })
    }

    /// 대기 중인 요청 (처리 순서)
    pub async fn pending_requests(&self) -> Result<Vec<DeferredRequest>, CoreError> {
        self.store.list_by_status(DeferredStatus::Pending).await
    }

    /// 같은 체인 키의 대기 요청이 남아 있는지
    ///
    /// 남아 있으면 새 변경 요청은 바로 보내지 말고 큐 뒤에 붙여야 한다.
    pub async fn has_pending_chain(&self, key: &EntityRef) -> Result<bool, CoreError> {
        Ok(self
            .store
            .list_by_status(DeferredStatus::Pending)
            .await?
            .iter()
            .any(|entry| entry.chain_key() == *key))
    }

    /// 재시도 소진으로 실패한 요청
    pub async fn failed_requests(&self) -> Result<Vec<DeferredRequest>, CoreError> {
        self.store.list_by_status(DeferredStatus::Failed).await
    }

    /// 실패한 요청을 다시 대기 상태로 (재시도 횟수 초기화)
    pub async fn retry_failed(&self, id: &str) -> Result<(), CoreError> {
        let mut entry = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                resource_type: "DeferredRequest".to_string(),
                id: id.to_string(),
            })?;

        if entry.status != DeferredStatus::Failed {
            return Err(CoreError::Validation {
                field: "status".to_string(),
                message: format!("FAILED 상태가 아님: {}", entry.status.as_str()),
            });
        }

        entry.status = DeferredStatus::Pending;
        entry.retry_count = 0;
        entry.last_error = None;
        entry.next_attempt_at = Utc::now();
        self.store.update(&entry).await?;
        info!("실패 요청 재대기: {id}");
        Ok(())
    }

    /// 요청 폐기 (없으면 `false`)
    pub async fn discard(&self, id: &str) -> Result<bool, CoreError> {
        let removed = self.store.delete(id).await?;
        if removed {
            info!("오프라인 요청 폐기: {id}");
        }
        Ok(removed)
    }

    /// 처리 결과 관찰자 등록
    pub fn on_outcome<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DeferredOutcome) + Send + Sync + 'static,
    {
        self.outcome_observers.subscribe(handler)
    }
}

/// 처리 순서 결정
///
/// 우선순위 순 목록에서 체인 키를 처음 만나는 위치에 그 체인 전체를
/// 제출 순서대로 배치한다.
fn chain_order(pending: Vec<DeferredRequest>) -> Vec<DeferredRequest> {
    let mut heads: Vec<EntityRef> = Vec::new();
    let mut chains: HashMap<EntityRef, Vec<DeferredRequest>> = HashMap::new();

    for entry in pending {
        let chain = chains.entry(entry.chain_key()).or_insert_with_key(|key| {
            heads.push(key.clone());
            Vec::new()
        });
        chain.push(entry);
    }

    let mut ordered = Vec::new();
    for key in heads {
        if let Some(mut chain) = chains.remove(&key) {
            chain.sort_by_key(|e| e.sequence);
            ordered.extend(chain);
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tether_core::config::MetricsConfig;
    use tether_core::models::request::{HttpMethod, Payload, RequestPriority, TransportResponse};
    use tether_storage::sqlite::SqliteStorage;
    use tokio::sync::Notify;

    /// 미리 정한 응답을 순서대로 돌려주는 전송 계층 (소진 후 200)
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<TransportResponse, CoreError>>>,
        calls: Mutex<Vec<String>>,
        bodies: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn push_err(&self, err: CoreError) {
            self.responses.lock().push_back(Err(err));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn bodies(&self) -> Vec<String> {
            self.bodies.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, CoreError> {
            self.calls.lock().push(request.path.clone());
            let body = request
                .payload
                .as_ref()
                .map(|p| String::from_utf8_lossy(&p.body).into_owned())
                .unwrap_or_default();
            self.bodies.lock().push(body);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(200, b"{}".to_vec())))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_info(&self, _title: &str, _body: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn notify_success(&self, _title: &str, _body: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn notify_error(&self, _title: &str, body: &str) -> Result<(), CoreError> {
            self.errors.lock().push(body.to_string());
            Ok(())
        }
    }

    fn retry_config(max_retries: u32, base_delay_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms,
            max_delay_ms: 30_000,
            sweep_interval_ms: 30_000,
        }
    }

    fn setup(config: RetryConfig) -> (DeferredQueue, Arc<ScriptedTransport>, Arc<SqliteStorage>) {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let transport = Arc::new(ScriptedTransport::default());
        let queue = DeferredQueue::new(store.clone(), transport.clone(), config);
        (queue, transport, store)
    }

    fn network_down() -> CoreError {
        CoreError::Network("connection refused".to_string())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1, 1_000, 30_000), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2, 1_000, 30_000), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(10, 1_000, 30_000), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(200, 1_000, 30_000), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn enqueue_persists_pending_entry() {
        let (queue, transport, store) = setup(retry_config(3, 0));
        let id = queue
            .enqueue(
                NewDeferredRequest::new(HttpMethod::Post, "/tasks")
                    .with_payload(Payload::json(&serde_json::json!({"title": "a"})).unwrap()),
            )
            .await
            .unwrap();

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeferredStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.max_retries, 3);
        assert!(transport.calls().is_empty());
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing() {
        let (queue, _transport, store) = setup(retry_config(3, 0));
        let a = queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/a"))
            .await
            .unwrap();
        let b = queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/b"))
            .await
            .unwrap();

        let a = store.get(&a).await.unwrap().unwrap();
        let b = store.get(&b).await.unwrap().unwrap();
        assert!(b.sequence > a.sequence);
    }

    #[tokio::test]
    async fn success_removes_entry_and_records_metric() {
        let (queue, transport, store) = setup(retry_config(3, 0));
        let metrics = Arc::new(MetricAggregator::new(MetricsConfig::default()));
        let queue = queue.with_metrics(metrics.clone());

        let id = queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Patch, "/tasks/7"))
            .await
            .unwrap();
        let report = queue.process_queue().await.unwrap();

        assert_eq!(
            report,
            ProcessReport {
                attempted: 1,
                completed: 1,
                ..ProcessReport::default()
            }
        );
        assert!(store.get(&id).await.unwrap().is_none());
        assert_eq!(transport.calls(), vec!["/tasks/7".to_string()]);

        let stats = metrics.endpoint_stats(HttpMethod::Patch, "/tasks/1").unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn three_failures_end_in_failed() {
        let (queue, transport, _store) = setup(retry_config(3, 0));
        let notifier = Arc::new(RecordingNotifier::default());
        let queue = queue.with_notifier(notifier.clone());
        for _ in 0..4 {
            transport.push_err(network_down());
        }

        let id = queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/tasks"))
            .await
            .unwrap();

        for expected_retry in 1..=2u32 {
            let report = queue.process_queue().await.unwrap();
            assert_eq!(report.retried, 1);
            let pending = queue.pending_requests().await.unwrap();
            assert_eq!(pending[0].retry_count, expected_retry);
        }

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.failed, 1);

        // 4번째 패스: FAILED는 더 이상 시도하지 않음
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(transport.calls().len(), 3);

        let failed = queue.failed_requests().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].retry_count, 3);
        assert!(failed[0].last_error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(notifier.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn validation_error_fails_immediately() {
        let (queue, transport, _store) = setup(retry_config(3, 0));
        transport.push_err(CoreError::Validation {
            field: "title".to_string(),
            message: "required".to_string(),
        });

        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/tasks"))
            .await
            .unwrap();
        let report = queue.process_queue().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(queue.failed_requests().await.unwrap()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn entity_chain_runs_in_submission_order() {
        let (queue, transport, _store) = setup(retry_config(3, 0));

        // A(낮은 우선순위) → B(높은 우선순위), 같은 엔티티
        queue
            .enqueue(
                NewDeferredRequest::new(HttpMethod::Post, "/tasks/1/a")
                    .with_entity("task", "1")
                    .with_priority(RequestPriority::Background),
            )
            .await
            .unwrap();
        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/other"))
            .await
            .unwrap();
        queue
            .enqueue(
                NewDeferredRequest::new(HttpMethod::Post, "/tasks/1/b")
                    .with_entity("task", "1")
                    .with_priority(RequestPriority::Auth),
            )
            .await
            .unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(
            transport.calls(),
            vec![
                "/tasks/1/a".to_string(),
                "/tasks/1/b".to_string(),
                "/other".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn failed_head_blocks_rest_of_chain() {
        let (queue, transport, _store) = setup(retry_config(3, 0));
        transport.push_err(network_down());

        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/a").with_entity("task", "1"))
            .await
            .unwrap();
        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Patch, "/b").with_entity("task", "1"))
            .await
            .unwrap();
        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/c").with_entity("task", "2"))
            .await
            .unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(transport.calls(), vec!["/a".to_string(), "/c".to_string()]);

        // 다음 패스에서 A → B 순서로 마무리
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(
            transport.calls()[2..],
            ["/a".to_string(), "/b".to_string()]
        );
    }

    fn text(body: &str) -> Payload {
        Payload::raw("text/plain", body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn same_path_without_entity_is_chained() {
        let (queue, transport, _store) = setup(retry_config(3, 0));
        transport.push_err(network_down());

        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Patch, "/tasks/3").with_payload(text("A")))
            .await
            .unwrap();
        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Patch, "/tasks/3").with_payload(text("B")))
            .await
            .unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.skipped, 1);

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.completed, 2);
        // 최신 B가 마지막에 적용됨
        assert_eq!(transport.bodies(), ["A", "A", "B"]);
    }

    #[tokio::test]
    async fn sequence_stays_above_entries_from_previous_run() {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let transport = Arc::new(ScriptedTransport::default());
        let future_sequence = Utc::now().timestamp_micros() + 3_600_000_000;
        let now = Utc::now();
        store
            .add(&DeferredRequest {
                id: "earlier-run".to_string(),
                target: "/tasks/3".to_string(),
                method: HttpMethod::Patch,
                payload: None,
                entity: None,
                priority: RequestPriority::Entity,
                status: DeferredStatus::Pending,
                enqueued_at: now,
                sequence: future_sequence,
                retry_count: 0,
                max_retries: 3,
                last_error: None,
                next_attempt_at: now,
            })
            .await
            .unwrap();

        // 시계가 뒤로 간 재시작 후의 새 큐
        let queue = DeferredQueue::new(store.clone(), transport.clone(), retry_config(3, 0));
        let id = queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Patch, "/tasks/3").with_payload(text("new")))
            .await
            .unwrap();

        let entry = store.get(&id).await.unwrap().unwrap();
        assert!(entry.sequence > future_sequence);

        queue.process_queue().await.unwrap();
        assert_eq!(transport.bodies(), vec!["".to_string(), "new".to_string()]);
    }

    #[tokio::test]
    async fn pending_chain_lookup_uses_path_key() {
        let (queue, _transport, _store) = setup(retry_config(3, 0));
        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Delete, "/tasks/3?force=1"))
            .await
            .unwrap();

        assert!(queue
            .has_pending_chain(&EntityRef::for_path("/tasks/3"))
            .await
            .unwrap());
        assert!(!queue
            .has_pending_chain(&EntityRef::for_path("/tasks/4"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn backoff_defers_next_attempt() {
        let (queue, transport, _store) = setup(retry_config(3, 1_000));
        transport.push_err(network_down());

        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/tasks"))
            .await
            .unwrap();
        let before = Utc::now();
        queue.process_queue().await.unwrap();

        let pending = queue.pending_requests().await.unwrap();
        let wait = pending[0].next_attempt_at - before;
        assert!(wait >= ChronoDuration::milliseconds(1_900));

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn retry_failed_and_discard() {
        let (queue, transport, store) = setup(retry_config(1, 0));
        transport.push_err(network_down());

        let id = queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Delete, "/tasks/3"))
            .await
            .unwrap();
        queue.process_queue().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().failed, 1);

        // PENDING 요청은 재대기 대상 아님
        let other = queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/x"))
            .await
            .unwrap();
        assert!(matches!(
            queue.retry_failed(&other).await,
            Err(CoreError::Validation { .. })
        ));
        assert!(matches!(
            queue.retry_failed("missing").await,
            Err(CoreError::NotFound { .. })
        ));

        queue.retry_failed(&id).await.unwrap();
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, DeferredStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.last_error.is_none());

        assert!(queue.discard(&other).await.unwrap());
        assert!(!queue.discard(&other).await.unwrap());
    }

    #[tokio::test]
    async fn outcome_observers_see_each_attempt() {
        let (queue, transport, _store) = setup(retry_config(3, 0));
        transport.push_err(network_down());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = queue.on_outcome(move |o| {
            s.lock().push(matches!(o, DeferredOutcome::Completed { .. }));
        });

        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/tasks"))
            .await
            .unwrap();
        queue.process_queue().await.unwrap();
        queue.process_queue().await.unwrap();

        assert_eq!(*seen.lock(), vec![false, true]);
    }

    /// 첫 호출을 테스트가 풀어줄 때까지 붙잡는 전송 계층
    #[derive(Default)]
    struct GatedTransport {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn execute(&self, _request: TransportRequest) -> Result<TransportResponse, CoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(TransportResponse::new(204, Vec::new()))
        }
    }

    #[tokio::test]
    async fn overlapping_pass_returns_empty_report() {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let transport = Arc::new(GatedTransport::default());
        let queue = Arc::new(DeferredQueue::new(
            store,
            transport.clone(),
            retry_config(3, 0),
        ));
        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/tasks"))
            .await
            .unwrap();

        let q = queue.clone();
        let first = tokio::spawn(async move { q.process_queue().await });
        transport.entered.notified().await;

        let second = queue.process_queue().await.unwrap();
        assert_eq!(second, ProcessReport::default());

        transport.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.completed, 1);
    }

    struct ManualConnectivity {
        tx: watch::Sender<bool>,
    }

    impl ConnectivitySignal for ManualConnectivity {
        fn is_online(&self) -> bool {
            *self.tx.borrow()
        }

        fn subscribe(&self) -> watch::Receiver<bool> {
            self.tx.subscribe()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_triggers_processing() {
        let (queue, transport, _store) = setup(retry_config(3, 0));
        let queue = Arc::new(queue);
        queue
            .enqueue(NewDeferredRequest::new(HttpMethod::Post, "/tasks"))
            .await
            .unwrap();

        let (online_tx, _) = watch::channel(false);
        let connectivity = Arc::new(ManualConnectivity { tx: online_tx });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(queue.clone().run(connectivity.clone(), shutdown_rx));

        // 오프라인 동안은 처리하지 않음
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(transport.calls().is_empty());

        connectivity.tx.send_replace(true);
        while queue.stats().await.unwrap().pending > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.calls(), vec!["/tasks".to_string()]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
