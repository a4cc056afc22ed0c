//! 요청 디스패처.
//!
//! 모든 API 호출의 단일 진입점. 메트릭, 레이트 리밋, 오프라인 큐, 알림을
//! 엮어서 결과를 `ApiResult` 봉투로 정규화한다.
//! 설정 오류(`CoreError::Config`)만 `Err`로 전파된다.

use serde::Serialize;
use std::sync::Arc;
use tether_core::config::{FeatureFlags, NotificationConfig};
use tether_core::error::CoreError;
use tether_core::models::deferred::{chain_key, NewDeferredRequest};
use tether_core::models::envelope::ApiResult;
use tether_core::models::request::{HttpMethod, Payload, RequestOptions, TransportRequest};
use tether_core::ports::connectivity::ConnectivitySignal;
use tether_core::ports::notifier::Notifier;
use tether_core::ports::transport::Transport;
use tracing::{debug, error, warn};

use crate::metrics::{MetricAggregator, RequestOutcome, TimingMarker};
use crate::offline_queue::DeferredQueue;
use crate::rate_limit::RateGovernor;

/// 알림 종류
#[derive(Debug, Clone, Copy)]
enum NoticeKind {
    Info,
    Success,
    Error,
}

/// 요청 디스패처
pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn ConnectivitySignal>,
    metrics: Option<Arc<MetricAggregator>>,
    governor: Option<Arc<RateGovernor>>,
    queue: Option<Arc<DeferredQueue>>,
    notifier: Option<Arc<dyn Notifier>>,
    features: FeatureFlags,
    notification: NotificationConfig,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn Transport>, connectivity: Arc<dyn ConnectivitySignal>) -> Self {
        Self {
            transport,
            connectivity,
            metrics: None,
            governor: None,
            queue: None,
            notifier: None,
            features: FeatureFlags::default(),
            notification: NotificationConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricAggregator>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_governor(mut self, governor: Arc<RateGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_queue(mut self, queue: Arc<DeferredQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    pub fn with_notification_config(mut self, notification: NotificationConfig) -> Self {
        self.notification = notification;
        self
    }

    fn metrics(&self) -> Option<&Arc<MetricAggregator>> {
        self.metrics
            .as_ref()
            .filter(|_| self.features.enable_performance_monitoring)
    }

    fn governor(&self) -> Option<&Arc<RateGovernor>> {
        self.governor
            .as_ref()
            .filter(|_| self.features.enable_rate_limiting)
    }

    fn queue(&self) -> Option<&Arc<DeferredQueue>> {
        self.queue
            .as_ref()
            .filter(|_| self.features.enable_offline_support)
    }

    /// 요청 실행
    ///
    /// 오프라인 상태의 변경 요청은 네트워크 없이 큐에 저장하고 `offline=true` 봉투를 돌려준다.
    /// 온라인 변경 요청이 네트워크 에러로 실패해도 큐로 넘긴다.
    /// 같은 대상의 대기 요청이 큐에 있으면 온라인이어도 큐 뒤에 붙인다.
    pub async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        payload: Option<Payload>,
        options: RequestOptions,
    ) -> Result<ApiResult, CoreError> {
        if !endpoint.starts_with('/') {
            return Err(CoreError::Config(format!(
                "엔드포인트는 '/'로 시작해야 함: {endpoint}"
            )));
        }

        let marker = self.metrics().map(|m| m.start_timing(endpoint, method));

        if method.is_mutating() {
            if let Some(queue) = self.queue() {
                if !self.connectivity.is_online() {
                    debug!("오프라인 - 큐에 저장: {method} {endpoint}");
                    return Ok(self.defer(queue, method, endpoint, payload, &options).await);
                }

                // 같은 대상의 선행 요청이 큐에 남아 있으면 그 뒤에 붙인다
                let key = chain_key(options.entity.as_ref(), endpoint);
                match queue.has_pending_chain(&key).await {
                    Ok(true) => {
                        debug!("선행 요청 대기 중 - 큐에 저장: {method} {endpoint}");
                        return Ok(self.defer(queue, method, endpoint, payload, &options).await);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("오프라인 큐 조회 실패, 바로 전송: {e}"),
                }
            }
        }

        if let Some(governor) = self.governor() {
            if let Err(e) = governor
                .limit_request(endpoint, method, options.priority)
                .await
            {
                warn!("로컬 레이트 리밋: {method} {endpoint}: {e}");
                self.notify_failure(method, endpoint, &e);
                return Ok(ApiResult::failure(&e));
            }
        }

        let request = TransportRequest::new(method, endpoint)
            .with_payload(payload.clone())
            .with_headers(options.headers.clone());

        match self.transport.execute(request).await {
            Ok(response) => {
                self.connectivity.report_reachability(true);
                self.record(
                    marker,
                    RequestOutcome::succeeded(
                        response.status,
                        response.is_cached(),
                        response.body_len(),
                    ),
                );
                if options.notify_success && self.notification.show_success_notifications {
                    self.spawn_notice(
                        NoticeKind::Success,
                        "요청 완료".to_string(),
                        format!("{method} {endpoint}"),
                    );
                }
                Ok(ApiResult::ok(response.json_body(), "요청 성공"))
            }
            Err(e) => {
                self.record(marker, RequestOutcome::failed(e.status_hint()));
                self.connectivity.report_reachability(!e.is_unreachable());

                if e.is_unreachable() && method.is_mutating() {
                    if let Some(queue) = self.queue() {
                        warn!("네트워크 실패 - 큐에 저장: {method} {endpoint}: {e}");
                        return Ok(self.defer(queue, method, endpoint, payload, &options).await);
                    }
                }

                warn!("요청 실패: {method} {endpoint}: {e}");
                self.notify_failure(method, endpoint, &e);
                Ok(ApiResult::failure(&e))
            }
        }
    }

    /// 오프라인 큐에 저장하고 봉투 생성
    async fn defer(
        &self,
        queue: &DeferredQueue,
        method: HttpMethod,
        endpoint: &str,
        payload: Option<Payload>,
        options: &RequestOptions,
    ) -> ApiResult {
        let request = NewDeferredRequest {
            method,
            target: endpoint.to_string(),
            payload,
            entity: options.entity.clone(),
            priority: options.priority,
        };

        match queue.enqueue(request).await {
            Ok(id) => {
                if self.notification.show_offline_notifications {
                    self.spawn_notice(
                        NoticeKind::Info,
                        "오프라인 저장".to_string(),
                        format!("{method} {endpoint} 요청은 연결 복구 후 전송됩니다"),
                    );
                }
                ApiResult::queued(id)
            }
            Err(e) => {
                error!("오프라인 큐 저장 실패: {method} {endpoint}: {e}");
                self.notify_failure(method, endpoint, &e);
                ApiResult::failure(&e)
            }
        }
    }

    fn record(&self, marker: Option<TimingMarker>, outcome: RequestOutcome) {
        if let (Some(metrics), Some(marker)) = (self.metrics(), marker) {
            metrics.record_request(marker, outcome);
        }
    }

    fn notify_failure(&self, method: HttpMethod, endpoint: &str, err: &CoreError) {
        if self.notification.show_error_notifications {
            self.spawn_notice(
                NoticeKind::Error,
                "요청 실패".to_string(),
                format!("{method} {endpoint}: {err}"),
            );
        }
    }

    /// 알림은 요청 흐름을 막지 않도록 별도 태스크로 보냄
    fn spawn_notice(&self, kind: NoticeKind, title: String, body: String) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        tokio::spawn(async move {
            let result = match kind {
                NoticeKind::Info => notifier.notify_info(&title, &body).await,
                NoticeKind::Success => notifier.notify_success(&title, &body).await,
                NoticeKind::Error => notifier.notify_error(&title, &body).await,
            };
            if let Err(e) = result {
                warn!("알림 전송 실패: {e}");
            }
        });
    }

    // ============================================================
    // 편의 메서드
    // ============================================================

    pub async fn get(&self, endpoint: &str) -> Result<ApiResult, CoreError> {
        self.request(HttpMethod::Get, endpoint, None, RequestOptions::default())
            .await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        payload: Option<Payload>,
    ) -> Result<ApiResult, CoreError> {
        self.request(HttpMethod::Post, endpoint, payload, RequestOptions::default())
            .await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        payload: Option<Payload>,
    ) -> Result<ApiResult, CoreError> {
        self.request(HttpMethod::Put, endpoint, payload, RequestOptions::default())
            .await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        payload: Option<Payload>,
    ) -> Result<ApiResult, CoreError> {
        self.request(HttpMethod::Patch, endpoint, payload, RequestOptions::default())
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<ApiResult, CoreError> {
        self.request(HttpMethod::Delete, endpoint, None, RequestOptions::default())
            .await
    }

    /// JSON 본문 요청 (직렬화 실패는 실패 봉투)
    pub async fn send_json<T: Serialize>(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: &T,
        options: RequestOptions,
    ) -> Result<ApiResult, CoreError> {
        match Payload::json(body) {
            Ok(payload) => self.request(method, endpoint, Some(payload), options).await,
            Err(e) => {
                warn!("요청 본문 직렬화 실패: {method} {endpoint}: {e}");
                Ok(ApiResult::failure(&e))
            }
        }
    }
}
