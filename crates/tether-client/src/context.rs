//! 애플리케이션 컨텍스트.
//!
//! 포트 구현을 주입받아 메트릭, 레이트 거버너, 오프라인 큐, 디스패처,
//! 실시간 채널을 한 번에 조립한다. 백그라운드 루프는 `start()`에서 띄운다.

use std::sync::Arc;
use tether_core::config::AppConfig;
use tether_core::error::CoreError;
use tether_core::ports::cache_projection::CacheProjection;
use tether_core::ports::channel::ChannelConnector;
use tether_core::ports::connectivity::ConnectivitySignal;
use tether_core::ports::deferred_store::DeferredStore;
use tether_core::ports::notifier::Notifier;
use tether_core::ports::transport::Transport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatcher::RequestDispatcher;
use crate::metrics::MetricAggregator;
use crate::observer::Subscription;
use crate::offline_queue::DeferredQueue;
use crate::rate_limit::RateGovernor;
use crate::realtime::RealtimeChannel;

/// 조립된 클라이언트 구성 요소
pub struct AppContext {
    config: AppConfig,
    connectivity: Arc<dyn ConnectivitySignal>,
    metrics: Arc<MetricAggregator>,
    governor: Arc<RateGovernor>,
    queue: Arc<DeferredQueue>,
    dispatcher: Arc<RequestDispatcher>,
    realtime: Option<Arc<RealtimeChannel>>,
    /// 프로젝션 구독 (컨텍스트 수명 동안 유지)
    _projection: Option<Subscription>,
}

impl AppContext {
    pub fn builder(config: AppConfig) -> AppContextBuilder {
        AppContextBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &Arc<dyn ConnectivitySignal> {
        &self.connectivity
    }

    pub fn metrics(&self) -> &Arc<MetricAggregator> {
        &self.metrics
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn queue(&self) -> &Arc<DeferredQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    /// 실시간 동기화가 꺼져 있으면 None
    pub fn realtime(&self) -> Option<&Arc<RealtimeChannel>> {
        self.realtime.as_ref()
    }

    /// 백그라운드 루프 시작
    ///
    /// 오프라인 큐 루프를 띄우고 실시간 채널 연결을 시작한다.
    pub fn start(&self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.features.enable_offline_support {
            handles.push(tokio::spawn(
                self.queue
                    .clone()
                    .run(self.connectivity.clone(), shutdown_rx.clone()),
            ));
        }

        if let Some(realtime) = &self.realtime {
            realtime.connect();
        }

        info!("클라이언트 컨텍스트 시작 (백그라운드 태스크 {}개)", handles.len());
        handles
    }

    /// 실시간 채널 종료
    pub async fn shutdown(&self) {
        if let Some(realtime) = &self.realtime {
            realtime.disconnect().await;
        }
        info!("클라이언트 컨텍스트 종료");
    }
}

/// `AppContext` 빌더
pub struct AppContextBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn DeferredStore>>,
    connectivity: Option<Arc<dyn ConnectivitySignal>>,
    notifier: Option<Arc<dyn Notifier>>,
    connector: Option<Arc<dyn ChannelConnector>>,
    projection: Option<Arc<dyn CacheProjection>>,
}

impl AppContextBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            connectivity: None,
            notifier: None,
            connector: None,
            projection: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn DeferredStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn ConnectivitySignal>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn projection(mut self, projection: Arc<dyn CacheProjection>) -> Self {
        self.projection = Some(projection);
        self
    }

    /// 구성 요소 조립 (필수 포트 누락은 `Config` 에러)
    pub fn build(self) -> Result<AppContext, CoreError> {
        let config = self.config;
        let transport = self
            .transport
            .ok_or_else(|| CoreError::Config("transport 미설정".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| CoreError::Config("deferred store 미설정".to_string()))?;
        let connectivity = self
            .connectivity
            .ok_or_else(|| CoreError::Config("connectivity 미설정".to_string()))?;

        let metrics = Arc::new(MetricAggregator::new(config.metrics.clone()));
        let governor = Arc::new(RateGovernor::new(config.rate_limit.clone()));

        let mut queue = DeferredQueue::new(store, transport.clone(), config.retry.clone())
            .with_metrics(metrics.clone());
        if let Some(notifier) = &self.notifier {
            queue = queue.with_notifier(notifier.clone());
        }
        let queue = Arc::new(queue);

        let mut dispatcher = RequestDispatcher::new(transport, connectivity.clone())
            .with_metrics(metrics.clone())
            .with_governor(governor.clone())
            .with_queue(queue.clone())
            .with_features(config.features.clone())
            .with_notification_config(config.notification.clone());
        if let Some(notifier) = self.notifier {
            dispatcher = dispatcher.with_notifier(notifier);
        }

        let realtime = if config.features.enable_real_time_sync {
            let connector = self.connector.ok_or_else(|| {
                CoreError::Config("실시간 동기화가 켜져 있지만 connector 미설정".to_string())
            })?;
            Some(Arc::new(RealtimeChannel::new(
                connector,
                config.realtime.clone(),
            )))
        } else {
            None
        };

        let projection = match (&realtime, self.projection) {
            (Some(channel), Some(projection)) => Some(channel.attach_projection(projection)),
            _ => None,
        };

        info!(
            "클라이언트 컨텍스트 구성: 서버={}, 오프라인 지원={}, 레이트 리밋={}, 실시간={}",
            config.server.base_url,
            config.features.enable_offline_support,
            config.features.enable_rate_limiting,
            realtime.is_some()
        );

        Ok(AppContext {
            config,
            connectivity,
            metrics,
            governor,
            queue,
            dispatcher: Arc::new(dispatcher),
            realtime,
            _projection: projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tether_core::models::request::{TransportRequest, TransportResponse};
    use tether_core::ports::channel::ChannelConnection;
    use tether_storage::sqlite::SqliteStorage;

    struct OkTransport;

    #[async_trait]
    impl Transport for OkTransport {
        async fn execute(&self, _request: TransportRequest) -> Result<TransportResponse, CoreError> {
            Ok(TransportResponse::new(200, b"{}".to_vec()))
        }
    }

    struct StaticConnectivity(watch::Sender<bool>);

    impl ConnectivitySignal for StaticConnectivity {
        fn is_online(&self) -> bool {
            *self.0.borrow()
        }

        fn subscribe(&self) -> watch::Receiver<bool> {
            self.0.subscribe()
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl ChannelConnector for RefusingConnector {
        async fn connect(&self) -> Result<ChannelConnection, CoreError> {
            Err(CoreError::Network("refused".to_string()))
        }
    }

    fn builder(config: AppConfig) -> AppContextBuilder {
        AppContext::builder(config)
            .transport(Arc::new(OkTransport))
            .store(Arc::new(SqliteStorage::open_in_memory().unwrap()))
            .connectivity(Arc::new(StaticConnectivity(watch::channel(true).0)))
    }

    #[test]
    fn missing_transport_is_config_error() {
        let result = AppContext::builder(AppConfig::default_config()).build();
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn realtime_requires_connector_when_enabled() {
        let result = builder(AppConfig::default_config()).build();
        assert!(matches!(result, Err(CoreError::Config(_))));

        let mut config = AppConfig::default_config();
        config.features.enable_real_time_sync = false;
        let ctx = builder(config).build().unwrap();
        assert!(ctx.realtime().is_none());
    }

    #[tokio::test]
    async fn dispatcher_runs_through_context() {
        let ctx = builder(AppConfig::default_config())
            .connector(Arc::new(RefusingConnector))
            .build()
            .unwrap();

        let result = ctx.dispatcher().get("/tasks").await.unwrap();
        assert!(result.success);
        assert_eq!(ctx.metrics().all_stats().len(), 1);
        assert_eq!(ctx.governor().utilization()[0].in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_shutdown() {
        let ctx = builder(AppConfig::default_config())
            .connector(Arc::new(RefusingConnector))
            .build()
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = ctx.start(shutdown_rx);
        assert_eq!(handles.len(), 1);

        ctx.shutdown().await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(
            ctx.realtime().unwrap().state(),
            tether_core::models::realtime::ConnectionState::Disconnected
        );
    }
}
