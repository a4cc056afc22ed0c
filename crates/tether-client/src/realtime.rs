//! 실시간 채널.
//!
//! 서버 푸시 이벤트용 지속 연결을 관리한다.
//!
//! ```text
//! DISCONNECTED --connect--> CONNECTING --핸드셰이크 성공--> CONNECTED
//! CONNECTED --정상 종료--> DISCONNECTED
//! CONNECTED --비정상 종료/에러--> DISCONNECTED --> RECONNECTING --타이머--> CONNECTING
//! CONNECTING --핸드셰이크 실패--> RECONNECTING
//! ```
//!
//! 재연결 지연은 `min(base * 1.5^attempt, max)`이며, `max_attempts`회 연속 실패하면
//! DISCONNECTED로 멈추고 `ChannelNotice::ReconnectExhausted`를 발행한다.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tether_core::config::RealtimeConfig;
use tether_core::error::CoreError;
use tether_core::models::realtime::{ChannelNotice, ConnectionState, RealtimeEvent};
use tether_core::ports::cache_projection::CacheProjection;
use tether_core::ports::channel::{ChannelConnection, ChannelConnector, ChannelFrame, ChannelSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::observer::{ObserverRegistry, Subscription};

/// 모든 이벤트를 받는 구독 키
pub const WILDCARD: &str = "*";

/// keepalive 최소 간격
const MIN_KEEPALIVE: Duration = Duration::from_millis(100);

/// 연결 한 번이 끝난 이유
enum PumpEnd {
    /// `disconnect()` 요청
    Stopped,
    /// 정상 종료 핸드셰이크
    Clean,
    /// 비정상 종료, 전송 에러, 스트림 끊김
    Unclean(String),
}

/// 연결 감독 태스크 핸들
struct Supervisor {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

struct ChannelInner {
    connector: Arc<dyn ChannelConnector>,
    config: RealtimeConfig,
    state_tx: watch::Sender<ConnectionState>,
    events: ObserverRegistry<RealtimeEvent>,
    state_observers: ObserverRegistry<ConnectionState>,
    notices: ObserverRegistry<ChannelNotice>,
    sender: Mutex<Option<Arc<dyn ChannelSender>>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// 재연결 소진 시 시도 횟수 (다음 connect까지 유지)
    exhausted: Mutex<Option<u32>>,
}

/// 실시간 채널
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(connector: Arc<dyn ChannelConnector>, config: RealtimeConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                config,
                state_tx,
                events: ObserverRegistry::new(),
                state_observers: ObserverRegistry::new(),
                notices: ObserverRegistry::new(),
                sender: Mutex::new(None),
                supervisor: Mutex::new(None),
                exhausted: Mutex::new(None),
            }),
        }
    }

    /// 연결 시작
    ///
    /// 이미 연결 중이거나 재연결 대기 중이면 아무것도 하지 않는다.
    /// 재연결 시도가 소진된 뒤 다시 호출하면 처음부터 시작한다.
    pub fn connect(&self) {
        let mut slot = self.inner.supervisor.lock();
        if let Some(supervisor) = slot.as_ref() {
            if !supervisor.handle.is_finished() {
                debug!("실시간 채널 이미 동작 중 - connect 무시");
                return;
            }
        }

        *self.inner.exhausted.lock() = None;
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.inner.clone().supervise(stop_rx));
        *slot = Some(Supervisor { handle, stop_tx });
    }

    /// 수동 종료 (재연결하지 않음)
    pub async fn disconnect(&self) {
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.stop_tx.send(true);
            if let Err(e) = supervisor.handle.await {
                warn!("실시간 채널 감독 태스크 종료 에러: {e}");
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("실시간 채널 수동 종료");
    }

    /// 현재 연결 상태
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 재연결 소진 여부 확인
    ///
    /// 소진 후 `connect()`를 다시 부르기 전까지 `ChannelExhausted`를 반환한다.
    pub fn check_health(&self) -> Result<(), CoreError> {
        match *self.inner.exhausted.lock() {
            Some(attempts) => Err(CoreError::ChannelExhausted { attempts }),
            None => Ok(()),
        }
    }

    /// 상태 변경 구독 (watch)
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// 이벤트 핸들러 등록 (`"*"`는 모든 이벤트)
    ///
    /// 핸들러는 등록 순서대로 동기 실행되며, 패닉은 로그만 남기고 격리된다.
    pub fn on<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let wanted = event_type.to_string();
        self.inner.events.subscribe(move |event: &RealtimeEvent| {
            if wanted == WILDCARD || event.event_type == wanted {
                handler(event);
            }
        })
    }

    /// 상태 전이 관찰자 등록
    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.state_observers.subscribe(handler)
    }

    /// 재연결 예약/소진 알림 관찰자 등록
    pub fn on_notice<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChannelNotice) + Send + Sync + 'static,
    {
        self.inner.notices.subscribe(handler)
    }

    /// 캐시 프로젝션 연결: 모든 이벤트를 전달
    pub fn attach_projection(&self, projection: Arc<dyn CacheProjection>) -> Subscription {
        self.on(WILDCARD, move |event| projection.apply(event))
    }

    /// 이벤트 전송 (연결되어 있지 않으면 경고 후 `false`)
    pub async fn send(&self, event_type: &str, data: serde_json::Value) -> bool {
        let sender = if self.is_connected() {
            self.inner.sender.lock().clone()
        } else {
            None
        };
        let Some(sender) = sender else {
            warn!("실시간 채널 미연결 - 전송 무시: {event_type}");
            return false;
        };

        let text = match serde_json::to_string(&RealtimeEvent::new(event_type, data)) {
            Ok(text) => text,
            Err(e) => {
                warn!("실시간 이벤트 직렬화 실패: {e}");
                return false;
            }
        };

        match sender.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("실시간 이벤트 전송 실패 ({event_type}): {e}");
                false
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            let _ = supervisor.stop_tx.send(true);
        }
    }
}

impl ChannelInner {
    /// 상태 전이: 값이 바뀐 경우만 관찰자 통지
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("실시간 채널 상태: {previous:?} → {state:?}");
            self.state_observers.notify(&state);
        }
    }

    /// 연결/재연결 감독 루프
    async fn supervise(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                result = self.connector.connect() => result,
                _ = stop_rx.changed() => break,
            };

            match connected {
                Ok(conn) => {
                    attempt = 0;
                    *self.sender.lock() = Some(conn.sender.clone());
                    self.set_state(ConnectionState::Connected);
                    info!("실시간 채널 연결됨");

                    let end = self.pump(conn, &mut stop_rx).await;
                    *self.sender.lock() = None;

                    match end {
                        PumpEnd::Stopped => break,
                        PumpEnd::Clean => {
                            info!("실시간 채널 정상 종료");
                            break;
                        }
                        PumpEnd::Unclean(reason) => {
                            warn!("실시간 채널 끊김: {reason}");
                            self.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    warn!("실시간 채널 연결 실패: {e}");
                }
            }

            if attempt >= self.config.max_attempts {
                self.set_state(ConnectionState::Disconnected);
                error!("실시간 채널 재연결 {attempt}회 실패 - 수동 재연결 필요");
                *self.exhausted.lock() = Some(attempt);
                self.notices
                    .notify(&ChannelNotice::ReconnectExhausted { attempts: attempt });
                return;
            }

            let delay = self.config.reconnect_delay(attempt);
            attempt += 1;
            self.set_state(ConnectionState::Reconnecting);
            info!(
                "실시간 채널 재연결 예약 ({attempt}/{}): {}ms 후",
                self.config.max_attempts,
                delay.as_millis()
            );
            self.notices.notify(&ChannelNotice::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("실시간 채널 감독 루프 종료");
    }

    /// 연결 하나의 수신/keepalive 루프
    async fn pump(&self, conn: ChannelConnection, stop_rx: &mut watch::Receiver<bool>) -> PumpEnd {
        let ChannelConnection {
            sender,
            mut inbound,
        } = conn;

        let period = self.config.keepalive_interval().max(MIN_KEEPALIVE);
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(ChannelFrame::Text(text)) => self.dispatch_text(&text),
                    Some(ChannelFrame::Closed { clean: true }) => return PumpEnd::Clean,
                    Some(ChannelFrame::Closed { clean: false }) => {
                        return PumpEnd::Unclean("비정상 종료".to_string());
                    }
                    Some(ChannelFrame::Error(e)) => return PumpEnd::Unclean(e),
                    None => return PumpEnd::Unclean("수신 스트림 종료".to_string()),
                },
                _ = keepalive.tick() => {
                    match serde_json::to_string(&RealtimeEvent::new("ping", serde_json::Value::Null)) {
                        Ok(ping) => {
                            if let Err(e) = sender.send_text(ping).await {
                                debug!("keepalive 전송 실패: {e}");
                            }
                        }
                        Err(e) => debug!("keepalive 직렬화 실패: {e}"),
                    }
                }
                _ = stop_rx.changed() => {
                    if let Err(e) = sender.close().await {
                        debug!("실시간 채널 종료 프레임 전송 실패: {e}");
                    }
                    return PumpEnd::Stopped;
                }
            }
        }
    }

    /// 텍스트 프레임을 이벤트로 해석해서 핸들러에 전달
    fn dispatch_text(&self, text: &str) {
        let event: RealtimeEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("실시간 메시지 파싱 실패: {e}");
                return;
            }
        };
        // keepalive 응답
        if event.event_type == "pong" {
            return;
        }
        debug!("실시간 이벤트 수신: {}", event.event_type);
        self.events.notify(&event);
    }
}
