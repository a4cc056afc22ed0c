//! 연결 상태 관리.
//!
//! 요청 결과(도달/미도달)로 서버 연결 상태를 감지하고,
//! 오프라인 동안에는 헬스 체크로 복구를 감지한다.
//! `ConnectivitySignal` 포트 구현.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tether_core::ports::connectivity::ConnectivitySignal;
use tether_core::ports::transport::Transport;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct LinkState {
    reachable: bool,
    consecutive_failures: u64,
    forced_offline: bool,
    last_success: Option<Instant>,
}

impl LinkState {
    fn effective(&self) -> bool {
        self.reachable && !self.forced_offline
    }
}

/// 연결 상태 관리자
///
/// 연속 실패가 임계값에 도달하면 오프라인, 한 번이라도 성공하면 온라인으로 전환.
/// 유효 상태(강제 오프라인 반영)가 바뀔 때만 `watch` 채널에 발행한다.
pub struct ConnectivityManager {
    state: Mutex<LinkState>,
    online_tx: watch::Sender<bool>,
    offline_threshold: u64,
}

impl ConnectivityManager {
    /// `offline_threshold`: 이 횟수만큼 연속 실패하면 오프라인 전환 (최소 1)
    pub fn new(offline_threshold: u64) -> Self {
        Self {
            state: Mutex::new(LinkState {
                reachable: true,
                consecutive_failures: 0,
                forced_offline: false,
                last_success: None,
            }),
            online_tx: watch::channel(true).0,
            offline_threshold: offline_threshold.max(1),
        }
    }

    /// 강제 오프라인 모드 (해제하면 실제 도달 상태로 복귀)
    pub fn set_force_offline(&self, force: bool) {
        self.transition(|state| {
            if state.forced_offline != force {
                state.forced_offline = force;
                info!("강제 오프라인 모드 {}", if force { "활성화" } else { "해제" });
            }
        });
    }

    pub fn is_force_offline(&self) -> bool {
        self.state.lock().forced_offline
    }

    /// 도달 성공: 실패 카운터 리셋, 온라인 복귀
    pub fn record_success(&self) {
        self.transition(|state| {
            state.consecutive_failures = 0;
            state.last_success = Some(Instant::now());
            if !state.reachable {
                state.reachable = true;
                info!("서버 연결 복구됨 - 온라인 모드");
            }
        });
    }

    /// 도달 실패: 임계값에 닿으면 오프라인
    pub fn record_failure(&self) {
        let threshold = self.offline_threshold;
        self.transition(|state| {
            state.consecutive_failures += 1;
            debug!("연결 실패 기록 (연속 {}회)", state.consecutive_failures);
            if state.reachable && state.consecutive_failures >= threshold {
                state.reachable = false;
                warn!(
                    "연속 {}회 실패 - 오프라인 모드 전환 (변경 요청은 로컬 큐에 저장)",
                    state.consecutive_failures
                );
            }
        });
    }

    pub fn failure_count(&self) -> u64 {
        self.state.lock().consecutive_failures
    }

    /// 마지막 도달 성공 이후 경과 시간 (성공 기록이 없으면 None)
    pub fn since_last_success(&self) -> Option<Duration> {
        self.state.lock().last_success.map(|at| at.elapsed())
    }

    /// 상태 변경 후 유효 상태가 바뀌었으면 발행
    ///
    /// 발행 순서가 상태 변경 순서와 같도록 잠금을 쥔 채로 보낸다.
    fn transition<F>(&self, change: F)
    where
        F: FnOnce(&mut LinkState),
    {
        let mut state = self.state.lock();
        change(&mut state);
        let online = state.effective();
        self.online_tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    fn needs_probe(&self) -> bool {
        let state = self.state.lock();
        !state.reachable && !state.forced_offline
    }

    /// 헬스 체크 루프
    ///
    /// 오프라인인 동안 `health_path`를 주기적으로 GET하여 복구를 감지한다.
    /// 강제 오프라인 모드에서는 체크하지 않는다.
    pub async fn run_probe(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        health_path: String,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.needs_probe() {
                        continue;
                    }
                    match transport.get(&health_path).await {
                        Ok(_) => self.record_success(),
                        Err(e) if e.is_unreachable() => debug!("헬스 체크 실패: {e}"),
                        // 에러 응답이라도 서버에는 도달함
                        Err(e) => {
                            debug!("헬스 체크 에러 응답: {e}");
                            self.record_success();
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("헬스 체크 루프 종료");
                    break;
                }
            }
        }
    }
}

impl Default for ConnectivityManager {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ConnectivitySignal for ConnectivityManager {
    fn is_online(&self) -> bool {
        self.state.lock().effective()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    fn report_reachability(&self, reachable: bool) {
        if reachable {
            self.record_success();
        } else {
            self.record_failure();
        }
    }
}
