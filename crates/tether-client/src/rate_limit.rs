//! 로컬 레이트 거버너.
//!
//! 엔드포인트(메서드 + 정규화된 경로)별 슬라이딩 윈도우로 요청 수를 제한한다.
//! 한도 초과 시 설정에 따라 대기하거나 즉시 `Throttled`를 반환한다.
//! 대기자는 우선순위 높은 순, 같으면 도착 순으로 입장한다.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::config::{RateLimitConfig, RateLimitMode};
use tether_core::error::CoreError;
use tether_core::models::metric::EndpointKey;
use tether_core::models::request::{HttpMethod, RequestPriority};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 대기 순서 키: 우선순위 내림차순, 도착 순번 오름차순
type Ticket = (Reverse<RequestPriority>, u64);

/// 엔드포인트별 슬라이딩 윈도우
struct RateWindow {
    limit: usize,
    admissions: VecDeque<Instant>,
    waiters: BTreeSet<Ticket>,
    notify: Arc<Notify>,
}

impl RateWindow {
    fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1) as usize,
            admissions: VecDeque::new(),
            waiters: BTreeSet::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// 윈도우 밖으로 밀려난 입장 기록 제거
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.admissions.front() {
            if now.duration_since(*front) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_room(&self) -> bool {
        self.admissions.len() < self.limit
    }

    /// 가장 오래된 입장이 윈도우를 벗어나는 시각
    fn frees_at(&self, window: Duration) -> Option<Instant> {
        if self.has_room() {
            None
        } else {
            self.admissions.front().map(|t| *t + window)
        }
    }
}

/// 엔드포인트 사용률 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointUtilization {
    /// "GET /tasks/:id" 형태
    pub endpoint: String,
    /// 현재 윈도우 안의 입장 수
    pub in_window: usize,
    pub limit: usize,
    /// 대기 중인 호출 수
    pub waiting: usize,
    /// in_window / limit
    pub ratio: f64,
}

/// 대기 한 번의 판정 결과
enum Admission {
    Admitted,
    Wait(Option<Instant>),
}

/// 레이트 거버너
pub struct RateGovernor {
    config: RateLimitConfig,
    windows: Mutex<HashMap<EndpointKey, RateWindow>>,
    next_ticket: AtomicU64,
}

impl RateGovernor {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// 요청 입장 허가
    ///
    /// 윈도우에 자리가 있고 앞선 대기자가 없으면 즉시 반환한다.
    /// 대기 모드에서는 자리가 날 때까지 기다리며, `max_wait_ms`를 넘기면
    /// `Throttled`를 반환한다. 대기 중 future가 drop되면 대기열에서 빠진다.
    pub async fn limit_request(
        &self,
        endpoint: &str,
        method: HttpMethod,
        priority: RequestPriority,
    ) -> Result<(), CoreError> {
        let key = EndpointKey::new(method, endpoint);
        let window = self.config.window();

        let (ticket, notify) = {
            let mut windows = self.windows.lock();
            let w = windows
                .entry(key.clone())
                .or_insert_with(|| RateWindow::new(self.config.limit_for(&key.path)));
            let now = Instant::now();
            w.evict(now, window);

            if w.waiters.is_empty() && w.has_room() {
                w.admissions.push_back(now);
                return Ok(());
            }

            if self.config.mode == RateLimitMode::Reject {
                let retry_after_ms = w
                    .frees_at(window)
                    .map(|t| t.saturating_duration_since(now).as_millis() as u64)
                    .unwrap_or(0);
                debug!("레이트 리밋 거부: {key} ({retry_after_ms}ms 후 재시도)");
                return Err(CoreError::Throttled {
                    endpoint: key.to_string(),
                    retry_after_ms,
                });
            }

            let ticket = (
                Reverse(priority),
                self.next_ticket.fetch_add(1, Ordering::Relaxed),
            );
            w.waiters.insert(ticket);
            (ticket, w.notify.clone())
        };

        let _guard = WaiterGuard {
            governor: self,
            key: &key,
            ticket,
        };
        debug!("레이트 리밋 대기 시작: {key} ({priority:?})");

        let deadline = match self.config.max_wait_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let admission = self.try_admit(&key, ticket, window);
            let wake_at = match admission {
                Admission::Admitted => {
                    debug!("레이트 리밋 대기 종료: {key}");
                    return Ok(());
                }
                Admission::Wait(wake_at) => wake_at,
            };

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    let retry_after_ms = wake_at
                        .map(|t| t.saturating_duration_since(now).as_millis() as u64)
                        .unwrap_or(0);
                    warn!(
                        "레이트 리밋 최대 대기 초과: {key} ({}ms)",
                        self.config.max_wait_ms
                    );
                    return Err(CoreError::Throttled {
                        endpoint: key.to_string(),
                        retry_after_ms,
                    });
                }
            }

            let until = match (wake_at, deadline) {
                (Some(w), Some(d)) => Some(w.min(d)),
                (w, d) => w.or(d),
            };

            match until {
                Some(until) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// 대기열 맨 앞이고 자리가 있으면 입장
    fn try_admit(&self, key: &EndpointKey, ticket: Ticket, window: Duration) -> Admission {
        let mut windows = self.windows.lock();
        let Some(w) = windows.get_mut(key) else {
            return Admission::Wait(None);
        };
        let now = Instant::now();
        w.evict(now, window);

        if w.waiters.first() == Some(&ticket) && w.has_room() {
            w.waiters.remove(&ticket);
            w.admissions.push_back(now);
            // 다음 대기자가 자기 차례인지 다시 확인하도록
            w.notify.notify_waiters();
            return Admission::Admitted;
        }
        Admission::Wait(w.frees_at(window))
    }

    /// 대기열에서 티켓 제거 (취소/타임아웃)
    fn withdraw(&self, key: &EndpointKey, ticket: Ticket) {
        let mut windows = self.windows.lock();
        if let Some(w) = windows.get_mut(key) {
            if w.waiters.remove(&ticket) {
                w.notify.notify_waiters();
            }
        }
    }

    /// 엔드포인트별 사용률 (키 순)
    pub fn utilization(&self) -> Vec<EndpointUtilization> {
        let window = self.config.window();
        let now = Instant::now();
        let mut windows = self.windows.lock();

        let mut entries: Vec<(&EndpointKey, &mut RateWindow)> = windows.iter_mut().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(key, w)| {
                w.evict(now, window);
                EndpointUtilization {
                    endpoint: key.to_string(),
                    in_window: w.admissions.len(),
                    limit: w.limit,
                    waiting: w.waiters.len(),
                    ratio: w.admissions.len() as f64 / w.limit as f64,
                }
            })
            .collect()
    }

    /// 거버너 전체가 제한 상태인지: 가득 찼거나 대기자가 있는 윈도우가 하나라도 있으면 `true`
    pub fn is_throttled(&self) -> bool {
        let window = self.config.window();
        let now = Instant::now();
        self.windows.lock().values_mut().any(|w| {
            w.evict(now, window);
            !w.waiters.is_empty() || !w.has_room()
        })
    }

    /// 이 엔드포인트를 지금 호출하면 대기/거부되는지
    pub fn is_endpoint_throttled(&self, endpoint: &str, method: HttpMethod) -> bool {
        let key = EndpointKey::new(method, endpoint);
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(&key) {
            Some(w) => {
                w.evict(now, self.config.window());
                !w.waiters.is_empty() || !w.has_room()
            }
            None => false,
        }
    }

    /// 대기자가 없는 윈도우 기록 초기화
    pub fn reset(&self) {
        self.windows.lock().retain(|_, w| !w.waiters.is_empty());
    }
}

/// 대기 future가 어떤 경로로 끝나든 티켓을 회수
struct WaiterGuard<'a> {
    governor: &'a RateGovernor,
    key: &'a EndpointKey,
    ticket: Ticket,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.governor.withdraw(self.key, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(limit: u32, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            window_ms,
            default_limit: limit,
            endpoint_limits: BTreeMap::new(),
            mode: RateLimitMode::Wait,
            max_wait_ms: 0,
        }
    }

    fn waiting(gov: &RateGovernor) -> usize {
        gov.utilization().iter().map(|u| u.waiting).sum()
    }

    #[tokio::test(start_paused = true)]
    async fn call_over_limit_waits_for_window() {
        let gov = RateGovernor::new(config(2, 1_000));
        let start = Instant::now();

        for _ in 0..2 {
            gov.limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
                .await
                .unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(gov.is_endpoint_throttled("/tasks", HttpMethod::Get));

        gov.limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn windows_are_per_endpoint_key() {
        let gov = RateGovernor::new(config(1, 1_000));
        let start = Instant::now();

        gov.limit_request("/tasks/1", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();
        // 다른 메서드, 다른 경로는 별도 윈도우
        gov.limit_request("/tasks/1", HttpMethod::Patch, RequestPriority::Entity)
            .await
            .unwrap();
        gov.limit_request("/projects", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        // `/tasks/2`는 `/tasks/:id`로 정규화되어 같은 윈도우
        assert!(gov.is_endpoint_throttled("/tasks/2", HttpMethod::Get));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_throttle_tracks_any_full_window() {
        let gov = RateGovernor::new(config(1, 1_000));
        assert!(!gov.is_throttled());

        gov.limit_request("/projects", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();
        assert!(gov.is_throttled());
        assert!(!gov.is_endpoint_throttled("/users", HttpMethod::Get));

        // 윈도우가 지나면 다시 여유
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!gov.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn reject_mode_reports_retry_after() {
        let mut cfg = config(1, 1_000);
        cfg.mode = RateLimitMode::Reject;
        let gov = RateGovernor::new(cfg);

        gov.limit_request("/sync", HttpMethod::Post, RequestPriority::Background)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;

        let err = gov
            .limit_request("/sync", HttpMethod::Post, RequestPriority::Background)
            .await
            .unwrap_err();
        match err {
            CoreError::Throttled {
                endpoint,
                retry_after_ms,
            } => {
                assert_eq!(endpoint, "POST /sync");
                assert_eq!(retry_after_ms, 600);
            }
            other => panic!("예상치 못한 에러: {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(gov
            .limit_request("/sync", HttpMethod::Post, RequestPriority::Background)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_limit_applies_to_normalized_path() {
        let mut cfg = config(10, 1_000);
        cfg.mode = RateLimitMode::Reject;
        cfg.endpoint_limits.insert("/auth".to_string(), 1);
        let gov = RateGovernor::new(cfg);

        gov.limit_request("/auth/tokens", HttpMethod::Post, RequestPriority::Auth)
            .await
            .unwrap();
        assert!(gov
            .limit_request("/auth/tokens", HttpMethod::Post, RequestPriority::Auth)
            .await
            .is_err());

        let util = gov.utilization();
        assert_eq!(util[0].limit, 1);
        assert_eq!(util[0].ratio, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_waiter_goes_first() {
        let gov = Arc::new(RateGovernor::new(config(1, 1_000)));
        let order = Arc::new(Mutex::new(Vec::new()));

        gov.limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();

        let spawn_waiter = |priority: RequestPriority| {
            let gov = gov.clone();
            let order = order.clone();
            tokio::spawn(async move {
                gov.limit_request("/tasks", HttpMethod::Get, priority)
                    .await
                    .unwrap();
                order.lock().push((priority, Instant::now()));
            })
        };

        let start = Instant::now();
        let background = spawn_waiter(RequestPriority::Background);
        while waiting(&gov) < 1 {
            tokio::task::yield_now().await;
        }
        let auth = spawn_waiter(RequestPriority::Auth);
        while waiting(&gov) < 2 {
            tokio::task::yield_now().await;
        }

        auth.await.unwrap();
        background.await.unwrap();

        let order = order.lock().clone();
        assert_eq!(order[0].0, RequestPriority::Auth);
        assert_eq!(order[1].0, RequestPriority::Background);
        assert!(order[0].1 - start >= Duration::from_millis(1_000));
        assert!(order[1].1 - start >= Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_queue() {
        let gov = Arc::new(RateGovernor::new(config(1, 1_000)));
        gov.limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();

        let g = gov.clone();
        let handle = tokio::spawn(async move {
            g.limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
                .await
        });
        while waiting(&gov) < 1 {
            tokio::task::yield_now().await;
        }

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(waiting(&gov), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_returns_throttled() {
        let mut cfg = config(1, 1_000);
        cfg.max_wait_ms = 500;
        let gov = RateGovernor::new(cfg);
        let start = Instant::now();

        gov.limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap();
        let err = gov
            .limit_request("/tasks", HttpMethod::Get, RequestPriority::Entity)
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Throttled { retry_after_ms: 500, .. }));
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(waiting(&gov), 0);
    }
}
