//! 연결 상태 신호 포트.
//!
//! 구현: `tether-network::connectivity::ConnectivityManager`

use tokio::sync::watch;

/// 온라인/오프라인 상태 공급원
pub trait ConnectivitySignal: Send + Sync {
    /// 현재 온라인 여부
    fn is_online(&self) -> bool;

    /// 상태 변경 구독 (`true` = 온라인)
    fn subscribe(&self) -> watch::Receiver<bool>;

    /// 서버 도달 여부 보고 (요청 결과 기반 감지)
    fn report_reachability(&self, _reachable: bool) {}
}
