//! # tether-app
//!
//! 바이너리에서 조립하는 앱 레벨 어댑터와 백그라운드 루프.
//!
//! - [`cache`]: 실시간 이벤트를 반영하는 LRU 쿼리 캐시
//! - [`notifier`]: tracing 기반 사용자 알림
//! - [`scheduler`]: 헬스 체크 / 상태 보고 루프
//! - [`lifecycle`]: 종료 신호와 OS 시그널 처리

pub mod cache;
pub mod lifecycle;
pub mod notifier;
pub mod scheduler;
