//! 캐시 프로젝션 포트.
//!
//! 구현: `tether-app::cache::QueryCache`

use crate::models::realtime::RealtimeEvent;

/// 실시간 이벤트를 로컬 쿼리 캐시에 반영하는 소비자
///
/// 채널의 이벤트 디스패치 경로에서 동기적으로 호출되므로 블로킹 I/O를 하지 않는다.
pub trait CacheProjection: Send + Sync {
    fn apply(&self, event: &RealtimeEvent);
}
