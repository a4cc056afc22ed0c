//! 쿼리 캐시 프로젝션.
//!
//! 실시간 이벤트(`<entity>.<action>`)를 로컬 LRU 캐시에 반영한다.
//! - `created` / `updated`: 이벤트 데이터를 캐시 항목에 병합
//! - `deleted` / `invalidated`: 해당 엔티티 키 제거 (id가 없으면 엔티티 전체)

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use tether_core::models::realtime::RealtimeEvent;
use tether_core::ports::cache_projection::CacheProjection;
use tracing::debug;

/// 캐시 키: (엔티티 타입, 엔티티 id)
type CacheKey = (String, String);

/// LRU 쿼리 캐시
pub struct QueryCache {
    entries: Mutex<LruCache<CacheKey, Value>>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 캐시 조회 (최근 사용으로 갱신)
    pub fn get(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        self.entries
            .lock()
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
    }

    /// 서버 응답으로 항목 저장
    pub fn put(&self, entity_type: &str, entity_id: &str, value: Value) {
        self.entries
            .lock()
            .put((entity_type.to_string(), entity_id.to_string()), value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn merge(&self, key: CacheKey, data: &Value) {
        let mut entries = self.entries.lock();
        match (entries.get_mut(&key), data) {
            (Some(Value::Object(existing)), Value::Object(patch)) => {
                for (field, value) in patch {
                    existing.insert(field.clone(), value.clone());
                }
            }
            _ => {
                entries.put(key, data.clone());
            }
        }
    }

    fn evict(&self, entity_type: &str, entity_id: Option<&str>) -> usize {
        let mut entries = self.entries.lock();
        match entity_id {
            Some(id) => entries
                .pop(&(entity_type.to_string(), id.to_string()))
                .map_or(0, |_| 1),
            None => {
                let keys: Vec<CacheKey> = entries
                    .iter()
                    .filter(|((kind, _), _)| kind == entity_type)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &keys {
                    entries.pop(key);
                }
                keys.len()
            }
        }
    }
}

/// 이벤트 데이터의 엔티티 id (문자열 또는 숫자)
fn entity_id(data: &Value) -> Option<String> {
    match data.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

impl CacheProjection for QueryCache {
    fn apply(&self, event: &RealtimeEvent) {
        let (Some(entity), Some(action)) = (event.entity(), event.action()) else {
            return;
        };
        let id = entity_id(&event.data);

        match action {
            "created" | "updated" => {
                if let Some(id) = id {
                    self.merge((entity.to_string(), id), &event.data);
                }
            }
            "deleted" | "invalidated" => {
                let evicted = self.evict(entity, id.as_deref());
                debug!("캐시 무효화: {} ({}개)", event.event_type, evicted);
            }
            _ => {}
        }
    }
}
