//! 관찰자 레지스트리.
//!
//! 핸들러 등록 시 `Subscription`을 돌려주고, `unsubscribe()`로 해제한다.
//! 통지는 잠금을 풀고 난 뒤 등록 순서대로 동기 실행되며,
//! 패닉한 핸들러는 로그만 남기고 나머지 핸들러 실행을 계속한다.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// 관찰자 레지스트리
pub struct ObserverRegistry<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// 핸들러 등록
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.inner.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            dispose: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().handlers.retain(|(hid, _)| *hid != id);
                }
            })),
        }
    }

    /// 등록된 모든 핸들러에 통지
    pub fn notify(&self, value: &T) {
        let handlers: Vec<Handler<T>> = {
            let registry = self.inner.lock();
            registry.handlers.iter().map(|(_, h)| h.clone()).collect()
        };

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(value))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "알 수 없는 패닉".to_string());
                error!("관찰자 핸들러 패닉: {reason}");
            }
        }
    }

    /// 등록된 핸들러 수
    pub fn len(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 구독 해제 핸들
///
/// drop해도 구독은 유지된다. 해제하려면 `unsubscribe()`를 호출한다.
#[must_use = "구독을 해제하려면 unsubscribe()를 호출해야 합니다"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// 구독 해제
    pub fn unsubscribe(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}
