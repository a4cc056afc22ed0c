//! 로그 기반 알림.
//!
//! 사용자 알림을 tracing 이벤트로 출력한다. 헤드리스 실행 환경의 기본 구현.

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::error::CoreError;
use tether_core::ports::notifier::Notifier;
use tracing::{error, info};

/// 알림 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// tracing 알림 구현
///
/// 최근 알림을 제한된 개수만큼 보관해서 종료 시 요약에 사용한다.
pub struct LogNotifier {
    history: Mutex<Vec<(NoticeLevel, String)>>,
    history_limit: usize,
}

impl LogNotifier {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            history_limit,
        }
    }

    /// 보관 중인 알림 (오래된 순)
    pub fn history(&self) -> Vec<(NoticeLevel, String)> {
        self.history.lock().clone()
    }

    fn remember(&self, level: NoticeLevel, title: &str) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() >= self.history_limit {
            history.remove(0);
        }
        history.push((level, title.to_string()));
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_info(&self, title: &str, body: &str) -> Result<(), CoreError> {
        info!(target: "tether::notice", "[안내] {title}: {body}");
        self.remember(NoticeLevel::Info, title);
        Ok(())
    }

    async fn notify_success(&self, title: &str, body: &str) -> Result<(), CoreError> {
        info!(target: "tether::notice", "[성공] {title}: {body}");
        self.remember(NoticeLevel::Success, title);
        Ok(())
    }

    async fn notify_error(&self, title: &str, body: &str) -> Result<(), CoreError> {
        error!(target: "tether::notice", "[오류] {title}: {body}");
        self.remember(NoticeLevel::Error, title);
        Ok(())
    }
}
