//! 사용자 알림 포트.
//!
//! 구현: `tether-app::notifier::LogNotifier`

use async_trait::async_trait;

use crate::error::CoreError;

/// 사용자 대상 알림 인터페이스
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 안내 알림 (오프라인 저장 등)
    async fn notify_info(&self, title: &str, body: &str) -> Result<(), CoreError>;

    /// 성공 알림
    async fn notify_success(&self, title: &str, body: &str) -> Result<(), CoreError>;

    /// 에러 알림
    async fn notify_error(&self, title: &str, body: &str) -> Result<(), CoreError>;
}
