//! 애플리케이션 설정 구조체.
//!
//! 서버 주소, 기능 토글, 재시도/레이트 리밋/메트릭/실시간 채널 파라미터를 정의한다.
//! `ConfigManager`를 통해 JSON 파일에서 로드하고, CLI 인자로 일부를 덮어쓴다.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// 최상위 애플리케이션 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 서버 연결 설정
    pub server: ServerConfig,
    /// 기능 토글 (서로 독립)
    #[serde(default)]
    pub features: FeatureFlags,
    /// 오프라인 큐 재시도 설정
    #[serde(default)]
    pub retry: RetryConfig,
    /// 로컬 레이트 리밋 설정
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 성능 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// 실시간 채널 설정
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// 알림 설정
    #[serde(default)]
    pub notification: NotificationConfig,
    /// 연결 상태 감지 설정
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    /// 로컬 저장소 설정
    #[serde(default)]
    pub storage: StorageConfig,
}

// ============================================================
// 서버 설정
// ============================================================

/// 서버 연결 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// API 서버 기본 URL (예: "https://api.example.com")
    pub base_url: String,
    /// 요청 타임아웃 (밀리초)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 실시간 채널 경로
    #[serde(default = "default_realtime_path")]
    pub realtime_path: String,
    /// 연결 복구 감지용 헬스 체크 경로
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

// ============================================================
// 기능 토글
// ============================================================

/// 기능 토글: 각 항목은 독립적으로 켜고 끈다
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// 요청별 성능 메트릭 수집
    #[serde(default = "default_true")]
    pub enable_performance_monitoring: bool,
    /// 로컬 레이트 리밋
    #[serde(default = "default_true")]
    pub enable_rate_limiting: bool,
    /// 오프라인 시 변경 요청을 큐에 저장
    #[serde(default = "default_true")]
    pub enable_offline_support: bool,
    /// 실시간 채널 연결
    #[serde(default = "default_true")]
    pub enable_real_time_sync: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_performance_monitoring: true,
            enable_rate_limiting: true,
            enable_offline_support: true,
            enable_real_time_sync: true,
        }
    }
}

// ============================================================
// 재시도 설정
// ============================================================

/// 오프라인 큐 재시도 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 최대 재시도 횟수 (이 횟수만큼 실패하면 FAILED)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 백오프 기본 지연 (밀리초)
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 백오프 최대 지연 (밀리초)
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 온라인 상태에서의 주기적 큐 처리 간격 (밀리초)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RetryConfig {
    /// 주기적 처리 간격을 Duration으로 반환
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ============================================================
// 레이트 리밋 설정
// ============================================================

/// 한도 초과 시 동작
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// 윈도우에 자리가 날 때까지 호출자를 대기시킴
    #[default]
    Wait,
    /// 즉시 `Throttled` 에러 반환
    Reject,
}

/// 로컬 레이트 리밋 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 슬라이딩 윈도우 길이 (밀리초)
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    /// 엔드포인트당 기본 허용 요청 수
    #[serde(default = "default_rate_limit")]
    pub default_limit: u32,
    /// 경로 접두사별 한도 (가장 긴 접두사가 우선)
    #[serde(default)]
    pub endpoint_limits: BTreeMap<String, u32>,
    /// 한도 초과 시 동작
    #[serde(default)]
    pub mode: RateLimitMode,
    /// 대기 모드의 최대 대기 시간 (밀리초, 0이면 무제한)
    #[serde(default = "default_rate_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            default_limit: default_rate_limit(),
            endpoint_limits: BTreeMap::new(),
            mode: RateLimitMode::Wait,
            max_wait_ms: default_rate_max_wait_ms(),
        }
    }
}

impl RateLimitConfig {
    /// 윈도우 길이를 Duration으로 반환
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// 경로에 적용할 한도 (가장 긴 접두사 일치)
    pub fn limit_for(&self, path: &str) -> u32 {
        self.endpoint_limits
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, limit)| *limit)
            .unwrap_or(self.default_limit)
    }
}

// ============================================================
// 메트릭 설정
// ============================================================

/// 성능 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// 느린 요청 임계값 (밀리초)
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// 매우 느린 요청 임계값 (밀리초)
    #[serde(default = "default_very_slow_threshold_ms")]
    pub very_slow_threshold_ms: u64,
    /// 타임아웃으로 간주하는 임계값 (밀리초)
    #[serde(default = "default_timeout_threshold_ms")]
    pub timeout_threshold_ms: u64,
    /// 최근 메트릭 버퍼 용량
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// 메트릭 보존 시간 (시간)
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,
    /// p95 계산용 엔드포인트별 샘플 수
    #[serde(default = "default_max_samples")]
    pub max_samples_per_endpoint: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: default_slow_threshold_ms(),
            very_slow_threshold_ms: default_very_slow_threshold_ms(),
            timeout_threshold_ms: default_timeout_threshold_ms(),
            buffer_capacity: default_buffer_capacity(),
            retention_hours: default_retention_hours(),
            max_samples_per_endpoint: default_max_samples(),
        }
    }
}

// ============================================================
// 실시간 채널 설정
// ============================================================

/// 실시간 채널 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// 재연결 기본 지연 (밀리초): `base * 1.5^attempt`
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    /// 재연결 최대 지연 (밀리초)
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    /// 최대 재연결 시도 횟수
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    /// keepalive ping 간격 (밀리초)
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            max_attempts: default_reconnect_attempts(),
            keepalive_interval_ms: default_keepalive_ms(),
        }
    }
}

impl RealtimeConfig {
    /// n번째(0부터) 재연결 지연
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1.5_f64.powi(attempt.min(64) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// keepalive 간격을 Duration으로 반환
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

// ============================================================
// 알림 설정
// ============================================================

/// 알림 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// 요청 실패 알림
    #[serde(default = "default_true")]
    pub show_error_notifications: bool,
    /// 요청 성공 알림 (요청 옵션으로 명시한 경우만)
    #[serde(default)]
    pub show_success_notifications: bool,
    /// 오프라인 큐 저장 확인 알림
    #[serde(default = "default_true")]
    pub show_offline_notifications: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            show_error_notifications: true,
            show_success_notifications: false,
            show_offline_notifications: true,
        }
    }
}

// ============================================================
// 연결 상태 / 저장소 설정
// ============================================================

/// 연결 상태 감지 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    /// 오프라인 전환 임계값 (연속 실패 횟수)
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u64,
    /// 오프라인 상태에서 헬스 체크 간격 (밀리초)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            offline_threshold: default_offline_threshold(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

/// 로컬 저장소 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite DB 파일 경로 (None이면 플랫폼 기본 경로)
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

// ============================================================
// AppConfig impl
// ============================================================

impl AppConfig {
    /// 기본 설정값 반환
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig {
                base_url: "http://localhost:8000".to_string(),
                request_timeout_ms: default_request_timeout_ms(),
                realtime_path: default_realtime_path(),
                health_path: default_health_path(),
            },
            features: FeatureFlags::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            metrics: MetricsConfig::default(),
            realtime: RealtimeConfig::default(),
            notification: NotificationConfig::default(),
            connectivity: ConnectivityConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// 서버 요청 타임아웃을 Duration으로 반환
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    /// 헬스 체크 간격을 Duration으로 반환
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity.probe_interval_ms)
    }

    /// 설정값 검증
    ///
    /// 주기 루프가 0 간격으로 돌거나 URL 조합이 깨지는 값을 거부한다.
    pub fn validate(&self) -> Result<(), CoreError> {
        let base_url = &self.server.base_url;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(CoreError::Config(format!(
                "server.base_url은 http(s):// 로 시작해야 합니다: {base_url}"
            )));
        }
        for (name, path) in [
            ("server.realtime_path", &self.server.realtime_path),
            ("server.health_path", &self.server.health_path),
        ] {
            if !path.starts_with('/') {
                return Err(CoreError::Config(format!(
                    "{name}은 '/'로 시작해야 합니다: {path}"
                )));
            }
        }

        let positive = [
            ("rate_limit.window_ms", self.rate_limit.window_ms),
            ("rate_limit.default_limit", u64::from(self.rate_limit.default_limit)),
            ("metrics.buffer_capacity", self.metrics.buffer_capacity as u64),
            (
                "metrics.max_samples_per_endpoint",
                self.metrics.max_samples_per_endpoint as u64,
            ),
            ("realtime.keepalive_interval_ms", self.realtime.keepalive_interval_ms),
            ("connectivity.probe_interval_ms", self.connectivity.probe_interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(CoreError::Config(format!("{name}은 0보다 커야 합니다")));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(CoreError::Config(
                "retry.base_delay_ms가 retry.max_delay_ms보다 큽니다".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================
// 기본값 함수
// ============================================================

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_realtime_path() -> String {
    "/ws".to_string()
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_sweep_interval_ms() -> u64 {
    30_000
}
fn default_rate_window_ms() -> u64 {
    60_000
}
fn default_rate_limit() -> u32 {
    60
}
fn default_rate_max_wait_ms() -> u64 {
    30_000
}
fn default_slow_threshold_ms() -> u64 {
    1_000
}
fn default_very_slow_threshold_ms() -> u64 {
    3_000
}
fn default_timeout_threshold_ms() -> u64 {
    10_000
}
fn default_buffer_capacity() -> usize {
    1_000
}
fn default_retention_hours() -> u32 {
    24
}
fn default_max_samples() -> usize {
    100
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_keepalive_ms() -> u64 {
    30_000
}
fn default_offline_threshold() -> u64 {
    3
}
fn default_probe_interval_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let json = r#"{"server":{"base_url":"http://api.test"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.request_timeout_ms, 30_000);
        assert!(config.features.enable_offline_support);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.rate_limit.mode, RateLimitMode::Wait);
        assert!(config.notification.show_error_notifications);
    }

    #[test]
    fn longest_prefix_limit_wins() {
        let mut config = RateLimitConfig::default();
        config.endpoint_limits.insert("/auth".to_string(), 5);
        config.endpoint_limits.insert("/auth/tokens".to_string(), 2);

        assert_eq!(config.limit_for("/auth/tokens"), 2);
        assert_eq!(config.limit_for("/auth/session"), 5);
        assert_eq!(config.limit_for("/tasks"), 60);
    }

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let config = RealtimeConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 3_000,
            max_attempts: 5,
            keepalive_interval_ms: 30_000,
        };
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(1_500));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(2_250));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(3_000));
        assert_eq!(config.reconnect_delay(10), Duration::from_millis(3_000));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let mut config = AppConfig::default_config();
        config.server.base_url = "localhost:8000".to_string();
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = AppConfig::default_config();
        config.realtime.keepalive_interval_ms = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = AppConfig::default_config();
        config.server.health_path = "health".to_string();
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = AppConfig::default_config();
        config.retry.base_delay_ms = 60_000;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn mode_serde_snake_case() {
        let mode: RateLimitMode = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(mode, RateLimitMode::Reject);
    }
}
