//! 실시간 채널 모델.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 채널 연결 상태
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// 서버 푸시 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// 이벤트 타입 (예: "task.updated")
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// `<entity>.<action>` 형식에서 엔티티 부분
    pub fn entity(&self) -> Option<&str> {
        self.event_type.split_once('.').map(|(entity, _)| entity)
    }

    /// `<entity>.<action>` 형식에서 동작 부분
    pub fn action(&self) -> Option<&str> {
        self.event_type.split_once('.').map(|(_, action)| action)
    }
}

/// 채널 운영 알림 (상태 전이와 별도)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// 재연결 예약됨
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// 재연결 시도 소진: 수동 조치 필요
    ReconnectExhausted { attempts: u32 },
}
