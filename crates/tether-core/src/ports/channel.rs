//! 실시간 채널 포트.
//!
//! 구현: `tether-network::ws_client::WsConnector` (tokio-tungstenite)

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::CoreError;

/// 수신 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// 텍스트 메시지
    Text(String),
    /// 연결 종료 (`clean` = 정상 종료 핸드셰이크)
    Closed { clean: bool },
    /// 전송 계층 에러 (이후 스트림 종료)
    Error(String),
}

/// 송신 핸들
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// 텍스트 메시지 전송
    async fn send_text(&self, text: String) -> Result<(), CoreError>;

    /// 정상 종료 요청
    async fn close(&self) -> Result<(), CoreError>;
}

/// 핸드셰이크 완료된 연결
pub struct ChannelConnection {
    pub sender: Arc<dyn ChannelSender>,
    /// 수신 프레임 스트림 (연결 종료 시 `Closed`/`Error` 후 닫힘)
    pub inbound: mpsc::Receiver<ChannelFrame>,
}

/// 채널 연결 수립
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// 핸드셰이크 수행
    async fn connect(&self) -> Result<ChannelConnection, CoreError>;
}
