//! # tether-network
//!
//! 네트워크 어댑터.
//! REST 전송(`Transport`), WebSocket 채널(`ChannelConnector`),
//! 연결 상태 감지(`ConnectivitySignal`), JWT 토큰 관리(`TokenSupplier`)를 구현한다.
//!
//! ## 사용 예시
//!
//! ```rust,ignore
//! use tether_network::http_transport::HttpTransport;
//! use tether_network::ws_client::WsConnector;
//!
//! let transport = HttpTransport::new("http://localhost:8000", timeout)?;
//! let connector = WsConnector::new("http://localhost:8000", "/ws");
//! ```

pub mod auth;
pub mod connectivity;
pub mod http_transport;
pub mod ws_client;
