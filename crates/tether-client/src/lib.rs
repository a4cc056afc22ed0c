//! # tether-client
//!
//! 요청 오케스트레이션 레이어.
//! 애플리케이션의 모든 API 호출이 거치는 단일 경로를 제공한다.
//!
//! ## 모듈
//!
//! - [`metrics`]: 엔드포인트별 응답 시간/성공률 집계, 성능 점수
//! - [`rate_limit`]: 엔드포인트별 슬라이딩 윈도우 레이트 거버너
//! - [`offline_queue`]: 내구성 지연 쓰기 큐 (오프라인 변경 요청 재전송)
//! - [`dispatcher`]: 요청 디스패처 (`ApiResult` 봉투 정규화)
//! - [`realtime`]: 실시간 채널 (재연결, keepalive, 이벤트 구독)
//! - [`observer`]: 관찰자 레지스트리와 `Subscription`
//! - [`context`]: 구성 요소 조립 (`AppContext`)

pub mod context;
pub mod dispatcher;
pub mod metrics;
pub mod observer;
pub mod offline_queue;
pub mod rate_limit;
pub mod realtime;

pub use context::{AppContext, AppContextBuilder};
pub use dispatcher::RequestDispatcher;
pub use observer::Subscription;
