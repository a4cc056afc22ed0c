//! 포트 인터페이스 (trait).
//!
//! Hexagonal Architecture의 포트 레이어.
//! 어댑터 crate(`tether-network`, `tether-storage`, `tether-app`)가 이 trait들을 구현하고,
//! `tether-client`의 서비스들은 `Arc<dyn T>`로만 의존한다.
//!
//! async trait은 `async_trait` 매크로로 object safety를 보장한다.

pub mod cache_projection;
pub mod channel;
pub mod connectivity;
pub mod deferred_store;
pub mod notifier;
pub mod transport;
