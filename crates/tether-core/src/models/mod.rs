//! 도메인 모델.

pub mod deferred;
pub mod envelope;
pub mod metric;
pub mod realtime;
pub mod request;
