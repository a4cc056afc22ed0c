//! # tether-storage
//!
//! 로컬 저장소 어댑터.
//! SQLite 기반 오프라인 지연 요청 저장소와 스키마 마이그레이션을 관리한다.
//!
//! ## 모듈
//! - `sqlite`: 지연 요청 저장소 (DeferredStore 구현)
//! - `migration`: 스키마 마이그레이션

pub mod migration;
pub mod sqlite;
