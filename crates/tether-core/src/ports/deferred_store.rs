//! 지연 요청 저장소 포트.
//!
//! 구현: `tether-storage` crate (rusqlite)

use async_trait::async_trait;

use crate::error::CoreError;
use crate::models::deferred::{DeferredRequest, DeferredStatus};

/// 오프라인 지연 요청의 내구성 저장소
///
/// `add`가 `Ok`를 반환하면 재시작 후에도 요청이 남아 있어야 한다.
#[async_trait]
pub trait DeferredStore: Send + Sync {
    /// 새 요청 저장
    async fn add(&self, request: &DeferredRequest) -> Result<(), CoreError>;

    /// 상태/재시도 정보 갱신 (id 기준)
    async fn update(&self, request: &DeferredRequest) -> Result<(), CoreError>;

    /// 요청 삭제 (없으면 `false`)
    async fn delete(&self, id: &str) -> Result<bool, CoreError>;

    /// 단건 조회
    async fn get(&self, id: &str) -> Result<Option<DeferredRequest>, CoreError>;

    /// 상태별 조회: 우선순위 높은 순, 같으면 제출 순번 순
    async fn list_by_status(
        &self,
        status: DeferredStatus,
    ) -> Result<Vec<DeferredRequest>, CoreError>;

    /// 상태별 개수
    async fn count_by_status(&self, status: DeferredStatus) -> Result<usize, CoreError> {
        Ok(self.list_by_status(status).await?.len())
    }

    /// 저장된 요청 중 가장 큰 제출 순번 (비어 있으면 0)
    async fn max_sequence(&self) -> Result<i64, CoreError> {
        let mut max = 0;
        for status in [DeferredStatus::Pending, DeferredStatus::Failed] {
            for request in self.list_by_status(status).await? {
                max = max.max(request.sequence);
            }
        }
        Ok(max)
    }
}
