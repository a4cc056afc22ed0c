//! JWT 세션 관리.
//!
//! `POST /auth/tokens`로 로그인하고, 만료가 임박하면 `POST /auth/tokens/refresh`로 갱신한다.
//! `TokenSupplier` 포트 구현으로 REST 전송과 WebSocket 커넥터에 주입된다.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tether_core::error::CoreError;
use tether_core::ports::transport::TokenSupplier;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 서버가 만료 시간을 알려주지 않을 때의 수명 (초)
const DEFAULT_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct Session {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl Session {
    fn from_grant(grant: TokenGrant, previous_refresh: Option<String>) -> Self {
        let lifetime = grant.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS);
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            expires_at: Utc::now() + Duration::seconds(lifetime),
        }
    }

    fn expires_within(&self, margin: Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }
}

/// 토큰 매니저
///
/// 복제본은 같은 세션을 공유한다. 동시 갱신 요청은 하나로 합쳐진다.
#[derive(Clone)]
pub struct TokenManager {
    base_url: String,
    client: reqwest::Client,
    session: Arc<RwLock<Option<Session>>>,
    refresh_gate: Arc<Mutex<()>>,
    refresh_margin: Duration,
}

impl TokenManager {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            session: Arc::new(RwLock::new(None)),
            refresh_gate: Arc::new(Mutex::new(())),
            refresh_margin: Duration::minutes(5),
        }
    }

    /// 만료 몇 초 전부터 갱신할지
    pub fn with_refresh_margin(mut self, margin: std::time::Duration) -> Self {
        self.refresh_margin = Duration::from_std(margin).unwrap_or(self.refresh_margin);
        self
    }

    /// 자격 증명으로 세션 시작
    pub async fn login(&self, identifier: &str, password: &str) -> Result<(), CoreError> {
        let grant = self
            .exchange(
                "/auth/tokens",
                json!({ "identifier": identifier, "password": password }),
                "로그인",
            )
            .await?;
        let session = Session::from_grant(grant, None);
        debug!("로그인 성공, 만료: {}", session.expires_at);
        *self.session.write() = Some(session);
        Ok(())
    }

    /// 리프레시 토큰으로 세션 연장
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let refresh_token = {
            let session = self.session.read();
            let session = session
                .as_ref()
                .ok_or_else(|| CoreError::Auth("인증되지 않음".to_string()))?;
            session
                .refresh_token
                .clone()
                .ok_or_else(|| CoreError::Auth("리프레시 토큰 없음".to_string()))?
        };

        let grant = self
            .exchange(
                "/auth/tokens/refresh",
                json!({ "refresh_token": refresh_token }),
                "토큰 갱신",
            )
            .await?;
        let session = Session::from_grant(grant, Some(refresh_token));
        debug!("토큰 갱신 성공, 만료: {}", session.expires_at);
        *self.session.write() = Some(session);
        Ok(())
    }

    /// 로컬 세션 제거
    pub fn logout(&self) {
        *self.session.write() = None;
        debug!("로그아웃");
    }

    pub fn is_authenticated(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .is_some_and(|s| Utc::now() < s.expires_at)
    }

    async fn exchange(
        &self,
        path: &str,
        body: serde_json::Value,
        action: &str,
    ) -> Result<TokenGrant, CoreError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("{action} 요청 실패: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::Auth(format!("{action} 실패 ({status}): {text}")));
        }

        resp.json()
            .await
            .map_err(|e| CoreError::Auth(format!("{action} 응답 파싱 실패: {e}")))
    }

    fn current(&self) -> Option<Session> {
        self.session.read().clone()
    }
}

#[async_trait]
impl TokenSupplier for TokenManager {
    async fn get_token(&self) -> Result<String, CoreError> {
        let session = self
            .current()
            .ok_or_else(|| CoreError::Auth("인증되지 않음".to_string()))?;
        if !session.expires_within(self.refresh_margin) {
            return Ok(session.access_token);
        }

        let _gate = self.refresh_gate.lock().await;
        // 대기하는 동안 다른 호출이 이미 갱신했을 수 있음
        if let Some(fresh) = self.current() {
            if !fresh.expires_within(self.refresh_margin) {
                return Ok(fresh.access_token);
            }
        }
        if let Err(e) = self.refresh().await {
            warn!("자동 토큰 갱신 실패: {e}");
        }

        self.current()
            .map(|s| s.access_token)
            .ok_or_else(|| CoreError::Auth("인증되지 않음".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant_body(access: &str, refresh: Option<&str>, expires_in: i64) -> String {
        json!({
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": expires_in,
        })
        .to_string()
    }

    #[tokio::test]
    async fn unauthenticated_supplier_is_auth_error() {
        let tm = TokenManager::new("http://localhost:8000/");
        assert_eq!(tm.base_url, "http://localhost:8000");
        assert!(matches!(tm.get_token().await, Err(CoreError::Auth(_))));
        assert!(!tm.is_authenticated());
    }

    #[tokio::test]
    async fn login_supplies_token_until_logout() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/tokens")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"identifier":"dev@tether.test"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(grant_body("jwt_abc", Some("ref_xyz"), 3600))
            .create_async()
            .await;

        let tm = TokenManager::new(&server.url());
        tm.login("dev@tether.test", "pw").await.unwrap();
        assert!(tm.is_authenticated());
        assert_eq!(tm.get_token().await.unwrap(), "jwt_abc");
        mock.assert_async().await;

        tm.logout();
        assert!(!tm.is_authenticated());
    }

    #[tokio::test]
    async fn rejected_login_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/auth/tokens")
            .with_status(401)
            .with_body("Unauthorized")
            .create_async()
            .await;

        let tm = TokenManager::new(&server.url());
        let err = tm.login("dev@tether.test", "wrong").await.unwrap_err();
        assert!(matches!(err, CoreError::Auth(ref m) if m.contains("401")));
    }

    #[tokio::test]
    async fn near_expiry_refreshes_once_and_keeps_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/auth/tokens")
            .with_status(200)
            .with_body(grant_body("old_jwt", Some("ref_tok"), 60))
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/tokens/refresh")
            .match_body(mockito::Matcher::JsonString(
                r#"{"refresh_token":"ref_tok"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(grant_body("new_jwt", None, 7200))
            .expect(1)
            .create_async()
            .await;

        let tm = TokenManager::new(&server.url());
        tm.login("dev@tether.test", "pw").await.unwrap();

        let (a, b) = tokio::join!(tm.get_token(), tm.get_token());
        assert_eq!(a.unwrap(), "new_jwt");
        assert_eq!(b.unwrap(), "new_jwt");
        refresh.assert_async().await;
        assert_eq!(tm.current().unwrap().refresh_token.as_deref(), Some("ref_tok"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_current_token() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/auth/tokens")
            .with_status(200)
            .with_body(grant_body("short_jwt", Some("ref_tok"), 30))
            .create_async()
            .await;
        let _refresh = server
            .mock("POST", "/auth/tokens/refresh")
            .with_status(500)
            .create_async()
            .await;

        let tm = TokenManager::new(&server.url());
        tm.login("dev@tether.test", "pw").await.unwrap();
        assert_eq!(tm.get_token().await.unwrap(), "short_jwt");
    }

    #[tokio::test]
    async fn refresh_without_session_fails() {
        let tm = TokenManager::new("http://localhost:9999")
            .with_refresh_margin(std::time::Duration::from_secs(30));
        assert!(matches!(tm.refresh().await, Err(CoreError::Auth(_))));
    }
}
