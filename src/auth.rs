//! Access gate: token → identity → permissions.
//!
//! Three policies sit on top of one identity provider:
//!
//! | Policy | Used by | Failure |
//! |--------|---------|---------|
//! | [`AccessGate::require_admin`] | upload, job routes | `Unauthorized` / `Forbidden` |
//! | [`AccessGate::admit_chat`] | `/chat` | [`ChatAdmission::SignInRequired`] |
//! | [`AccessGate::permitted_labels`] | `/source-labels`, chat retrieval | empty label set |
//!
//! Every decision is derived from the token on each call. With the
//! provider set to `disabled` every gate admits and label filtering is off.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::config::AuthConfig;
use crate::error::{RagError, RagResult};

/// Canned reply for chat connections without a valid token.
pub const SIGN_IN_MESSAGE: &str =
    "Please sign in first, and then I will look forward to answering your question.";

pub const ADMIN_USER_TYPE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_types: Vec<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.user_types.iter().any(|t| t == ADMIN_USER_TYPE)
    }
}

/// External identity service boundary.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a token to an identity. Any non-success is `Unauthorized`.
    async fn resolve(&self, token: &str) -> RagResult<Identity>;

    /// Labels the given user types may read.
    async fn labels_for(&self, user_types: &[String]) -> RagResult<BTreeSet<String>>;
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    user_types: Vec<String>,
}

// ============ Supabase ============

pub struct SupabaseProvider {
    base_url: url::Url,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SupabaseUser {
    id: String,
    #[serde(default)]
    user_metadata: UserMetadata,
}

#[derive(Debug, Deserialize)]
struct UserTypeRow {
    #[serde(default)]
    sources: Vec<String>,
}

impl SupabaseProvider {
    pub fn new(base_url: &str, api_key: &str, timeout_secs: u64) -> RagResult<Self> {
        let mut base_url = url::Url::parse(base_url)
            .map_err(|e| RagError::connection("supabase", format!("invalid url '{}': {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RagError::connection("supabase", e))?;
        Ok(Self {
            base_url,
            api_key: api_key.to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> RagResult<url::Url> {
        self.base_url
            .join(path)
            .map_err(|e| RagError::connection("supabase", e))
    }
}

#[async_trait]
impl IdentityProvider for SupabaseProvider {
    async fn resolve(&self, token: &str) -> RagResult<Identity> {
        let response = self
            .client
            .get(self.endpoint("auth/v1/user")?)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RagError::Unauthorized(format!("identity provider unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(RagError::Unauthorized(format!(
                "identity provider rejected token ({})",
                response.status()
            )));
        }

        let user: SupabaseUser = response
            .json()
            .await
            .map_err(|e| RagError::Unauthorized(format!("unreadable identity: {}", e)))?;

        Ok(Identity {
            user_id: user.id,
            user_types: user.user_metadata.user_types,
        })
    }

    async fn labels_for(&self, user_types: &[String]) -> RagResult<BTreeSet<String>> {
        if user_types.is_empty() {
            return Ok(BTreeSet::new());
        }
        let filter = format!("in.({})", user_types.join(","));
        let response = self
            .client
            .get(self.endpoint("rest/v1/userTypes")?)
            .query(&[("select", "sources"), ("user_type", filter.as_str())])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RagError::connection("supabase", e))?;

        if !response.status().is_success() {
            return Err(RagError::connection(
                "supabase",
                format!("label lookup failed ({})", response.status()),
            ));
        }

        let rows: Vec<UserTypeRow> = response
            .json()
            .await
            .map_err(|e| RagError::connection("supabase", e))?;
        Ok(rows.into_iter().flat_map(|r| r.sources).collect())
    }
}

// ============ JWT (HS256) ============

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    user_metadata: UserMetadata,
}

/// Verifies locally signed HS256 tokens and maps user types to labels from config.
pub struct JwtProvider {
    key: DecodingKey,
    validation: Validation,
    user_types: HashMap<String, Vec<String>>,
}

impl JwtProvider {
    pub fn new(secret: &str, user_types: HashMap<String, Vec<String>>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            user_types,
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtProvider {
    async fn resolve(&self, token: &str) -> RagResult<Identity> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| RagError::Unauthorized(format!("invalid token: {}", e)))?;
        Ok(Identity {
            user_id: data.claims.sub,
            user_types: data.claims.user_metadata.user_types,
        })
    }

    async fn labels_for(&self, user_types: &[String]) -> RagResult<BTreeSet<String>> {
        Ok(user_types
            .iter()
            .filter_map(|t| self.user_types.get(t))
            .flatten()
            .cloned()
            .collect())
    }
}

// ============ Gate ============

/// Outcome of the chat gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAdmission {
    /// Serve the session. `None` when auth is disabled.
    Admitted(Option<Identity>),
    /// Accept the channel, send [`SIGN_IN_MESSAGE`], and end.
    SignInRequired,
}

pub enum AccessGate {
    Disabled,
    Enabled(Box<dyn IdentityProvider>),
}

impl AccessGate {
    pub fn from_config(auth: &AuthConfig) -> RagResult<Self> {
        let missing = |key: &str| RagError::connection("auth", format!("auth.{} is required", key));
        match auth.provider.as_str() {
            "disabled" => Ok(AccessGate::Disabled),
            "supabase" => {
                let url = auth.url.as_deref().ok_or_else(|| missing("url"))?;
                let key = auth.api_key.as_deref().ok_or_else(|| missing("api_key"))?;
                Ok(AccessGate::Enabled(Box::new(SupabaseProvider::new(
                    url,
                    key,
                    auth.timeout_secs,
                )?)))
            }
            "jwt" => {
                let secret = auth.secret.as_deref().ok_or_else(|| missing("secret"))?;
                Ok(AccessGate::Enabled(Box::new(JwtProvider::new(
                    secret,
                    auth.user_types.clone(),
                ))))
            }
            other => Err(RagError::InvalidRequest(format!(
                "unknown auth provider '{}'",
                other
            ))),
        }
    }

    pub fn with_provider(provider: impl IdentityProvider + 'static) -> Self {
        AccessGate::Enabled(Box::new(provider))
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, AccessGate::Enabled(_))
    }

    /// Admin-only policy. Returns the identity, or `None` when auth is disabled.
    pub async fn require_admin(&self, token: Option<&str>) -> RagResult<Option<Identity>> {
        let AccessGate::Enabled(provider) = self else {
            return Ok(None);
        };
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RagError::Unauthorized("access token is missing".into()))?;
        let identity = provider.resolve(token).await?;
        if !identity.is_admin() {
            return Err(RagError::Forbidden(format!(
                "user {} is not an admin",
                identity.user_id
            )));
        }
        Ok(Some(identity))
    }

    /// Logged-in-user chat policy.
    pub async fn admit_chat(&self, token: Option<&str>) -> ChatAdmission {
        let AccessGate::Enabled(provider) = self else {
            return ChatAdmission::Admitted(None);
        };
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return ChatAdmission::SignInRequired;
        };
        match provider.resolve(token).await {
            Ok(identity) => ChatAdmission::Admitted(Some(identity)),
            Err(e) => {
                tracing::info!(error = %e, "chat connection without a valid token");
                ChatAdmission::SignInRequired
            }
        }
    }

    /// Label-exposure policy. `None` means "no filter" (auth disabled).
    ///
    /// An absent or invalid token, or a failed label lookup, yields the
    /// empty set.
    pub async fn permitted_labels(&self, token: Option<&str>) -> Option<BTreeSet<String>> {
        let AccessGate::Enabled(provider) = self else {
            return None;
        };
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Some(BTreeSet::new());
        };
        let labels = match provider.resolve(token).await {
            Ok(identity) => provider.labels_for(&identity.user_types).await,
            Err(e) => Err(e),
        };
        Some(labels.unwrap_or_else(|e| {
            tracing::info!(error = %e, "no labels exposed");
            BTreeSet::new()
        }))
    }
}

/// Token from an `Authorization: Bearer` header value.
pub fn bearer_token(header: Option<&str>) -> Option<String> {
    header
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(sub: &str, user_types: &[&str], exp_offset: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset) as usize;
        let claims = json!({
            "sub": sub,
            "exp": exp,
            "user_metadata": { "user_types": user_types },
        });
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn jwt_gate() -> AccessGate {
        let mut table = HashMap::new();
        table.insert("member".to_string(), vec!["A".to_string(), "B".to_string()]);
        table.insert("admin".to_string(), vec!["bible".to_string()]);
        AccessGate::with_provider(JwtProvider::new(SECRET, table))
    }

    #[tokio::test]
    async fn test_labels_empty_without_token() {
        let gate = jwt_gate();
        assert_eq!(gate.permitted_labels(None).await, Some(BTreeSet::new()));
        assert_eq!(
            gate.permitted_labels(Some("garbage")).await,
            Some(BTreeSet::new())
        );
    }

    #[tokio::test]
    async fn test_labels_follow_user_types() {
        let gate = jwt_gate();
        let t = token("u1", &["member"], 3600);
        let expected: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        assert_eq!(gate.permitted_labels(Some(&t)).await, Some(expected));
    }

    #[tokio::test]
    async fn test_admin_gate() {
        let gate = jwt_gate();
        assert!(matches!(
            gate.require_admin(None).await,
            Err(RagError::Unauthorized(_))
        ));
        let member = token("u1", &["member"], 3600);
        assert!(matches!(
            gate.require_admin(Some(&member)).await,
            Err(RagError::Forbidden(_))
        ));
        let admin = token("root", &["admin"], 3600);
        let identity = gate.require_admin(Some(&admin)).await.unwrap().unwrap();
        assert_eq!(identity.user_id, "root");
    }

    #[tokio::test]
    async fn test_expired_token_is_unauthorized() {
        let gate = jwt_gate();
        let expired = token("root", &["admin"], -3600);
        assert!(matches!(
            gate.require_admin(Some(&expired)).await,
            Err(RagError::Unauthorized(_))
        ));
        assert_eq!(
            gate.admit_chat(Some(&expired)).await,
            ChatAdmission::SignInRequired
        );
    }

    #[tokio::test]
    async fn test_disabled_gate_admits_everyone() {
        let gate = AccessGate::Disabled;
        assert!(gate.require_admin(None).await.unwrap().is_none());
        assert_eq!(gate.admit_chat(None).await, ChatAdmission::Admitted(None));
        assert_eq!(gate.permitted_labels(None).await, None);
    }

    #[tokio::test]
    async fn test_supabase_resolves_identity_and_labels() {
        let server = MockServer::start_async().await;
        let user_mock = server.mock(|when, then| {
            when.method(GET).path("/auth/v1/user").header("apikey", "anon");
            then.status(200).json_body(json!({
                "id": "user-1",
                "user_metadata": { "user_types": ["member", "translator"] }
            }));
        });
        let labels_mock = server.mock(|when, then| {
            when.method(GET)
                .path("/rest/v1/userTypes")
                .query_param("select", "sources")
                .query_param("user_type", "in.(member,translator)");
            then.status(200).json_body(json!([
                { "sources": ["A", "B"] },
                { "sources": ["B", "C"] }
            ]));
        });

        let gate =
            AccessGate::with_provider(SupabaseProvider::new(&server.base_url(), "anon", 5).unwrap());
        let labels = gate.permitted_labels(Some("tok")).await.unwrap();
        let expected: BTreeSet<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(labels, expected);
        user_mock.assert_calls(1);
        labels_mock.assert_calls(1);
    }

    #[tokio::test]
    async fn test_supabase_rejection_is_unauthorized() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/auth/v1/user");
            then.status(401).json_body(json!({ "msg": "invalid JWT" }));
        });

        let provider = SupabaseProvider::new(&server.base_url(), "anon", 5).unwrap();
        assert!(matches!(
            provider.resolve("bad").await,
            Err(RagError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc".to_string()));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }
}
