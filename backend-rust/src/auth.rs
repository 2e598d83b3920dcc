//! # auth
//!
//! Socket authentication: HS256 JWT validation for admin/operations clients,
//! a legacy static-token fallback for the transition window, and the
//! per-socket role registry consulted by privileged handlers.

use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: u64,
}

pub struct AuthEngine {
    secret: Option<Vec<u8>>,
    /// socket id → role
    roles: RwLock<HashMap<String, String>>,
}

impl AuthEngine {
    pub fn new() -> Arc<Self> {
        let secret = std::env::var("WAYFIND_JWT_SECRET").ok().map(|s| s.into_bytes());
        if secret.is_none() {
            warn!("WAYFIND_JWT_SECRET unset; only legacy tokens will authenticate");
        }
        Arc::new(Self { secret, roles: RwLock::new(HashMap::new()) })
    }

    pub async fn set_role(&self, socket_id: &str, role: &str) {
        self.roles.write().await.insert(socket_id.to_string(), role.to_string());
    }

    pub async fn get_role(&self, socket_id: &str) -> Option<String> {
        self.roles.read().await.get(socket_id).cloned()
    }

    pub async fn remove_role(&self, socket_id: &str) {
        self.roles.write().await.remove(socket_id);
    }

    pub async fn has_role(&self, socket_id: &str, role: &str) -> bool {
        self.get_role(socket_id).await.as_deref() == Some(role)
    }

    /// Resolve a presented token to a role. JWT first; legacy static tokens
    /// cover clients not yet migrated. Unknown tokens yield no role and the
    /// socket is disconnected by the caller.
    pub fn resolve_role(&self, token: &str) -> Option<String> {
        if let Some(secret) = &self.secret {
            let mut validation = Validation::default();
            validation.validate_exp = true;
            match decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation) {
                Ok(data) => {
                    let role = data.claims.role.unwrap_or_else(|| "client".to_string());
                    info!("JWT authenticated {} as {role}", data.claims.sub);
                    return Some(role);
                }
                Err(e) => {
                    // fall through to legacy tokens
                    warn!("JWT validation failed: {e}");
                }
            }
        }
        match token {
            "admin123" | "admin" => Some("admin".to_string()),
            "ops123" | "operations" => Some("operations".to_string()),
            "client123" | "client" | "tracker" => Some("client".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[tokio::test]
    async fn role_registry_roundtrip() {
        let auth = AuthEngine::new();
        auth.set_role("sock-1", "admin").await;
        assert!(auth.has_role("sock-1", "admin").await);
        assert!(!auth.has_role("sock-1", "client").await);
        auth.remove_role("sock-1").await;
        assert_eq!(auth.get_role("sock-1").await, None);
    }

    #[test]
    fn legacy_tokens_resolve() {
        let auth = AuthEngine::new();
        assert_eq!(auth.resolve_role("admin123").as_deref(), Some("admin"));
        assert_eq!(auth.resolve_role("operations").as_deref(), Some("operations"));
        assert_eq!(auth.resolve_role("client").as_deref(), Some("client"));
        assert_eq!(auth.resolve_role("nope"), None);
    }

    #[test]
    fn jwt_resolves_role_claim() {
        let secret = b"test-secret";
        let auth = AuthEngine { secret: Some(secret.to_vec()), roles: RwLock::new(HashMap::new()) };
        let exp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        let token = encode(
            &Header::default(),
            &Claims { sub: "ops-7".into(), role: Some("operations".into()), exp },
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        assert_eq!(auth.resolve_role(&token).as_deref(), Some("operations"));
    }
}
