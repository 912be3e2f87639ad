//! Request authorization scope.
//!
//! Row-level authorization in the metadata store reads session-local
//! settings. [`AuthScope`] is the immutable value carrying the caller's
//! identity through every operation; it is applied to each authorized
//! transaction with `set_config(..., is_local => true)` so the settings
//! vanish at transaction end.

use serde_json::json;

use crate::DbTransaction;
use crate::error::DbResult;

/// The role every privileged transaction switches to.
pub const SERVICE_ROLE: &str = "service_role";

/// The caller identity applied to authorized transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthScope {
    /// Database role evaluated by row policies (`anon`, `authenticated`,
    /// `service_role`).
    pub role: String,
    /// The raw bearer JWT, when one was presented.
    pub jwt_raw: Option<String>,
    /// The decoded JWT claims as JSON.
    pub claims: Option<serde_json::Value>,
    /// The token subject (user id).
    pub subject: Option<String>,
    /// Request id for correlation.
    pub req_id: Option<String>,
    /// Selected request headers as JSON.
    pub headers: Option<serde_json::Value>,
    /// Request method.
    pub method: Option<String>,
    /// Request path.
    pub path: Option<String>,
}

impl AuthScope {
    /// An anonymous scope with no token.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            role: "anon".to_owned(),
            jwt_raw: None,
            claims: None,
            subject: None,
            req_id: None,
            headers: None,
            method: None,
            path: None,
        }
    }

    /// An authenticated scope from a verified token.
    #[must_use]
    pub fn authenticated(
        jwt_raw: impl Into<String>,
        claims: serde_json::Value,
        subject: Option<String>,
    ) -> Self {
        let role = claims
            .get("role")
            .and_then(|r| r.as_str())
            .unwrap_or("authenticated")
            .to_owned();
        Self {
            role,
            jwt_raw: Some(jwt_raw.into()),
            claims: Some(claims),
            subject,
            req_id: None,
            headers: None,
            method: None,
            path: None,
        }
    }

    /// The service-role scope used by privileged bookkeeping.
    #[must_use]
    pub fn service() -> Self {
        Self {
            role: SERVICE_ROLE.to_owned(),
            ..Self::anonymous()
        }
    }

    /// Copy of this scope with the service role, keeping the request
    /// correlation fields.
    #[must_use]
    pub fn as_service(&self) -> Self {
        Self {
            role: SERVICE_ROLE.to_owned(),
            jwt_raw: None,
            claims: None,
            subject: None,
            req_id: self.req_id.clone(),
            headers: self.headers.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
        }
    }

    /// Whether this scope bypasses row-level authorization.
    #[must_use]
    pub fn is_service(&self) -> bool {
        self.role == SERVICE_ROLE
    }

    /// Attach request correlation fields.
    #[must_use]
    pub fn with_request(
        mut self,
        req_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: serde_json::Value,
    ) -> Self {
        self.req_id = Some(req_id.into());
        self.method = Some(method.into());
        self.path = Some(path.into());
        self.headers = Some(headers);
        self
    }

    /// The `(key, value)` settings this scope pins on a transaction.
    #[must_use]
    pub fn settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![("role", self.role.clone())];
        if let Some(jwt) = &self.jwt_raw {
            settings.push(("request.jwt", jwt.clone()));
        }
        if let Some(claims) = &self.claims {
            settings.push(("request.jwt.claims", claims.to_string()));
        }
        if let Some(sub) = &self.subject {
            settings.push(("request.jwt.claim.sub", sub.clone()));
        }
        if let Some(req_id) = &self.req_id {
            settings.push(("request.req_id", req_id.clone()));
        }
        if let Some(headers) = &self.headers {
            settings.push(("request.headers", headers.to_string()));
        }
        if let Some(method) = &self.method {
            settings.push(("request.method", method.clone()));
        }
        if let Some(path) = &self.path {
            settings.push(("request.path", path.clone()));
        }
        settings
    }

    /// Apply this scope to a transaction as local settings.
    pub async fn apply(&self, tx: &mut DbTransaction) -> DbResult<()> {
        for (key, value) in self.settings() {
            sqlx::query("SELECT set_config($1, $2, true)")
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

/// Enable direct `DELETE` on the guarded tables for this transaction.
///
/// The `objects` and `buckets` tables carry a trigger that rejects deletes
/// with SQLSTATE 42501 unless this session setting is on, protecting from
/// accidental or out-of-band deletes.
pub async fn with_delete_guard(tx: &mut DbTransaction) -> DbResult<()> {
    sqlx::query("SELECT set_config('objectstack.allow_direct_delete', 'on', true)")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Build the headers JSON for [`AuthScope::with_request`] from pairs.
#[must_use]
pub fn headers_json<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), json!(v)))
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_pin_role_from_claims() {
        let scope = AuthScope::authenticated(
            "raw.jwt.token",
            json!({"role": "authenticated", "sub": "user-1"}),
            Some("user-1".to_owned()),
        );
        assert_eq!(scope.role, "authenticated");
        assert!(!scope.is_service());

        let settings = scope.settings();
        assert!(settings.iter().any(|(k, _)| *k == "request.jwt"));
        assert!(settings.iter().any(|(k, v)| *k == "request.jwt.claim.sub" && v == "user-1"));
    }

    #[test]
    fn test_should_strip_identity_when_switching_to_service() {
        let scope = AuthScope::authenticated(
            "raw",
            json!({"role": "authenticated"}),
            Some("user-1".to_owned()),
        )
        .with_request("req-9", "POST", "/object/b/x", headers_json([("x-upsert", "true")]));

        let service = scope.as_service();
        assert!(service.is_service());
        assert!(service.jwt_raw.is_none());
        assert!(service.claims.is_none());
        // Correlation fields survive the switch.
        assert_eq!(service.req_id.as_deref(), Some("req-9"));
        assert_eq!(service.path.as_deref(), Some("/object/b/x"));
    }

    #[test]
    fn test_should_default_role_for_anonymous() {
        let scope = AuthScope::anonymous();
        assert_eq!(scope.role, "anon");
        assert_eq!(scope.settings(), vec![("role", "anon".to_owned())]);
    }
}
