// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operations Console identity: OIDC JWT verification and claim projection.

use crate::rbac::{ALL_PERMISSIONS, OpsRole, Permission, has_permission};
use crate::TenancyError;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;

/// Claim names the verifier reads, as configured per deployment.
#[derive(Debug, Clone)]
pub struct ClaimNames {
    /// Claim carrying the role (string or list of strings).
    pub role: String,
    /// Claim carrying the tenant id.
    pub tenant: String,
    /// Claim carrying the optional workspace scope.
    pub workspace: String,
    /// Claim listing tenants an admin may read across.
    pub allowed_tenants: String,
}

impl Default for ClaimNames {
    fn default() -> Self {
        Self {
            role: "roles".to_string(),
            tenant: "tenant_id".to_string(),
            workspace: "workspace_id".to_string(),
            allowed_tenants: "allowed_tenants".to_string(),
        }
    }
}

/// Projected identity of an ops-console caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OpsIdentity {
    /// Subject claim (`sub`), used for audit attribution.
    pub subject: String,
    /// Home tenant of the caller.
    pub tenant_id: String,
    /// Optional workspace scope.
    pub workspace_id: Option<String>,
    /// Effective role; the highest-ranked role named in the role claim.
    pub role: OpsRole,
    /// Tenants an admin may read across. Empty for non-admins.
    pub allowed_tenants: Vec<String>,
}

impl OpsIdentity {
    /// Table lookup: may this caller exercise `permission`?
    #[must_use]
    pub fn can(&self, permission: Permission) -> bool {
        has_permission(self.role, permission)
    }

    /// All permissions this caller holds, for `/ops/api/me`.
    #[must_use]
    pub fn permissions(&self) -> Vec<Permission> {
        ALL_PERMISSIONS
            .iter()
            .copied()
            .filter(|p| self.can(*p))
            .collect()
    }

    /// Whether this caller may read `tenant`'s data.
    ///
    /// Same-tenant reads are always allowed; cross-tenant reads require the
    /// admin role **and** membership of the target in the allowed list.
    #[must_use]
    pub fn can_read_tenant(&self, tenant: &str) -> bool {
        if tenant == self.tenant_id {
            return true;
        }
        self.role == OpsRole::Admin && self.allowed_tenants.iter().any(|t| t == tenant)
    }
}

/// Verifies ops-console bearer tokens and projects their claims.
///
/// The decoding key is injected by the caller; HMAC for shared-secret
/// deployments, RSA/EC public key material fetched from the issuer's JWKS
/// endpoint otherwise. Key fetching itself is boundary plumbing and lives in
/// the daemon.
pub struct OpsVerifier {
    key: DecodingKey,
    validation: Validation,
    claims: ClaimNames,
}

impl std::fmt::Debug for OpsVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsVerifier")
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl OpsVerifier {
    /// Build a verifier over an HMAC shared secret.
    #[must_use]
    pub fn from_secret(secret: &[u8], issuer: Option<&str>, audience: Option<&str>, claims: ClaimNames) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        Self::configure(&mut validation, issuer, audience);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            claims,
        }
    }

    /// Build a verifier over an RSA public key (PEM), as distributed via the
    /// issuer's key set.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::ConfigError`] when the PEM is malformed.
    pub fn from_rsa_pem(
        pem: &[u8],
        issuer: Option<&str>,
        audience: Option<&str>,
        claims: ClaimNames,
    ) -> Result<Self, TenancyError> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| TenancyError::ConfigError(format!("bad RSA public key: {e}")))?;
        let mut validation = Validation::new(Algorithm::RS256);
        Self::configure(&mut validation, issuer, audience);
        Ok(Self {
            key,
            validation,
            claims,
        })
    }

    fn configure(validation: &mut Validation, issuer: Option<&str>, audience: Option<&str>) {
        validation.validate_exp = true;
        validation.required_spec_claims.clear();
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }
    }

    /// Verify `token` and project its claims into an [`OpsIdentity`].
    ///
    /// # Errors
    ///
    /// [`TenancyError::InvalidToken`] on signature/expiry failure,
    /// [`TenancyError::MissingClaim`] when tenant or role claims are absent
    /// or name no recognized role.
    pub fn verify(&self, token: &str) -> Result<OpsIdentity, TenancyError> {
        let data = jsonwebtoken::decode::<Value>(token, &self.key, &self.validation)
            .map_err(|e| TenancyError::InvalidToken(format!("ops token rejected: {e}")))?;
        let claims = data.claims;

        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let tenant_id = claims
            .get(&self.claims.tenant)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TenancyError::MissingClaim(self.claims.tenant.clone()))?;

        let role = flatten_role(claims.get(&self.claims.role))
            .ok_or_else(|| TenancyError::MissingClaim(self.claims.role.clone()))?;

        let workspace_id = claims
            .get(&self.claims.workspace)
            .and_then(Value::as_str)
            .map(str::to_string);

        let allowed_tenants = claims
            .get(&self.claims.allowed_tenants)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(OpsIdentity {
            subject,
            tenant_id,
            workspace_id,
            role,
            allowed_tenants,
        })
    }
}

/// Flatten a role claim that may be a string or a list of strings into the
/// highest-ranked recognized role.
fn flatten_role(claim: Option<&Value>) -> Option<OpsRole> {
    match claim? {
        Value::String(s) => OpsRole::parse(s),
        Value::Array(list) => list
            .iter()
            .filter_map(Value::as_str)
            .filter_map(OpsRole::parse)
            .max_by_key(OpsRole::rank),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"ops-test-secret";

    fn issue(claims: Value) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn verifier() -> OpsVerifier {
        OpsVerifier::from_secret(SECRET, None, None, ClaimNames::default())
    }

    fn base_claims() -> Value {
        json!({
            "sub": "alice",
            "tenant_id": "t1",
            "roles": "operator",
            "exp": Utc::now().timestamp() + 600,
        })
    }

    #[test]
    fn projects_basic_identity() {
        let id = verifier().verify(&issue(base_claims())).unwrap();
        assert_eq!(id.subject, "alice");
        assert_eq!(id.tenant_id, "t1");
        assert_eq!(id.role, OpsRole::Operator);
        assert!(id.workspace_id.is_none());
        assert!(id.allowed_tenants.is_empty());
    }

    #[test]
    fn role_list_flattens_to_highest_rank() {
        let mut claims = base_claims();
        claims["roles"] = json!(["viewer", "release_manager", "operator"]);
        let id = verifier().verify(&issue(claims)).unwrap();
        assert_eq!(id.role, OpsRole::ReleaseManager);
    }

    #[test]
    fn unrecognized_roles_are_skipped() {
        let mut claims = base_claims();
        claims["roles"] = json!(["superhero", "viewer"]);
        let id = verifier().verify(&issue(claims)).unwrap();
        assert_eq!(id.role, OpsRole::Viewer);
    }

    #[test]
    fn missing_tenant_claim_rejected() {
        let mut claims = base_claims();
        claims.as_object_mut().unwrap().remove("tenant_id");
        let err = verifier().verify(&issue(claims)).unwrap_err();
        assert_eq!(err.code(), "missing_claim");
    }

    #[test]
    fn missing_role_claim_rejected() {
        let mut claims = base_claims();
        claims.as_object_mut().unwrap().remove("roles");
        let err = verifier().verify(&issue(claims)).unwrap_err();
        assert_eq!(err.code(), "missing_claim");
    }

    #[test]
    fn cross_tenant_needs_admin_and_membership() {
        let mut claims = base_claims();
        claims["roles"] = json!("admin");
        claims["allowed_tenants"] = json!(["t2", "t3"]);
        let id = verifier().verify(&issue(claims)).unwrap();
        assert!(id.can_read_tenant("t1"));
        assert!(id.can_read_tenant("t2"));
        assert!(!id.can_read_tenant("t9"));

        let mut op_claims = base_claims();
        op_claims["allowed_tenants"] = json!(["t2"]);
        let op = verifier().verify(&issue(op_claims)).unwrap();
        assert!(op.can_read_tenant("t1"));
        assert!(!op.can_read_tenant("t2"), "non-admin may not cross tenants");
    }

    #[test]
    fn bad_signature_rejected() {
        let other = OpsVerifier::from_secret(b"different", None, None, ClaimNames::default());
        let err = other.verify(&issue(base_claims())).unwrap_err();
        assert_eq!(err.code(), "invalid_token");
    }

    #[test]
    fn issuer_mismatch_rejected() {
        let strict = OpsVerifier::from_secret(
            SECRET,
            Some("https://idp.example.com"),
            None,
            ClaimNames::default(),
        );
        let mut claims = base_claims();
        claims["iss"] = json!("https://evil.example.com");
        assert!(strict.verify(&issue(claims)).is_err());
    }

    #[test]
    fn permissions_projection_matches_table() {
        let id = verifier().verify(&issue(base_claims())).unwrap();
        let perms = id.permissions();
        assert!(perms.contains(&Permission::TraceLabel));
        assert!(!perms.contains(&Permission::OverrideUse));
    }
}
