//! Identity extraction from gateway headers

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use uuid::Uuid;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const COMPANY_ID_HEADER: &str = "x-company-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Role of the caller inside their company
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

/// Authenticated caller
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub company_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    /// Owners only, e.g. manual payment confirmation
    pub fn require_owner(&self) -> Result<(), ApiError> {
        if self.role == Role::Owner {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %self.user_id,
                company_id = %self.company_id,
                role = ?self.role,
                "Owner-only billing action refused"
            );
            Err(ApiError::Forbidden)
        }
    }

    /// Owners and admins manage the plan
    pub fn require_manager(&self) -> Result<(), ApiError> {
        match self.role {
            Role::Owner | Role::Admin => Ok(()),
            Role::Member => Err(ApiError::Forbidden),
        }
    }
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let user_id = header_uuid(headers, USER_ID_HEADER).ok_or(ApiError::Unauthorized)?;
        let company_id = header_uuid(headers, COMPANY_ID_HEADER).ok_or(ApiError::Unauthorized)?;
        let role = headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .unwrap_or(Role::Member);

        Ok(Self {
            user_id,
            company_id,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<AuthUser, ApiError> {
        let (mut parts, _) = request.into_parts();
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_extracts_identity_headers() {
        let user = Uuid::new_v4();
        let company = Uuid::new_v4();
        let request = Request::builder()
            .header(USER_ID_HEADER, user.to_string())
            .header(COMPANY_ID_HEADER, company.to_string())
            .header(USER_ROLE_HEADER, "Owner")
            .body(())
            .unwrap();

        let auth = extract(request).await.unwrap();
        assert_eq!(auth.user_id, user);
        assert_eq!(auth.company_id, company);
        assert_eq!(auth.role, Role::Owner);
        assert!(auth.require_owner().is_ok());
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let request = Request::builder()
            .header(USER_ID_HEADER, Uuid::new_v4().to_string())
            .body(())
            .unwrap();
        assert!(matches!(extract(request).await, Err(ApiError::Unauthorized)));

        let request = Request::builder()
            .header(USER_ID_HEADER, "not-a-uuid")
            .header(COMPANY_ID_HEADER, Uuid::new_v4().to_string())
            .body(())
            .unwrap();
        assert!(matches!(extract(request).await, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_unknown_role_defaults_to_member() {
        let request = Request::builder()
            .header(USER_ID_HEADER, Uuid::new_v4().to_string())
            .header(COMPANY_ID_HEADER, Uuid::new_v4().to_string())
            .header(USER_ROLE_HEADER, "superuser")
            .body(())
            .unwrap();
        let auth = extract(request).await.unwrap();
        assert_eq!(auth.role, Role::Member);
        assert!(matches!(auth.require_owner(), Err(ApiError::Forbidden)));
        assert!(matches!(auth.require_manager(), Err(ApiError::Forbidden)));
    }
}
