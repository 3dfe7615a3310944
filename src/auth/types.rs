// Authentication types

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Access/refresh token pair issued by the auth service
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_seconds: Option<u64>,
}

/// User profile as returned by login, register, refresh and `/auth/me`
///
/// Login and refresh return the short form; `/auth/me` adds the optional
/// account fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
}

/// Login / register response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user: UserProfile,
}

impl AuthResponse {
    pub fn credential(&self) -> Credential {
        Credential {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_in_seconds: self.expires_in,
        }
    }
}

/// Refresh response
///
/// The server rotates the refresh token on every exchange, so it is required.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// Refresh request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Generic `{message}` response
#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenValidationRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    pub valid: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Paths of the auth service, relative to the API base URL
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEndpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
    pub logout: String,
    pub me: String,
    pub change_password: String,
    pub validate: String,
}

impl AuthEndpoints {
    /// Build the endpoint set under a path prefix such as `/auth`
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let path = |name: &str| format!("{}/{}", prefix, name);
        Self {
            login: path("login"),
            register: path("register"),
            refresh: path("refresh"),
            logout: path("logout"),
            me: path("me"),
            change_password: path("change-password"),
            validate: path("validate"),
        }
    }
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self::with_prefix("/auth")
    }
}
