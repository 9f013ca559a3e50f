use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Pro,
    Creator,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Pro => "pro",
            Role::Creator => "creator",
            Role::Admin => "admin",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "pro" => Ok(Role::Pro),
            "creator" => Ok(Role::Creator),
            "admin" => Ok(Role::Admin),
            _ => Err(anyhow!("Invalid role: {}", s)),
        }
    }
}

/// Platform account. Credentials, OAuth and session handling live at the
/// edge; the core only needs identity, role and plan linkage. Emails are
/// stored lowercased and unique. Users referenced by trades or royalties
/// are never hard-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub auth_provider: String,
    pub current_plan_id: Option<String>,
    /// Per-user override of the plan's default royalty percent, 0-100.
    pub royalty_percent_override: Option<f64>,
    pub broker_connected: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_creator(&self) -> bool {
        matches!(self.role, Role::Creator | Role::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Pro, Role::Creator, Role::Admin] {
            assert_eq!(Role::from_str(&role.to_string()).unwrap(), role);
        }
        assert!(Role::from_str("root").is_err());
    }
}
