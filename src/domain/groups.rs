use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Strategy,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Text => write!(f, "TEXT"),
            MessageKind::Strategy => write!(f, "STRATEGY"),
        }
    }
}

impl FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TEXT" => Ok(MessageKind::Text),
            "STRATEGY" => Ok(MessageKind::Strategy),
            _ => Err(anyhow!("Invalid message kind: {}", s)),
        }
    }
}

/// A user group. Exactly one owner; membership bounded by the owner's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub join_code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
}

/// Message body is stored as ciphertext; decryption happens at read time
/// through the configured cipher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: String,
    pub group_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}
