//! Group membership and messaging rules.
//!
//! One owner per group, a short join code, membership bounded by the
//! owner's plan, message bodies encrypted at rest through the configured
//! cipher. Owners may delete any message; members only their own.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::errors::PolicyError;
use crate::domain::groups::{Group, GroupMember, GroupMessage, MessageKind};
use crate::domain::ports::MessageCipher;
use crate::domain::repositories::{GroupRepository, PlanRepository, UserRepository};

const JOIN_CODE_LEN: usize = 6;
const DEFAULT_MAX_GROUP_SIZE: u32 = 10;
const MESSAGE_PAGE: usize = 100;

pub struct GroupService {
    groups: Arc<dyn GroupRepository>,
    users: Arc<dyn UserRepository>,
    plans: Arc<dyn PlanRepository>,
    cipher: Arc<dyn MessageCipher>,
}

impl GroupService {
    pub fn new(
        groups: Arc<dyn GroupRepository>,
        users: Arc<dyn UserRepository>,
        plans: Arc<dyn PlanRepository>,
        cipher: Arc<dyn MessageCipher>,
    ) -> Self {
        Self {
            groups,
            users,
            plans,
            cipher,
        }
    }

    pub async fn create_group(&self, owner_id: &str, name: &str) -> Result<Group> {
        let group = Group {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.trim().to_string(),
            join_code: generate_join_code(),
            created_at: Utc::now(),
        };
        self.groups.create(&group).await?;
        self.groups
            .add_member(&GroupMember {
                group_id: group.id.clone(),
                user_id: owner_id.to_string(),
                joined_at: Utc::now(),
            })
            .await?;
        info!("Group {} created by {}", group.id, owner_id);
        Ok(group)
    }

    /// Join by code; denied when the owner's plan size limit is reached.
    pub async fn join_by_code(&self, user_id: &str, join_code: &str) -> Result<Group> {
        let group = self
            .groups
            .get_by_join_code(&join_code.to_uppercase())
            .await?
            .ok_or_else(|| anyhow!("Unknown join code"))?;

        let limit = self.group_size_limit(&group.owner_id).await?;
        let member_count = self.groups.members(&group.id).await?.len() as u32;
        if member_count >= limit {
            return Err(PolicyError::PlanLimit {
                reason: format!("group is full ({} members)", limit),
            }
            .into());
        }

        self.groups
            .add_member(&GroupMember {
                group_id: group.id.clone(),
                user_id: user_id.to_string(),
                joined_at: Utc::now(),
            })
            .await?;
        Ok(group)
    }

    pub async fn post_message(
        &self,
        group_id: &str,
        sender_id: &str,
        kind: MessageKind,
        body: &[u8],
    ) -> Result<GroupMessage> {
        self.require_member(group_id, sender_id).await?;

        let message = GroupMessage {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            sender_id: sender_id.to_string(),
            kind,
            ciphertext: self.cipher.encrypt(body),
            created_at: Utc::now(),
        };
        self.groups.add_message(&message).await?;
        Ok(message)
    }

    /// Recent messages, decrypted for the requesting member.
    pub async fn messages(
        &self,
        group_id: &str,
        requester_id: &str,
    ) -> Result<Vec<(GroupMessage, Vec<u8>)>> {
        self.require_member(group_id, requester_id).await?;

        let messages = self.groups.messages(group_id, MESSAGE_PAGE).await?;
        messages
            .into_iter()
            .map(|message| {
                let plaintext = self
                    .cipher
                    .decrypt(&message.ciphertext)
                    .context("message decryption")?;
                Ok((message, plaintext))
            })
            .collect()
    }

    /// Owner deletes any message; members only their own.
    pub async fn delete_message(
        &self,
        group_id: &str,
        message_id: &str,
        requester_id: &str,
    ) -> Result<()> {
        let group = self
            .groups
            .get(group_id)
            .await?
            .ok_or_else(|| anyhow!("Group not found"))?;
        let message = self
            .groups
            .get_message(message_id)
            .await?
            .filter(|m| m.group_id == group_id)
            .ok_or_else(|| anyhow!("Message not found"))?;

        let is_owner = group.owner_id == requester_id;
        let is_sender = message.sender_id == requester_id;
        if !is_owner && !is_sender {
            return Err(PolicyError::NotAuthorized {
                reason: "only the group owner or the sender may delete a message".to_string(),
            }
            .into());
        }

        self.groups.delete_message(message_id).await
    }

    pub async fn leave(&self, group_id: &str, user_id: &str) -> Result<()> {
        let group = self
            .groups
            .get(group_id)
            .await?
            .ok_or_else(|| anyhow!("Group not found"))?;
        if group.owner_id == user_id {
            return Err(PolicyError::NotAuthorized {
                reason: "the owner cannot leave; delete the group instead".to_string(),
            }
            .into());
        }
        self.groups.remove_member(group_id, user_id).await
    }

    pub async fn delete_group(&self, group_id: &str, requester_id: &str) -> Result<()> {
        let group = self
            .groups
            .get(group_id)
            .await?
            .ok_or_else(|| anyhow!("Group not found"))?;
        if group.owner_id != requester_id {
            return Err(PolicyError::NotAuthorized {
                reason: "only the owner may delete a group".to_string(),
            }
            .into());
        }
        self.groups.delete(group_id).await
    }

    async fn require_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        let members = self.groups.members(group_id).await?;
        if members.iter().any(|m| m.user_id == user_id) {
            Ok(())
        } else {
            Err(PolicyError::NotAuthorized {
                reason: "not a member of this group".to_string(),
            }
            .into())
        }
    }

    async fn group_size_limit(&self, owner_id: &str) -> Result<u32> {
        let owner = self.users.get(owner_id).await?;
        let plan_id = owner.and_then(|u| u.current_plan_id);
        match plan_id {
            Some(plan_id) => Ok(self
                .plans
                .get(&plan_id)
                .await?
                .map(|plan| plan.max_group_size)
                .unwrap_or(DEFAULT_MAX_GROUP_SIZE)),
            None => Ok(DEFAULT_MAX_GROUP_SIZE),
        }
    }
}

fn generate_join_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::rng();
    (0..JOIN_CODE_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_code_shape() {
        let code = generate_join_code();
        assert_eq!(code.len(), JOIN_CODE_LEN);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
        // Ambiguous glyphs are excluded from the alphabet.
        assert!(!code.contains('O') && !code.contains('0') && !code.contains('I'));
    }
}
