//! Read-only queries against projected state.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use coterie_store::ReadOnlyDb;

use crate::ops::{require_str, OpError, QueryOp};

fn rows_to_json(rows: Vec<serde_json::Map<String, JsonValue>>) -> JsonValue {
    JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect())
}

fn query_failed(e: coterie_store::StoreError) -> OpError {
    OpError::Failed(e.to_string())
}

/// `message.list {channel_id}`: messages in a channel, oldest first.
pub struct MessageList;

#[async_trait]
impl QueryOp for MessageList {
    fn name(&self) -> &'static str {
        "message.list"
    }

    async fn run(&self, params: JsonValue, db: &ReadOnlyDb) -> Result<JsonValue, OpError> {
        let channel_id = require_str(&params, "channel_id")?;
        let rows = db
            .query(
                r#"
                SELECT message_id, channel_id, group_id, peer_id, sender_member_id, content, created_at
                FROM messages
                WHERE channel_id = ?1
                ORDER BY created_at ASC, message_id ASC
                "#,
                &[json!(channel_id)],
            )
            .await
            .map_err(query_failed)?;
        Ok(json!({ "messages": rows_to_json(rows) }))
    }
}

/// `channel.list {group_id}`.
pub struct ChannelList;

#[async_trait]
impl QueryOp for ChannelList {
    fn name(&self) -> &'static str {
        "channel.list"
    }

    async fn run(&self, params: JsonValue, db: &ReadOnlyDb) -> Result<JsonValue, OpError> {
        let group_id = require_str(&params, "group_id")?;
        let rows = db
            .query(
                r#"
                SELECT channel_id, group_id, name, created_at
                FROM channels
                WHERE group_id = ?1
                ORDER BY created_at ASC, channel_id ASC
                "#,
                &[json!(group_id)],
            )
            .await
            .map_err(query_failed)?;
        Ok(json!({ "channels": rows_to_json(rows) }))
    }
}

/// `user.list {group_id}`.
pub struct UserList;

#[async_trait]
impl QueryOp for UserList {
    fn name(&self) -> &'static str {
        "user.list"
    }

    async fn run(&self, params: JsonValue, db: &ReadOnlyDb) -> Result<JsonValue, OpError> {
        let group_id = require_str(&params, "group_id")?;
        let rows = db
            .query(
                r#"
                SELECT user_id, name, peer_id, group_id, created_at
                FROM users
                WHERE group_id = ?1
                ORDER BY created_at ASC, user_id ASC
                "#,
                &[json!(group_id)],
            )
            .await
            .map_err(query_failed)?;
        Ok(json!({ "users": rows_to_json(rows) }))
    }
}

/// `group.members {group_id}`: the membership table joined to user names.
pub struct GroupMembers;

#[async_trait]
impl QueryOp for GroupMembers {
    fn name(&self) -> &'static str {
        "group.members"
    }

    async fn run(&self, params: JsonValue, db: &ReadOnlyDb) -> Result<JsonValue, OpError> {
        let group_id = require_str(&params, "group_id")?;
        let rows = db
            .query(
                r#"
                SELECT gm.member_id, gm.group_id, gm.peer_id, gm.joined_at, u.name
                FROM group_members gm
                LEFT JOIN users u ON u.user_id = gm.member_id
                WHERE gm.group_id = ?1
                ORDER BY gm.joined_at ASC, gm.member_id ASC
                "#,
                &[json!(group_id)],
            )
            .await
            .map_err(query_failed)?;
        Ok(json!({ "members": rows_to_json(rows) }))
    }
}
