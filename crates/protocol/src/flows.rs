//! Flows: sequential multi-event orchestration.
//!
//! Each `emit` drives the pipeline to completion and returns the derived
//! event id, so later steps reference earlier ids directly. Flows see
//! projected state through the read-only facade between emissions.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use coterie_core::{DepKind, DepRef, EventId, KeyId, Secret};
use coterie_handlers::canonical;
use coterie_pipeline::{Envelope, LocalMetadata};
use coterie_store::ReadOnlyDb;

use crate::events;
use crate::invite::InvitePayload;
use crate::ops::{require_id, require_str, require_u16, FlowEmitter, FlowOp, OpError, QueryOp};

fn identity_dep(identity_id: EventId) -> DepRef {
    DepRef::new(DepKind::Identity, identity_id.to_hex())
}

fn query_failed(e: coterie_store::StoreError) -> OpError {
    OpError::Failed(e.to_string())
}

/// The identity's published keys, from projected state.
async fn identity_keys(
    db: &ReadOnlyDb,
    identity_id: EventId,
) -> Result<([u8; 32], [u8; 32]), OpError> {
    let row = db
        .query_one(
            "SELECT sign_pub, seal_pub FROM identities WHERE identity_id = ?1",
            &[json!(identity_id.to_hex())],
        )
        .await
        .map_err(query_failed)?
        .ok_or_else(|| OpError::NotFound(format!("identity {identity_id}")))?;

    let decode = |key: &str| -> Result<[u8; 32], OpError> {
        row.get(key)
            .and_then(JsonValue::as_str)
            .and_then(|s| hex::decode(s).ok())
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| OpError::Failed(format!("identity row missing {key}")))
    };
    Ok((decode("sign_pub")?, decode("seal_pub")?))
}

/// The group's event key id, from projected state.
async fn group_key_id(db: &ReadOnlyDb, group_id: EventId) -> Result<KeyId, OpError> {
    let row = db
        .query_one(
            "SELECT key_id FROM groups WHERE group_id = ?1",
            &[json!(group_id.to_hex())],
        )
        .await
        .map_err(query_failed)?
        .ok_or_else(|| OpError::NotFound(format!("group {group_id}")))?;

    row.get("key_id")
        .and_then(JsonValue::as_str)
        .and_then(|s| KeyId::from_hex(s).ok())
        .ok_or_else(|| OpError::Failed("group row missing key_id".into()))
}

/// This identity's peer and membership on a network.
async fn member_context(
    db: &ReadOnlyDb,
    identity_id: EventId,
    group_id: EventId,
) -> Result<(EventId, EventId), OpError> {
    let peer_row = db
        .query_one(
            "SELECT peer_id FROM peers WHERE identity_id = ?1 AND network_id = ?2",
            &[json!(identity_id.to_hex()), json!(group_id.to_hex())],
        )
        .await
        .map_err(query_failed)?
        .ok_or_else(|| OpError::NotFound(format!("no peer for identity {identity_id}")))?;
    let peer_id = peer_row
        .get("peer_id")
        .and_then(JsonValue::as_str)
        .and_then(|s| EventId::from_hex(s).ok())
        .ok_or_else(|| OpError::Failed("peer row corrupt".into()))?;

    let member_row = db
        .query_one(
            "SELECT member_id FROM group_members WHERE peer_id = ?1 AND group_id = ?2",
            &[json!(peer_id.to_hex()), json!(group_id.to_hex())],
        )
        .await
        .map_err(query_failed)?
        .ok_or_else(|| OpError::NotFound(format!("peer {peer_id} is not a member")))?;
    let member_id = member_row
        .get("member_id")
        .and_then(JsonValue::as_str)
        .and_then(|s| EventId::from_hex(s).ok())
        .ok_or_else(|| OpError::Failed("membership row corrupt".into()))?;

    Ok((peer_id, member_id))
}

/// `group.create {name, username, identity_id}`: bootstrap a network:
/// group (minting its event and transit keys), founding peer, founding
/// user, and a `general` channel.
pub struct GroupCreate;

#[async_trait]
impl FlowOp for GroupCreate {
    fn name(&self) -> &'static str {
        "group.create"
    }

    async fn run(
        &self,
        params: JsonValue,
        ctx: &mut dyn FlowEmitter,
    ) -> Result<JsonValue, OpError> {
        let name = require_str(&params, "name")?.to_string();
        let username = require_str(&params, "username")?.to_string();
        let identity_id = require_id(&params, "identity_id")?;
        let now = ctx.now_ms();

        let (sign_pub, seal_pub) = identity_keys(ctx.db(), identity_id).await?;

        let event_key_secret = ctx.crypto().generate_secret();
        let transit_secret = ctx.crypto().generate_secret();
        let key_id = coterie_crypto::hashing::key_id(&event_key_secret);

        // The group event is the network; its keys ride along as local
        // metadata for the keys handler.
        let mut group = Envelope::self_created(
            events::GROUP,
            events::group(&name, key_id, &sign_pub, now),
            vec![identity_dep(identity_id)],
            ctx.request_id(),
        );
        group.local_metadata = Some(LocalMetadata {
            event_key_secret: Some(event_key_secret),
            transit_secret: Some(transit_secret),
            ..LocalMetadata::default()
        });
        let group_id = ctx.emit(group).await?;

        let mut peer = Envelope::self_created(
            events::PEER,
            events::peer(identity_id, group_id, &sign_pub, &seal_pub, now),
            vec![identity_dep(identity_id)],
            ctx.request_id(),
        );
        peer.network_id = Some(group_id);
        let peer_id = ctx.emit(peer).await?;

        let mut user = Envelope::self_created(
            events::USER,
            events::user(&username, peer_id, group_id, "founder", now),
            vec![
                identity_dep(identity_id),
                DepRef::new(DepKind::Peer, peer_id.to_hex()),
                DepRef::new(DepKind::Group, group_id.to_hex()),
            ],
            ctx.request_id(),
        );
        user.peer_id = Some(peer_id);
        let user_id = ctx.emit(user).await?;

        let mut channel = Envelope::self_created(
            events::CHANNEL,
            events::channel("general", group_id, key_id, peer_id, user_id, now),
            vec![
                identity_dep(identity_id),
                DepRef::new(DepKind::Peer, peer_id.to_hex()),
                DepRef::new(DepKind::Group, group_id.to_hex()),
            ],
            ctx.request_id(),
        );
        channel.peer_id = Some(peer_id);
        let channel_id = ctx.emit(channel).await?;

        Ok(json!({
            "group_id": group_id.to_hex(),
            "default_channel_id": channel_id.to_hex(),
        }))
    }
}

/// `channel.create {name, group_id, identity_id}`.
pub struct ChannelCreate;

#[async_trait]
impl FlowOp for ChannelCreate {
    fn name(&self) -> &'static str {
        "channel.create"
    }

    async fn run(
        &self,
        params: JsonValue,
        ctx: &mut dyn FlowEmitter,
    ) -> Result<JsonValue, OpError> {
        let name = require_str(&params, "name")?.to_string();
        let group_id = require_id(&params, "group_id")?;
        let identity_id = require_id(&params, "identity_id")?;
        let now = ctx.now_ms();

        let key_id = group_key_id(ctx.db(), group_id).await?;
        let (peer_id, member_id) = member_context(ctx.db(), identity_id, group_id).await?;

        let mut channel = Envelope::self_created(
            events::CHANNEL,
            events::channel(&name, group_id, key_id, peer_id, member_id, now),
            vec![
                identity_dep(identity_id),
                DepRef::new(DepKind::Peer, peer_id.to_hex()),
                DepRef::new(DepKind::Group, group_id.to_hex()),
            ],
            ctx.request_id(),
        );
        channel.peer_id = Some(peer_id);
        let channel_id = ctx.emit(channel).await?;

        Ok(json!({ "channel_id": channel_id.to_hex() }))
    }
}

/// `message.create {channel_id, content, identity_id}`.
pub struct MessageCreate;

#[async_trait]
impl FlowOp for MessageCreate {
    fn name(&self) -> &'static str {
        "message.create"
    }

    async fn run(
        &self,
        params: JsonValue,
        ctx: &mut dyn FlowEmitter,
    ) -> Result<JsonValue, OpError> {
        let channel_id = require_id(&params, "channel_id")?;
        let content = require_str(&params, "content")?.to_string();
        let identity_id = require_id(&params, "identity_id")?;
        let now = ctx.now_ms();

        if content.len() > events::MAX_CONTENT_LEN {
            return Err(OpError::InvalidParams("content too long".into()));
        }

        let channel_row = ctx
            .db()
            .query_one(
                "SELECT group_id FROM channels WHERE channel_id = ?1",
                &[json!(channel_id.to_hex())],
            )
            .await
            .map_err(query_failed)?
            .ok_or_else(|| OpError::NotFound(format!("channel {channel_id}")))?;
        let group_id = channel_row
            .get("group_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| EventId::from_hex(s).ok())
            .ok_or_else(|| OpError::Failed("channel row corrupt".into()))?;

        let (peer_id, member_id) = member_context(ctx.db(), identity_id, group_id).await?;

        let mut message = Envelope::self_created(
            events::MESSAGE,
            events::message(&content, channel_id, group_id, peer_id, member_id, now),
            vec![
                identity_dep(identity_id),
                DepRef::new(DepKind::Channel, channel_id.to_hex()),
            ],
            ctx.request_id(),
        );
        message.peer_id = Some(peer_id);
        ctx.emit(message).await?;

        crate::queries::MessageList
            .run(json!({"channel_id": channel_id.to_hex()}), ctx.db())
            .await
    }
}

/// `invite.create {group_id, identity_id, ip, port}`: records an issued
/// invite locally and returns the link to hand out of band.
pub struct InviteCreate;

#[async_trait]
impl FlowOp for InviteCreate {
    fn name(&self) -> &'static str {
        "invite.create"
    }

    async fn run(
        &self,
        params: JsonValue,
        ctx: &mut dyn FlowEmitter,
    ) -> Result<JsonValue, OpError> {
        let group_id = require_id(&params, "group_id")?;
        let identity_id = require_id(&params, "identity_id")?;
        let ip = require_str(&params, "ip")?.to_string();
        let port = require_u16(&params, "port")?;
        let now = ctx.now_ms();

        let key_id = group_key_id(ctx.db(), group_id).await?;
        let event_key_secret = secret_from_table(ctx.db(), "event_keys", key_id).await?;

        let transit_row = ctx
            .db()
            .query_one(
                "SELECT key_id, secret FROM transit_keys WHERE network_id = ?1 ORDER BY created_at DESC LIMIT 1",
                &[json!(group_id.to_hex())],
            )
            .await
            .map_err(query_failed)?
            .ok_or_else(|| OpError::NotFound(format!("no transit key for {group_id}")))?;
        let transit_key_id = transit_row
            .get("key_id")
            .and_then(JsonValue::as_str)
            .and_then(|s| KeyId::from_hex(s).ok())
            .ok_or_else(|| OpError::Failed("transit key row corrupt".into()))?;
        let transit_secret = transit_row
            .get("secret")
            .and_then(JsonValue::as_str)
            .and_then(|s| Secret::from_hex(s).ok())
            .ok_or_else(|| OpError::Failed("transit key row corrupt".into()))?;

        let invite_code = ctx.crypto().generate_secret().to_hex()[..16].to_string();

        let invite = {
            let mut envelope = Envelope::self_created(
                events::INVITE,
                events::invite_record(&invite_code, group_id, key_id, now),
                vec![identity_dep(identity_id)],
                ctx.request_id(),
            );
            envelope.local_only = true;
            envelope.network_id = Some(group_id);
            envelope
        };
        let invite_id = ctx.emit(invite).await?;

        let link = InvitePayload {
            network_id: group_id,
            group_id,
            invite_code,
            event_key_id: key_id,
            event_key_secret,
            transit_key_id,
            transit_secret,
            inviter_ip: ip,
            inviter_port: port,
        }
        .encode()
        .map_err(|e| OpError::Failed(e.to_string()))?;

        Ok(json!({ "invite_id": invite_id.to_hex(), "invite_link": link }))
    }
}

/// `user.join_as_user {invite_link, name}`: identity (local-only), local
/// invite record carrying the bootstrap secrets, peer depending on the
/// identity, then user depending on peer and invite.
pub struct JoinAsUser;

#[async_trait]
impl FlowOp for JoinAsUser {
    fn name(&self) -> &'static str {
        "user.join_as_user"
    }

    async fn run(
        &self,
        params: JsonValue,
        ctx: &mut dyn FlowEmitter,
    ) -> Result<JsonValue, OpError> {
        let link = require_str(&params, "invite_link")?;
        let name = require_str(&params, "name")?.to_string();
        let payload = InvitePayload::decode(link).map_err(|e| OpError::InvalidParams(e.to_string()))?;
        let now = ctx.now_ms();

        let seed = ctx.crypto().generate_secret();
        let sign_pub = ctx.crypto().signing_public_key(&seed);
        let seal_pub = ctx.crypto().sealing_public_key(&seed);

        let mut identity = Envelope::self_created(
            events::IDENTITY,
            events::identity(&name, &sign_pub, &seal_pub, now),
            vec![],
            ctx.request_id(),
        );
        identity.local_only = true;
        identity.local_metadata = Some(LocalMetadata {
            private_key: Some(seed),
            ..LocalMetadata::default()
        });
        let identity_id = ctx.emit(identity).await?;

        // The invite record carries the shared secrets and the inviter's
        // address into local storage.
        let mut invite = Envelope::self_created(
            events::INVITE,
            events::invite_record(&payload.invite_code, payload.group_id, payload.event_key_id, now),
            vec![identity_dep(identity_id)],
            ctx.request_id(),
        );
        invite.local_only = true;
        invite.network_id = Some(payload.network_id);
        invite.local_metadata = Some(LocalMetadata {
            event_key_secret: Some(payload.event_key_secret.clone()),
            transit_secret: Some(payload.transit_secret.clone()),
            bootstrap_addr: Some((payload.inviter_ip.clone(), payload.inviter_port)),
            ..LocalMetadata::default()
        });
        let invite_id = ctx.emit(invite).await?;

        let mut peer = Envelope::self_created(
            events::PEER,
            events::peer(identity_id, payload.network_id, &sign_pub, &seal_pub, now),
            vec![
                identity_dep(identity_id),
                DepRef::new(DepKind::Invite, invite_id.to_hex()),
            ],
            ctx.request_id(),
        );
        peer.network_id = Some(payload.network_id);
        let peer_id = ctx.emit(peer).await?;

        let mut user = Envelope::self_created(
            events::USER,
            events::user(&name, peer_id, payload.group_id, &payload.invite_code, now),
            vec![
                identity_dep(identity_id),
                DepRef::new(DepKind::Peer, peer_id.to_hex()),
                DepRef::new(DepKind::Invite, invite_id.to_hex()),
            ],
            ctx.request_id(),
        );
        user.peer_id = Some(peer_id);
        user.network_id = Some(payload.network_id);
        let user_id = ctx.emit(user).await?;

        let data = ctx
            .db()
            .query_one(
                "SELECT user_id, name, peer_id, group_id FROM users WHERE user_id = ?1",
                &[json!(user_id.to_hex())],
            )
            .await
            .map_err(query_failed)?;

        Ok(json!({ "user": data.map(JsonValue::Object).unwrap_or(JsonValue::Null) }))
    }
}

/// `key.create {group_id, peer_id, identity_id}`: deliver the group's
/// event key to a peer as a sealed box. Key events are unsigned; the id is
/// the content address of the unsigned canonical form.
pub struct KeyCreate;

#[async_trait]
impl FlowOp for KeyCreate {
    fn name(&self) -> &'static str {
        "key.create"
    }

    async fn run(
        &self,
        params: JsonValue,
        ctx: &mut dyn FlowEmitter,
    ) -> Result<JsonValue, OpError> {
        let group_id = require_id(&params, "group_id")?;
        let recipient = require_id(&params, "peer_id")?;
        let identity_id = require_id(&params, "identity_id")?;
        let now = ctx.now_ms();

        let key_id = group_key_id(ctx.db(), group_id).await?;
        let secret = secret_from_table(ctx.db(), "event_keys", key_id).await?;

        let plaintext = events::key(key_id, &secret.to_hex(), group_id, now);
        let event_id = canonical::compute_event_id(&plaintext)
            .map_err(|e| OpError::Failed(e.to_string()))?;

        let mut envelope = Envelope::self_created(
            events::KEY,
            plaintext,
            vec![
                identity_dep(identity_id),
                DepRef::new(DepKind::Peer, recipient.to_hex()),
            ],
            ctx.request_id(),
        );
        envelope.event_id = Some(event_id);
        envelope.sig_checked = true;
        envelope.validated = true;
        envelope.network_id = Some(group_id);
        let delivered = ctx.emit(envelope).await?;

        Ok(json!({ "key_event_id": delivered.to_hex() }))
    }
}

/// Fetch a symmetric secret from one of the two key tables by key id.
async fn secret_from_table(db: &ReadOnlyDb, table: &str, key_id: KeyId) -> Result<Secret, OpError> {
    let sql = if table == "event_keys" {
        "SELECT secret FROM event_keys WHERE key_id = ?1"
    } else {
        "SELECT secret FROM transit_keys WHERE key_id = ?1"
    };
    let row = db
        .query_one(sql, &[json!(key_id.to_hex())])
        .await
        .map_err(query_failed)?
        .ok_or_else(|| OpError::NotFound(format!("key {key_id}")))?;

    row.get("secret")
        .and_then(JsonValue::as_str)
        .and_then(|s| Secret::from_hex(s).ok())
        .ok_or_else(|| OpError::Failed("key row corrupt".into()))
}
