//! The assembled node.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use coterie_core::{DepKind, DepRef, EventId, RequestId};
use coterie_crypto::CryptoCtx;
use coterie_handlers::{build_registry, HandlerConfig};
use coterie_pipeline::{DispatchReport, Dispatcher, Envelope};
use coterie_protocol::ops::{
    CommandCtx, FlowEmitter, Job, OpError, OpResponse, Operation, Reflector,
};
use coterie_store::{self as store, outbox, ReadOnlyDb, StoreError};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] coterie_pipeline::registry::RegistryError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] coterie_pipeline::dispatcher::DispatchError),
}

/// One node: database, handler pipeline, operation registry, jobs and
/// reflectors.
pub struct Substrate {
    pool: SqlitePool,
    dispatcher: Dispatcher,
    operations: BTreeMap<&'static str, Operation>,
    db: ReadOnlyDb,
    crypto: CryptoCtx,
    jobs: Vec<Arc<dyn Job>>,
    reflectors: Vec<Arc<dyn Reflector>>,
}

impl Substrate {
    pub async fn build(config: &Config) -> Result<Self, SubstrateError> {
        let crypto = CryptoCtx::new(config.crypto_mode);

        let pool = match &config.db_path {
            Some(path) => store::open(path).await?,
            None => store::open_in_memory().await?,
        };

        let validators = coterie_protocol::build_validators();
        let projectors = coterie_protocol::build_projectors();
        store::run_migrations(&pool, projectors.schemas()).await?;

        let registry = build_registry(
            HandlerConfig {
                crypto,
                ..HandlerConfig::default()
            },
            validators,
            projectors,
        )?;
        let dispatcher = Dispatcher::new(Arc::new(registry), pool.clone(), config.retry_cap);

        let operations = coterie_protocol::operations()
            .into_iter()
            .map(|op| (op.name(), op))
            .collect();

        info!(crypto_mode = ?config.crypto_mode, "substrate assembled");
        Ok(Self {
            db: ReadOnlyDb::new(pool.clone()),
            pool,
            dispatcher,
            operations,
            crypto,
            jobs: coterie_protocol::jobs_catalog(),
            reflectors: coterie_protocol::reflectors_catalog(),
        })
    }

    pub fn db(&self) -> &ReadOnlyDb {
        &self.db
    }

    pub fn operation_names(&self) -> Vec<&'static str> {
        self.operations.keys().copied().collect()
    }

    /// Execute a named operation: `params → {ids, data}`.
    pub async fn execute(&self, name: &str, params: JsonValue) -> Result<OpResponse, OpError> {
        let operation = self
            .operations
            .get(name)
            .ok_or_else(|| OpError::Unknown(name.to_string()))?;
        let request_id = RequestId::new();
        let now_ms = now_ms();

        match operation {
            Operation::Query(query) => {
                let data = query.run(params, &self.db).await?;
                Ok(OpResponse {
                    ids: BTreeMap::new(),
                    data,
                })
            }

            Operation::Command(command) => {
                let ctx = CommandCtx {
                    request_id,
                    now_ms,
                    crypto: self.crypto,
                };
                let envelopes = command.build(params, &ctx)?;
                let report = self
                    .dispatcher
                    .run(envelopes)
                    .await
                    .map_err(|e| OpError::Pipeline(e.to_string()))?;

                let ids = collect_ids(&report, request_id);
                if ids.is_empty() {
                    if let Some(reason) = report.first_drop_for(request_id) {
                        return Err(OpError::Pipeline(reason.to_string()));
                    }
                }
                Ok(OpResponse {
                    ids,
                    data: JsonValue::Null,
                })
            }

            Operation::Flow(flow) => {
                let mut ctx = FlowCtx {
                    dispatcher: &self.dispatcher,
                    db: &self.db,
                    crypto: &self.crypto,
                    request_id,
                    now_ms,
                    collected: Vec::new(),
                };
                let data = flow.run(params, &mut ctx).await?;

                let mut counts: BTreeMap<String, usize> = BTreeMap::new();
                for (ty, _) in &ctx.collected {
                    *counts.entry(ty.clone()).or_default() += 1;
                }
                let ids = ctx
                    .collected
                    .into_iter()
                    .filter(|(ty, _)| counts.get(ty) == Some(&1))
                    .collect();

                Ok(OpResponse { ids, data })
            }
        }
    }

    /// Feed one inbound datagram through the pipeline, then run reflectors
    /// on whatever projected, feeding their emissions back in until quiet.
    pub async fn ingest_datagram(
        &self,
        raw_data: Vec<u8>,
        origin_ip: &str,
        origin_port: u16,
        now_ms: i64,
    ) -> Result<DispatchReport, SubstrateError> {
        let envelope =
            Envelope::from_datagram(raw_data, origin_ip.to_string(), origin_port, now_ms);
        let mut report = self.dispatcher.run(vec![envelope]).await?;

        let mut pending: Vec<(String, EventId)> = report
            .projected()
            .map(|(ty, id, _)| (ty.to_string(), id))
            .collect();
        let mut visited: HashSet<EventId> = pending.iter().map(|(_, id)| *id).collect();

        while let Some((event_type, event_id)) = pending.pop() {
            for reflector in &self.reflectors {
                if !reflector.event_types().contains(&event_type.as_str()) {
                    continue;
                }
                let Some(envelope) = self.reload_projected(event_id).await? else {
                    continue;
                };
                let emissions = match reflector.run(&envelope, &self.db, now_ms).await {
                    Ok(emissions) => emissions,
                    Err(e) => {
                        warn!(reflector = reflector.name(), error = %e, "reflector failed");
                        continue;
                    }
                };
                if emissions.is_empty() {
                    continue;
                }

                let sub = self.dispatcher.run(emissions).await?;
                for (ty, id, _) in sub.projected() {
                    if visited.insert(id) {
                        pending.push((ty.to_string(), id));
                    }
                }
                report.outcomes.extend(sub.outcomes);
                report.processed += sub.processed;
            }
        }

        Ok(report)
    }

    /// Run every job once against `now_ms`.
    pub async fn tick_jobs(&self, now_ms: i64) -> Result<(), SubstrateError> {
        for job in &self.jobs {
            let state = {
                let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
                store::jobs::load_state(&mut conn, job.name())
                    .await?
                    .unwrap_or_else(|| json!({}))
            };

            let outcome = job.run(state, &self.db, now_ms).await;

            let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
            if outcome.ok {
                store::jobs::save_state(&mut conn, job.name(), &outcome.state, now_ms).await?;
                store::jobs::record_run(&mut conn, job.name(), now_ms, true, None).await?;
                drop(conn);
                if !outcome.envelopes.is_empty() {
                    self.dispatcher.run(outcome.envelopes).await?;
                }
            } else {
                warn!(job = job.name(), error = ?outcome.error, "job failed");
                store::jobs::record_run(&mut conn, job.name(), now_ms, false, outcome.error.as_deref())
                    .await?;
            }
        }
        Ok(())
    }

    /// Outbox entries the wire should transmit now.
    pub async fn outbox_due(
        &self,
        now_ms: i64,
    ) -> Result<Vec<store::outbox::OutboxRow>, SubstrateError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        Ok(outbox::due(&mut conn, now_ms).await?)
    }

    pub async fn mark_sent(&self, outbox_id: i64, sent_at: i64) -> Result<(), SubstrateError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        Ok(outbox::mark_sent(&mut conn, outbox_id, sent_at).await?)
    }

    /// Rebuild a projected event as an envelope for reflector input. Author
    /// attribution is recovered from the plaintext's first peer dep.
    async fn reload_projected(
        &self,
        event_id: EventId,
    ) -> Result<Option<Envelope>, SubstrateError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::from)?;
        let Some(stored) = store::event_store::get(&mut conn, event_id).await? else {
            return Ok(None);
        };
        if stored.purged {
            return Ok(None);
        }

        let mut envelope = Envelope {
            event_id: Some(stored.event_id),
            event_type: Some(stored.event_type),
            event_plaintext: stored.plaintext,
            received_at: stored.received_at,
            origin_ip: stored.origin_ip,
            origin_port: stored.origin_port,
            validated: true,
            stored: true,
            keys_stored: true,
            projected: true,
            ..Envelope::default()
        };
        // Locally created events have no origin; reflectors use this to
        // skip them.
        envelope.self_created = envelope.origin_ip.is_none();

        if let Some(plaintext) = envelope.event_plaintext.clone() {
            envelope.peer_id = plaintext
                .get("deps")
                .and_then(JsonValue::as_array)
                .and_then(|deps| {
                    deps.iter().find_map(|d| {
                        let dep = DepRef::parse(d.as_str()?).ok()?;
                        (dep.kind == DepKind::Peer)
                            .then(|| EventId::from_hex(&dep.id).ok())
                            .flatten()
                    })
                });
            envelope.network_id = plaintext
                .get("network_id")
                .or_else(|| plaintext.get("group_id"))
                .and_then(JsonValue::as_str)
                .and_then(|s| EventId::from_hex(s).ok());
        }

        Ok(Some(envelope))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn collect_ids(report: &DispatchReport, request_id: RequestId) -> BTreeMap<String, EventId> {
    let mut counts: BTreeMap<String, Vec<EventId>> = BTreeMap::new();
    for (ty, id, rid) in report.projected() {
        if rid == Some(request_id) {
            counts.entry(ty.to_string()).or_default().push(id);
        }
    }
    counts
        .into_iter()
        .filter_map(|(ty, ids)| (ids.len() == 1).then(|| (ty, ids[0])))
        .collect()
}

/// Flow runtime: drives the dispatcher per emission and records ids.
struct FlowCtx<'a> {
    dispatcher: &'a Dispatcher,
    db: &'a ReadOnlyDb,
    crypto: &'a CryptoCtx,
    request_id: RequestId,
    now_ms: i64,
    collected: Vec<(String, EventId)>,
}

#[async_trait]
impl FlowEmitter for FlowCtx<'_> {
    async fn emit(&mut self, envelope: Envelope) -> Result<EventId, OpError> {
        let event_type = envelope
            .kind()
            .map(str::to_string)
            .ok_or_else(|| OpError::InvalidParams("emit without event type".into()))?;

        let report = self
            .dispatcher
            .run(vec![envelope])
            .await
            .map_err(|e| OpError::Pipeline(e.to_string()))?;

        if let Some(id) = report.unique_id_for(self.request_id, &event_type) {
            self.collected.push((event_type, id));
            return Ok(id);
        }
        if let Some(reason) = report.first_drop_for(self.request_id) {
            return Err(OpError::Pipeline(reason.to_string()));
        }
        if report.parked().next().is_some() {
            return Err(OpError::Pipeline(format!(
                "{event_type} parked on missing dependencies"
            )));
        }
        Err(OpError::Pipeline(format!(
            "{event_type} did not reach projection"
        )))
    }

    fn request_id(&self) -> RequestId {
        self.request_id
    }

    fn now_ms(&self) -> i64 {
        self.now_ms
    }

    fn crypto(&self) -> &CryptoCtx {
        self.crypto
    }

    fn db(&self) -> &ReadOnlyDb {
        self.db
    }
}
