//! FIFO dispatch loop.
//!
//! The dispatcher drains a queue of envelopes to quiescence. For each
//! dequeued envelope it walks the registry in stable name order; every
//! handler whose filter matches processes the same input in its own
//! transaction, and its emissions join the back of the queue. An envelope is
//! consumed after the pass; terminal states are recorded in the report.

use std::collections::VecDeque;
use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, error, warn};

use coterie_core::{DepRef, EventId, RequestId};

use crate::envelope::Envelope;
use crate::handler::HandlerError;
use crate::registry::HandlerRegistry;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The loop itself could not make progress (pool exhausted, commit
    /// failures). Per-envelope handler errors never surface here.
    #[error("dispatch transaction error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Terminal fate of one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Reached the projected state; read models now reflect it.
    Projected {
        event_type: String,
        event_id: EventId,
        request_id: Option<RequestId>,
    },
    /// Handed to the wire via the outbox.
    Sent { dest_ip: String, dest_port: u16 },
    /// Parked in the blocked table awaiting dependencies.
    Parked {
        event_id: Option<EventId>,
        missing: Vec<DepRef>,
        request_id: Option<RequestId>,
    },
    /// Dropped with a recorded reason (handler error or retry cap).
    Dropped {
        reason: String,
        request_id: Option<RequestId>,
    },
}

/// What one `run` call did.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<Outcome>,
    /// Envelopes dequeued, including intermediate stages.
    pub processed: u64,
}

impl DispatchReport {
    pub fn projected(&self) -> impl Iterator<Item = (&str, EventId, Option<RequestId>)> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Projected {
                event_type,
                event_id,
                request_id,
            } => Some((event_type.as_str(), *event_id, *request_id)),
            _ => None,
        })
    }

    /// Projected event id for a given request and type, if exactly one event
    /// of that type was produced under the request.
    pub fn unique_id_for(&self, request_id: RequestId, event_type: &str) -> Option<EventId> {
        let mut found = None;
        for (ty, id, rid) in self.projected() {
            if rid == Some(request_id) && ty == event_type {
                if found.is_some() {
                    return None;
                }
                found = Some(id);
            }
        }
        found
    }

    /// First recorded drop reason under a request, if any.
    pub fn first_drop_for(&self, request_id: RequestId) -> Option<&str> {
        self.outcomes.iter().find_map(|o| match o {
            Outcome::Dropped {
                reason,
                request_id: rid,
            } if *rid == Some(request_id) => Some(reason.as_str()),
            _ => None,
        })
    }

    pub fn parked(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Parked { .. }))
    }

    pub fn sent_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Sent { .. }))
            .count()
    }
}

/// Single-threaded cooperative dispatcher over a handler registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    pool: SqlitePool,
    retry_cap: u32,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, pool: SqlitePool, retry_cap: u32) -> Self {
        Self {
            registry,
            pool,
            retry_cap,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Drive the queue seeded with `seed` to quiescence.
    pub async fn run(&self, seed: Vec<Envelope>) -> Result<DispatchReport, DispatchError> {
        let mut queue: VecDeque<Envelope> = seed.into();
        let mut report = DispatchReport::default();

        while let Some(envelope) = queue.pop_front() {
            report.processed += 1;
            self.pass(envelope, &mut queue, &mut report).await?;
        }

        Ok(report)
    }

    /// One pass of a single envelope over the registry.
    async fn pass(
        &self,
        envelope: Envelope,
        queue: &mut VecDeque<Envelope>,
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        let mut matched = false;
        let mut emitted_any = false;

        for handler in self.registry.iter() {
            if !handler.filter(&envelope) {
                continue;
            }
            matched = true;

            let mut txn = self.pool.begin().await?;
            match handler.process(envelope.clone(), &mut txn).await {
                Ok(emitted) => {
                    txn.commit().await?;
                    for out in emitted {
                        emitted_any = true;
                        self.enqueue(out, &envelope, queue, report);
                    }
                }
                Err(err) => {
                    if let Err(rb) = txn.rollback().await {
                        warn!(handler = handler.name(), error = %rb, "rollback failed");
                    }
                    match &err {
                        HandlerError::Db(e) => {
                            warn!(handler = handler.name(), error = %e, "transient failure, envelope dropped")
                        }
                        other => {
                            error!(handler = handler.name(), error = %other, "envelope fatally dropped")
                        }
                    }
                    report.outcomes.push(Outcome::Dropped {
                        reason: format!("{}: {err}", handler.name()),
                        request_id: envelope.request_id,
                    });
                    // The envelope is gone; skip remaining handlers.
                    return Ok(());
                }
            }
        }

        if !matched || !emitted_any {
            self.record_terminal(&envelope, matched, report);
        }
        Ok(())
    }

    fn enqueue(
        &self,
        mut out: Envelope,
        input: &Envelope,
        queue: &mut VecDeque<Envelope>,
        report: &mut DispatchReport,
    ) {
        // Projected-state transition is recorded at emission time so the
        // outbound continuation of a self-created event does not hide it.
        if out.projected && !input.projected {
            if let (Some(ty), Some(id)) = (out.kind().map(str::to_string), out.event_id) {
                report.outcomes.push(Outcome::Projected {
                    event_type: ty,
                    event_id: id,
                    request_id: out.request_id,
                });
            }
        }

        // Loop protection: a continuation of the same event (same id, or
        // still id-less) counts against the retry budget. Envelopes re-woken
        // on behalf of a different event keep their own counter.
        if out.event_id == input.event_id {
            out.retry_count = input.retry_count + 1;
        }

        if out.retry_count > self.retry_cap {
            error!(
                event_id = ?out.event_id,
                retry_count = out.retry_count,
                "retry cap exceeded, envelope fatally dropped"
            );
            report.outcomes.push(Outcome::Dropped {
                reason: "retry cap exceeded".to_string(),
                request_id: out.request_id,
            });
            return;
        }

        queue.push_back(out);
    }

    fn record_terminal(&self, envelope: &Envelope, matched: bool, report: &mut DispatchReport) {
        if envelope.missing_deps {
            report.outcomes.push(Outcome::Parked {
                event_id: envelope.event_id,
                missing: envelope.missing_dep_list.clone(),
                request_id: envelope.request_id,
            });
        } else if envelope.outgoing && envelope.outgoing_checked && envelope.transit_ciphertext.is_some()
        {
            if let (Some(ip), Some(port)) = (envelope.dest_ip.clone(), envelope.dest_port) {
                report.outcomes.push(Outcome::Sent {
                    dest_ip: ip,
                    dest_port: port,
                });
            }
        } else {
            debug!(
                event_id = ?envelope.event_id,
                event_type = envelope.kind(),
                matched,
                "envelope reached quiescence"
            );
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.registry.names())
            .field("retry_cap", &self.retry_cap)
            .finish()
    }
}
