//! Reconciliation Engine (C14): proves that every locally recorded order is
//! present at the broker with matching economics.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::models::Deal;

const FIELD_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalOrderRecord {
    pub ticket: Option<i64>,
    pub client_order_id: Uuid,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub commission: f64,
    pub swap: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    Match,
    Mismatch,
    Ghost,
    Orphan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRow {
    pub kind: RowKind,
    pub ticket: Option<i64>,
    pub client_order_id: Option<Uuid>,
    pub symbol: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub rows: Vec<ReconciliationRow>,
    pub match_rate: f64,
}

pub struct ReconciliationEngine {
    breaker: Arc<CircuitBreaker>,
}

impl ReconciliationEngine {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    /// Matches by `(ticket, client_order_id)`. An unmatched local record is
    /// a "ghost order"; an unmatched broker record is an "orphan deal". Any
    /// field mismatch within a match raises a RECONCILIATION_ERROR and
    /// engages the circuit breaker.
    pub fn reconcile(
        &self,
        local: &[LocalOrderRecord],
        broker: &[Deal],
    ) -> ReconciliationReport {
        let mut broker_by_ticket: HashMap<i64, &Deal> =
            broker.iter().map(|d| (d.ticket, d)).collect();
        let mut rows = Vec::new();
        let mut matched = 0usize;
        let total = local.len().max(broker.len()).max(1);

        for record in local {
            let Some(ticket) = record.ticket else {
                rows.push(ReconciliationRow {
                    kind: RowKind::Ghost,
                    ticket: None,
                    client_order_id: Some(record.client_order_id),
                    symbol: Some(record.symbol.clone()),
                    detail: Some("local order has no broker ticket".to_string()),
                });
                continue;
            };
            match broker_by_ticket.remove(&ticket) {
                Some(deal) => {
                    if let Some(mismatch) = field_mismatch(record, deal) {
                        error!(ticket, mismatch = %mismatch, "reconciliation mismatch");
                        self.breaker.engage(
                            "RECONCILIATION_ERROR",
                            serde_json::json!({"ticket": ticket, "mismatch": mismatch}),
                        );
                        rows.push(ReconciliationRow {
                            kind: RowKind::Mismatch,
                            ticket: Some(ticket),
                            client_order_id: Some(record.client_order_id),
                            symbol: Some(record.symbol.clone()),
                            detail: Some(mismatch),
                        });
                    } else {
                        matched += 1;
                        rows.push(ReconciliationRow {
                            kind: RowKind::Match,
                            ticket: Some(ticket),
                            client_order_id: Some(record.client_order_id),
                            symbol: Some(record.symbol.clone()),
                            detail: None,
                        });
                    }
                }
                None => {
                    rows.push(ReconciliationRow {
                        kind: RowKind::Ghost,
                        ticket: Some(ticket),
                        client_order_id: Some(record.client_order_id),
                        symbol: Some(record.symbol.clone()),
                        detail: Some("no matching broker deal".to_string()),
                    });
                }
            }
        }

        for (ticket, deal) in broker_by_ticket {
            rows.push(ReconciliationRow {
                kind: RowKind::Orphan,
                ticket: Some(ticket),
                client_order_id: deal.client_order_id,
                symbol: Some(deal.symbol.clone()),
                detail: Some("broker deal has no matching local record".to_string()),
            });
        }

        ReconciliationReport {
            rows,
            match_rate: matched as f64 / total as f64,
        }
    }
}

fn field_mismatch(local: &LocalOrderRecord, deal: &Deal) -> Option<String> {
    let checks = [
        ("price", local.price, deal.price),
        ("volume", local.volume, deal.volume),
        ("commission", local.commission, deal.commission),
        ("swap", local.swap, deal.swap),
        ("profit", local.profit, deal.profit),
    ];
    for (field, a, b) in checks {
        if (a - b).abs() > FIELD_TOLERANCE {
            return Some(format!("{field} differs: local={a} broker={b}"));
        }
    }
    None
}
