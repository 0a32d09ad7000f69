// Reconciliation of parsed provider events into the event store
//
// Every sighting either creates a row (first_seen_at = last_seen_at = sync time) or
// refreshes it (mutable fields overwritten, last_seen_at bumped). Nothing is ever
// deleted: a row missing from a feed simply stops having its last_seen_at advanced.

use std::collections::HashMap;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{ParsedEvent, ParsedPlan, ParsedZone};
use crate::store::{format_plan_time, format_timestamp, EventStore, StoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub created: usize,
    pub updated: usize,
}

/// Created/updated counts per level of the hierarchy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub events: Tally,
    pub plans: Tally,
    pub zones: Tally,
}

impl ReconcileCounts {
    pub fn created(&self) -> usize {
        self.events.created + self.plans.created + self.zones.created
    }

    pub fn updated(&self) -> usize {
        self.events.updated + self.plans.updated + self.zones.updated
    }

    fn merge(&mut self, other: &ReconcileCounts) {
        self.events.created += other.events.created;
        self.events.updated += other.events.updated;
        self.plans.created += other.plans.created;
        self.plans.updated += other.plans.updated;
        self.zones.created += other.zones.created;
        self.zones.updated += other.zones.updated;
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("storage failure in batch {batch_index}, earlier batches stay committed: {source}")]
    Storage {
        batch_index: usize,
        committed: ReconcileCounts,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Counts of the batches that were committed before the failure.
    pub fn committed(&self) -> ReconcileCounts {
        match self {
            ReconcileError::Storage { committed, .. } => *committed,
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: EventStore,
    batch_size: usize,
}

impl ReconciliationEngine {
    pub fn new(store: EventStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Upserts `events` for `provider_name`, one transaction per batch.
    ///
    /// A failing batch is rolled back on its own; batches committed before it stay
    /// applied and their counts are carried in the error.
    pub fn upsert(
        &self,
        provider_name: &str,
        events: &[ParsedEvent],
        synced_at: DateTime<Utc>,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let mut committed = ReconcileCounts::default();
        if events.is_empty() {
            debug!(provider = %provider_name, "nothing to reconcile");
            return Ok(committed);
        }

        // Stored timestamps keep microsecond precision.
        let synced_at = synced_at.trunc_subsecs(6);
        let events = collapse_duplicates(events);

        let mut conn = self.store.conn().map_err(|source| ReconcileError::Storage {
            batch_index: 0,
            committed,
            source,
        })?;

        for (batch_index, batch) in events.chunks(self.batch_size).enumerate() {
            match apply_batch(&mut conn, provider_name, batch, synced_at) {
                Ok(counts) => {
                    committed.merge(&counts);
                    debug!(
                        provider = %provider_name,
                        batch = batch_index,
                        size = batch.len(),
                        created = counts.created(),
                        updated = counts.updated(),
                        "batch committed"
                    );
                }
                Err(source) => {
                    error!(
                        provider = %provider_name,
                        batch = batch_index,
                        error = %source,
                        "batch rolled back"
                    );
                    return Err(ReconcileError::Storage {
                        batch_index,
                        committed,
                        source,
                    });
                }
            }
        }

        info!(
            provider = %provider_name,
            events = events.len(),
            created = committed.created(),
            updated = committed.updated(),
            "reconciliation finished"
        );

        Ok(committed)
    }
}

fn apply_batch(
    conn: &mut Connection,
    provider_name: &str,
    batch: &[ParsedEvent],
    synced_at: DateTime<Utc>,
) -> Result<ReconcileCounts, StoreError> {
    let seen_at = format_timestamp(synced_at);
    let mut counts = ReconcileCounts::default();

    // Dropping the transaction without commit rolls the whole batch back.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for event in batch {
        let event_id = upsert_event(&tx, provider_name, event, &seen_at, &mut counts)?;
        for plan in &event.plans {
            let plan_id = upsert_plan(&tx, event_id, plan, &seen_at, &mut counts)?;
            for zone in &plan.zones {
                upsert_zone(&tx, plan_id, zone, &seen_at, &mut counts)?;
            }
        }
    }
    tx.commit()?;

    Ok(counts)
}

fn upsert_event(
    conn: &Connection,
    provider_name: &str,
    event: &ParsedEvent,
    seen_at: &str,
    counts: &mut ReconcileCounts,
) -> Result<i64, StoreError> {
    let existing = conn
        .prepare_cached(
            "SELECT id, ever_online, last_seen_at FROM events WHERE provider_name = ?1 AND base_event_id = ?2",
        )?
        .query_row(params![provider_name, event.base_event_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?, row.get::<_, String>(2)?))
        })
        .optional()?;

    let observed_online = event.observed_online();

    match existing {
        None => {
            conn.prepare_cached(
                r#"
                INSERT INTO events (provider_name, base_event_id, title, organizer_company_id,
                                    ever_online, first_seen_at, last_seen_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                "#,
            )?
            .execute(params![
                provider_name,
                event.base_event_id,
                event.title,
                event.organizer_company_id,
                observed_online,
                seen_at
            ])?;
            counts.events.created += 1;
            Ok(conn.last_insert_rowid())
        }
        Some((id, ever_online, last_seen_at)) => {
            conn.prepare_cached(
                r#"
                UPDATE events
                SET title = ?2, organizer_company_id = ?3, ever_online = ?4, last_seen_at = ?5
                WHERE id = ?1
                "#,
            )?
            .execute(params![
                id,
                event.title,
                event.organizer_company_id,
                ever_online || observed_online,
                latest(&last_seen_at, seen_at)
            ])?;
            counts.events.updated += 1;
            Ok(id)
        }
    }
}

fn upsert_plan(
    conn: &Connection,
    event_id: i64,
    plan: &ParsedPlan,
    seen_at: &str,
    counts: &mut ReconcileCounts,
) -> Result<i64, StoreError> {
    let existing = conn
        .prepare_cached("SELECT id, last_seen_at FROM plans WHERE event_id = ?1 AND base_plan_id = ?2")?
        .query_row(params![event_id, plan.base_plan_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .optional()?;

    let starts_at = format_plan_time(plan.starts_at);
    let ends_at = format_plan_time(plan.ends_at);
    let sell_from = plan.sell_from.map(format_plan_time);
    let sell_to = plan.sell_to.map(format_plan_time);

    match existing {
        None => {
            conn.prepare_cached(
                r#"
                INSERT INTO plans (event_id, base_plan_id, sell_mode, starts_at, ends_at, sell_from,
                                   sell_to, sold_out, capacity, first_seen_at, last_seen_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                "#,
            )?
            .execute(params![
                event_id,
                plan.base_plan_id,
                plan.sell_mode.as_str(),
                starts_at,
                ends_at,
                sell_from,
                sell_to,
                plan.sold_out,
                plan.capacity,
                seen_at
            ])?;
            counts.plans.created += 1;
            Ok(conn.last_insert_rowid())
        }
        Some((id, last_seen_at)) => {
            conn.prepare_cached(
                r#"
                UPDATE plans
                SET sell_mode = ?2, starts_at = ?3, ends_at = ?4, sell_from = ?5, sell_to = ?6,
                    sold_out = ?7, capacity = ?8, last_seen_at = ?9
                WHERE id = ?1
                "#,
            )?
            .execute(params![
                id,
                plan.sell_mode.as_str(),
                starts_at,
                ends_at,
                sell_from,
                sell_to,
                plan.sold_out,
                plan.capacity,
                latest(&last_seen_at, seen_at)
            ])?;
            counts.plans.updated += 1;
            Ok(id)
        }
    }
}

fn upsert_zone(
    conn: &Connection,
    plan_id: i64,
    zone: &ParsedZone,
    seen_at: &str,
    counts: &mut ReconcileCounts,
) -> Result<(), StoreError> {
    let existing = conn
        .prepare_cached("SELECT id, last_seen_at FROM zones WHERE plan_id = ?1 AND base_zone_id = ?2")?
        .query_row(params![plan_id, zone.base_zone_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .optional()?;

    match existing {
        None => {
            conn.prepare_cached(
                r#"
                INSERT INTO zones (plan_id, base_zone_id, name, capacity, price, numbered,
                                   first_seen_at, last_seen_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                "#,
            )?
            .execute(params![
                plan_id,
                zone.base_zone_id,
                zone.name,
                zone.capacity,
                zone.price,
                zone.numbered,
                seen_at
            ])?;
            counts.zones.created += 1;
        }
        Some((id, last_seen_at)) => {
            conn.prepare_cached(
                r#"
                UPDATE zones
                SET name = ?2, capacity = ?3, price = ?4, numbered = ?5, last_seen_at = ?6
                WHERE id = ?1
                "#,
            )?
            .execute(params![
                id,
                zone.name,
                zone.capacity,
                zone.price,
                zone.numbered,
                latest(&last_seen_at, seen_at)
            ])?;
            counts.zones.updated += 1;
        }
    }

    Ok(())
}

// last_seen_at never moves backwards, even if an older run commits late.
fn latest<'a>(stored: &'a str, incoming: &'a str) -> &'a str {
    if stored > incoming {
        stored
    } else {
        incoming
    }
}

// Later occurrences of a key replace earlier ones, keeping the first position.
fn collapse_by_key<T: Clone>(items: &[T], key: impl Fn(&T) -> &str) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    let mut index: HashMap<&str, usize> = HashMap::new();
    for item in items {
        match index.get(key(item)) {
            Some(&i) => out[i] = item.clone(),
            None => {
                index.insert(key(item), out.len());
                out.push(item.clone());
            }
        }
    }
    out
}

fn collapse_duplicates(events: &[ParsedEvent]) -> Vec<ParsedEvent> {
    collapse_by_key(events, |e| e.base_event_id.as_str())
        .into_iter()
        .map(|mut event| {
            event.plans = collapse_by_key(&event.plans, |p| p.base_plan_id.as_str())
                .into_iter()
                .map(|mut plan| {
                    plan.zones = collapse_by_key(&plan.zones, |z| z.base_zone_id.as_str());
                    plan
                })
                .collect();
            event
        })
        .collect()
}
