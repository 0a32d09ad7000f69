// Read side of the event store: range search over plan start times
//
// This never touches a provider, so it keeps answering from stored data while
// every feed is down.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{EventRecord, PlanRecord, SellMode, ZoneRecord};
use crate::store::{
    format_plan_time, parse_optional_timestamp, parse_plan_time, parse_timestamp, EventStore, StoreError,
};

/// Explicit staleness and catalogue filtering for [`search`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Also return records that were missing from their provider's last complete sync.
    pub include_stale: bool,
    /// Only events that were sold online at least once.
    pub ever_online_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    pub id: i64,
    pub title: String,
    pub start_date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_date: Option<NaiveDate>,
    pub end_time: Option<NaiveTime>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

impl EventSummary {
    pub fn from_record(event: &EventRecord) -> Self {
        let start = event.plans.iter().map(|p| p.starts_at).min();
        let end = event.plans.iter().map(|p| p.ends_at).max();
        let prices = event
            .plans
            .iter()
            .flat_map(|p| p.zones.iter().map(|z| z.price));

        let (min_price, max_price) = prices.fold((None, None), |(min, max): (Option<f64>, Option<f64>), price| {
            (
                Some(min.map_or(price, |m| m.min(price))),
                Some(max.map_or(price, |m| m.max(price))),
            )
        });

        Self {
            id: event.id,
            title: event.title.clone(),
            start_date: start.map(|s| s.date()),
            start_time: start.map(|s| s.time()),
            end_date: end.map(|e| e.date()),
            end_time: end.map(|e| e.time()),
            min_price,
            max_price,
        }
    }
}

// One row of the plan/event join, still in storage representation
struct PlanRow {
    event_id: i64,
    provider_name: String,
    base_event_id: String,
    title: String,
    organizer_company_id: Option<String>,
    ever_online: bool,
    event_first_seen: String,
    event_last_seen: String,
    last_success: Option<String>,
    plan_id: i64,
    base_plan_id: String,
    sell_mode: String,
    starts_at: String,
    ends_at: String,
    sell_from: Option<String>,
    sell_to: Option<String>,
    sold_out: bool,
    capacity: Option<u32>,
    plan_first_seen: String,
    plan_last_seen: String,
}

/// Events with at least one plan starting within `[starts_at, ends_at]`.
///
/// Events come back ordered by their earliest matching plan, each carrying only its
/// matching plans. An inverted range yields an empty result.
pub fn search(
    store: &EventStore,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    filter: &SearchFilter,
) -> Result<Vec<EventRecord>, StoreError> {
    if starts_at > ends_at {
        return Ok(Vec::new());
    }

    let conn = store.conn()?;
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT e.id, e.provider_name, e.base_event_id, e.title, e.organizer_company_id,
               e.ever_online, e.first_seen_at, e.last_seen_at, s.last_success_at,
               p.id, p.base_plan_id, p.sell_mode, p.starts_at, p.ends_at, p.sell_from,
               p.sell_to, p.sold_out, p.capacity, p.first_seen_at, p.last_seen_at
        FROM plans p
        JOIN events e ON e.id = p.event_id
        LEFT JOIN provider_sync_state s ON s.provider_name = e.provider_name
        WHERE p.starts_at >= ?1 AND p.starts_at <= ?2
          AND (?3 = 0 OR e.ever_online = 1)
        ORDER BY p.starts_at, e.id, p.base_plan_id
        "#,
    )?;

    let rows = stmt.query_map(
        params![
            format_plan_time(starts_at.naive_utc()),
            format_plan_time(ends_at.naive_utc()),
            filter.ever_online_only
        ],
        |row| {
            Ok(PlanRow {
                event_id: row.get(0)?,
                provider_name: row.get(1)?,
                base_event_id: row.get(2)?,
                title: row.get(3)?,
                organizer_company_id: row.get(4)?,
                ever_online: row.get(5)?,
                event_first_seen: row.get(6)?,
                event_last_seen: row.get(7)?,
                last_success: row.get(8)?,
                plan_id: row.get(9)?,
                base_plan_id: row.get(10)?,
                sell_mode: row.get(11)?,
                starts_at: row.get(12)?,
                ends_at: row.get(13)?,
                sell_from: row.get(14)?,
                sell_to: row.get(15)?,
                sold_out: row.get(16)?,
                capacity: row.get(17)?,
                plan_first_seen: row.get(18)?,
                plan_last_seen: row.get(19)?,
            })
        },
    )?;

    let mut events: Vec<EventRecord> = Vec::new();
    // event id -> position in `events`
    let mut positions: HashMap<i64, usize> = HashMap::new();
    for row in rows {
        let row = row?;
        let last_success = parse_optional_timestamp("last_success_at", row.last_success)?;
        let is_stale = |last_seen: DateTime<Utc>| last_success.map_or(false, |success| last_seen < success);

        let plan_last_seen = parse_timestamp("last_seen_at", &row.plan_last_seen)?;
        if !filter.include_stale && is_stale(plan_last_seen) {
            continue;
        }

        let zones = load_zones(&conn, row.plan_id, filter, &is_stale)?;
        let plan = PlanRecord {
            id: row.plan_id,
            base_plan_id: row.base_plan_id,
            sell_mode: row.sell_mode.parse::<SellMode>().map_err(|_| StoreError::Corrupt {
                column: "sell_mode",
                value: row.sell_mode.clone(),
            })?,
            starts_at: parse_plan_time("starts_at", &row.starts_at)?,
            ends_at: parse_plan_time("ends_at", &row.ends_at)?,
            sell_from: row.sell_from.as_deref().map(|v| parse_plan_time("sell_from", v)).transpose()?,
            sell_to: row.sell_to.as_deref().map(|v| parse_plan_time("sell_to", v)).transpose()?,
            sold_out: row.sold_out,
            capacity: row.capacity,
            first_seen_at: parse_timestamp("first_seen_at", &row.plan_first_seen)?,
            last_seen_at: plan_last_seen,
            is_stale: is_stale(plan_last_seen),
            zones,
        };

        match positions.get(&row.event_id) {
            Some(&i) => events[i].plans.push(plan),
            None => {
                let event_last_seen = parse_timestamp("last_seen_at", &row.event_last_seen)?;
                if !filter.include_stale && is_stale(event_last_seen) {
                    continue;
                }
                events.push(EventRecord {
                    id: row.event_id,
                    provider_name: row.provider_name,
                    base_event_id: row.base_event_id,
                    title: row.title,
                    organizer_company_id: row.organizer_company_id,
                    ever_online: row.ever_online,
                    first_seen_at: parse_timestamp("first_seen_at", &row.event_first_seen)?,
                    last_seen_at: event_last_seen,
                    is_stale: is_stale(event_last_seen),
                    plans: vec![plan],
                });
                positions.insert(row.event_id, events.len() - 1);
            }
        }
    }

    debug!(
        starts_at = %starts_at,
        ends_at = %ends_at,
        include_stale = filter.include_stale,
        events = events.len(),
        "search finished"
    );

    Ok(events)
}

fn load_zones(
    conn: &rusqlite::Connection,
    plan_id: i64,
    filter: &SearchFilter,
    is_stale: &dyn Fn(DateTime<Utc>) -> bool,
) -> Result<Vec<ZoneRecord>, StoreError> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT id, base_zone_id, name, capacity, price, numbered, first_seen_at, last_seen_at
        FROM zones
        WHERE plan_id = ?1
        ORDER BY base_zone_id
        "#,
    )?;
    let rows = stmt.query_map(params![plan_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, u32>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut zones = Vec::new();
    for row in rows {
        let (id, base_zone_id, name, capacity, price, numbered, first_seen, last_seen) = row?;
        let last_seen_at = parse_timestamp("last_seen_at", &last_seen)?;
        let stale = is_stale(last_seen_at);
        if stale && !filter.include_stale {
            continue;
        }
        zones.push(ZoneRecord {
            id,
            base_zone_id,
            name,
            capacity,
            price,
            numbered,
            first_seen_at: parse_timestamp("first_seen_at", &first_seen)?,
            last_seen_at,
            is_stale: stale,
        });
    }
    Ok(zones)
}
