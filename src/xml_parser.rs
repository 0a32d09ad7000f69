// Tolerant parser for provider feeds
//
// Feeds look like /planList/output/base_plan/plan/zone. Each level is validated on its
// own: a bad zone is dropped without touching its plan, a bad plan without touching its
// event, and a bad event without aborting the document. Only a document that is not
// well-formed XML fails the whole parse.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{
    ItemError, ItemKind, ParsedEvent, ParsedPlan, ParsedZone, SellMode, ValidationIssue,
};

const ROOT: &[u8] = b"planList";
const OUTPUT: &[u8] = b"output";
const EVENT: &[u8] = b"base_plan";
const PLAN: &[u8] = b"plan";
const ZONE: &[u8] = b"zone";

#[derive(Error, Debug, Clone, PartialEq)]
#[error("feed is not well-formed XML at byte {position}: {message}")]
pub struct StructuralParseError {
    pub position: usize,
    pub message: String,
}

/// Result of a successful parse: valid events in document order plus every item
/// that had to be dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub events: Vec<ParsedEvent>,
    pub item_errors: Vec<ItemError>,
}

type AttrMap = HashMap<String, String>;

struct EventDraft {
    attrs: AttrMap,
    // The event's own attributes are checked when it opens; plans and zones of a
    // rejected event are skipped instead of reported.
    checked: Result<ParsedEvent, ValidationIssue>,
    sell_mode: Option<SellMode>,
}

struct PlanDraft {
    attrs: AttrMap,
    zones: Vec<ParsedZone>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, xml: &str) -> Result<ParsedFeed, StructuralParseError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        reader.check_end_names(true);

        let mut feed = ParsedFeed::default();
        let mut stack: Vec<Vec<u8>> = Vec::new();
        let mut seen_root = false;

        let mut event: Option<EventDraft> = None;
        let mut plan: Option<PlanDraft> = None;

        loop {
            let position = reader.buffer_position();
            let next = reader
                .read_event()
                .map_err(|e| structural(position, e.to_string()))?;

            match next {
                Event::Start(e) => {
                    if stack.is_empty() {
                        if seen_root {
                            return Err(structural(position, "more than one root element"));
                        }
                        seen_root = true;
                    }
                    let name = e.name().as_ref().to_vec();
                    self.open_element(&e, &name, &stack, &mut event, &mut plan, &mut feed, position)?;
                    stack.push(name);
                }
                Event::Empty(e) => {
                    if stack.is_empty() {
                        if seen_root {
                            return Err(structural(position, "more than one root element"));
                        }
                        seen_root = true;
                    }
                    let name = e.name().as_ref().to_vec();
                    self.open_element(&e, &name, &stack, &mut event, &mut plan, &mut feed, position)?;
                    self.close_element(&name, &stack, &mut event, &mut plan, &mut feed);
                }
                Event::End(e) => {
                    let name = e.name().as_ref().to_vec();
                    match stack.pop() {
                        Some(open) if open == name => {}
                        Some(open) => {
                            return Err(structural(
                                position,
                                format!(
                                    "expected </{}>, found </{}>",
                                    String::from_utf8_lossy(&open),
                                    String::from_utf8_lossy(&name)
                                ),
                            ))
                        }
                        None => {
                            return Err(structural(
                                position,
                                format!("unexpected </{}>", String::from_utf8_lossy(&name)),
                            ))
                        }
                    }
                    self.close_element(&name, &stack, &mut event, &mut plan, &mut feed);
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| structural(position, e.to_string()))?;
                    if stack.is_empty() && !text.trim().is_empty() {
                        return Err(structural(position, "text outside of the root element"));
                    }
                }
                Event::CData(_) if stack.is_empty() => {
                    return Err(structural(position, "CDATA outside of the root element"));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(structural(
                reader.buffer_position(),
                format!("unclosed element <{}>", String::from_utf8_lossy(open)),
            ));
        }
        if !seen_root {
            return Err(structural(reader.buffer_position(), "document has no root element"));
        }

        debug!(
            events = feed.events.len(),
            item_errors = feed.item_errors.len(),
            "parsed provider feed"
        );

        Ok(feed)
    }

    #[allow(clippy::too_many_arguments)]
    fn open_element(
        &self,
        e: &BytesStart<'_>,
        name: &[u8],
        stack: &[Vec<u8>],
        event: &mut Option<EventDraft>,
        plan: &mut Option<PlanDraft>,
        feed: &mut ParsedFeed,
        position: usize,
    ) -> Result<(), StructuralParseError> {
        // Attributes are decoded for every element so malformed markup is caught anywhere.
        let attrs = attr_map(e, position)?;

        if name == EVENT && is_event_path(stack) {
            let checked = validate_event(&attrs);
            let sell_mode = optional(&attrs, "sell_mode").and_then(|mode| mode.parse().ok());
            *event = Some(EventDraft {
                attrs,
                checked,
                sell_mode,
            });
        } else if name == PLAN && is_plan_path(stack) {
            if event.as_ref().map_or(false, |e| e.checked.is_ok()) {
                *plan = Some(PlanDraft {
                    attrs,
                    zones: Vec::new(),
                });
            }
        } else if name == ZONE && is_zone_path(stack) {
            if let (Some(event), Some(plan)) = (event.as_ref(), plan.as_mut()) {
                match validate_zone(&attrs) {
                    Ok(zone) => plan.zones.push(zone),
                    Err(issue) => record(
                        feed,
                        ItemError {
                            kind: ItemKind::Zone,
                            base_event_id: event.attrs.get("base_plan_id").cloned(),
                            base_plan_id: plan.attrs.get("plan_id").cloned(),
                            base_zone_id: attrs.get("zone_id").cloned(),
                            issue,
                        },
                    ),
                }
            }
        }

        Ok(())
    }

    // `stack` no longer contains `name` when this runs.
    fn close_element(
        &self,
        name: &[u8],
        stack: &[Vec<u8>],
        event: &mut Option<EventDraft>,
        plan: &mut Option<PlanDraft>,
        feed: &mut ParsedFeed,
    ) {
        if name == PLAN && is_plan_path(stack) {
            if let (Some(event), Some(draft)) = (event.as_mut(), plan.take()) {
                let Ok(parent) = event.checked.as_mut() else {
                    return;
                };
                match validate_plan(&draft.attrs, event.sell_mode) {
                    Ok(mut parsed) => {
                        parsed.zones = draft.zones;
                        parent.plans.push(parsed);
                    }
                    Err(issue) => record(
                        feed,
                        ItemError {
                            kind: ItemKind::Plan,
                            base_event_id: event.attrs.get("base_plan_id").cloned(),
                            base_plan_id: draft.attrs.get("plan_id").cloned(),
                            base_zone_id: None,
                            issue,
                        },
                    ),
                }
            }
        } else if name == EVENT && is_event_path(stack) {
            if let Some(draft) = event.take() {
                match draft.checked {
                    Ok(parsed) => feed.events.push(parsed),
                    Err(issue) => record(
                        feed,
                        ItemError {
                            kind: ItemKind::Event,
                            base_event_id: draft.attrs.get("base_plan_id").cloned(),
                            base_plan_id: None,
                            base_zone_id: None,
                            issue,
                        },
                    ),
                }
            }
        }
    }
}

/// Convenience wrapper around [`FeedParser::parse`].
pub fn parse_feed(xml: &str) -> Result<ParsedFeed, StructuralParseError> {
    FeedParser::new().parse(xml)
}

fn structural(position: usize, message: impl Into<String>) -> StructuralParseError {
    StructuralParseError {
        position,
        message: message.into(),
    }
}

fn record(feed: &mut ParsedFeed, error: ItemError) {
    warn!(%error, "dropping invalid feed item");
    feed.item_errors.push(error);
}

// Each check takes the stack of open ancestors and matches it in full, so
// look-alike elements nested deeper in the document are never picked up.
fn is_event_path(stack: &[Vec<u8>]) -> bool {
    stack.len() == 2 && stack[0] == ROOT && stack[1] == OUTPUT
}

fn is_plan_path(stack: &[Vec<u8>]) -> bool {
    stack.len() == 3 && is_event_path(&stack[..2]) && stack[2] == EVENT
}

fn is_zone_path(stack: &[Vec<u8>]) -> bool {
    stack.len() == 4 && is_plan_path(&stack[..3]) && stack[3] == PLAN
}

fn attr_map(e: &BytesStart<'_>, position: usize) -> Result<AttrMap, StructuralParseError> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| structural(position, err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| structural(position, err.to_string()))?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn required<'a>(attrs: &'a AttrMap, field: &'static str) -> Result<&'a str, ValidationIssue> {
    match attrs.get(field).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ValidationIssue::MissingField(field)),
    }
}

fn optional<'a>(attrs: &'a AttrMap, field: &str) -> Option<&'a str> {
    attrs
        .get(field)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: Option<&str>) -> bool {
    value.map_or(false, |v| v.eq_ignore_ascii_case("true"))
}

// Naive timestamps are taken as UTC; offsets are normalised to UTC.
fn parse_datetime(field: &'static str, value: &str) -> Result<NaiveDateTime, ValidationIssue> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.naive_utc())
        .map_err(|_| ValidationIssue::InvalidDateTime {
            field,
            value: value.to_string(),
        })
}

fn parse_count(field: &'static str, value: &str) -> Result<u32, ValidationIssue> {
    let parsed = value
        .parse::<i64>()
        .map_err(|_| ValidationIssue::InvalidNumber {
            field,
            value: value.to_string(),
        })?;
    if parsed < 0 {
        return Err(ValidationIssue::Negative {
            field,
            value: value.to_string(),
        });
    }
    u32::try_from(parsed).map_err(|_| ValidationIssue::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_price(value: &str) -> Result<f64, ValidationIssue> {
    let price = value
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        .ok_or_else(|| ValidationIssue::InvalidNumber {
            field: "price",
            value: value.to_string(),
        })?;
    if price < 0.0 {
        return Err(ValidationIssue::Negative {
            field: "price",
            value: value.to_string(),
        });
    }
    Ok(price)
}

fn validate_event(attrs: &AttrMap) -> Result<ParsedEvent, ValidationIssue> {
    let base_event_id = required(attrs, "base_plan_id")?;
    let title = required(attrs, "title")?;
    if let Some(mode) = optional(attrs, "sell_mode") {
        mode.parse::<SellMode>()?;
    }

    Ok(ParsedEvent {
        base_event_id: base_event_id.to_string(),
        title: title.to_string(),
        organizer_company_id: optional(attrs, "organizer_company_id").map(str::to_string),
        plans: Vec::new(),
    })
}

fn validate_plan(attrs: &AttrMap, inherited_mode: Option<SellMode>) -> Result<ParsedPlan, ValidationIssue> {
    let base_plan_id = required(attrs, "plan_id")?;
    let starts_at = parse_datetime("plan_start_date", required(attrs, "plan_start_date")?)?;
    let ends_at = parse_datetime("plan_end_date", required(attrs, "plan_end_date")?)?;
    if ends_at < starts_at {
        return Err(ValidationIssue::EndsBeforeStart { starts_at, ends_at });
    }

    let sell_from = optional(attrs, "sell_from")
        .map(|v| parse_datetime("sell_from", v))
        .transpose()?;
    let sell_to = optional(attrs, "sell_to")
        .map(|v| parse_datetime("sell_to", v))
        .transpose()?;
    let capacity = optional(attrs, "capacity")
        .map(|v| parse_count("capacity", v))
        .transpose()?;

    let sell_mode = match optional(attrs, "sell_mode") {
        Some(mode) => mode.parse::<SellMode>()?,
        None => inherited_mode.unwrap_or_default(),
    };

    Ok(ParsedPlan {
        base_plan_id: base_plan_id.to_string(),
        sell_mode,
        starts_at,
        ends_at,
        sell_from,
        sell_to,
        sold_out: parse_bool(optional(attrs, "sold_out")),
        capacity,
        zones: Vec::new(),
    })
}

fn validate_zone(attrs: &AttrMap) -> Result<ParsedZone, ValidationIssue> {
    let base_zone_id = required(attrs, "zone_id")?;
    let name = required(attrs, "name")?;
    let capacity = parse_count("capacity", required(attrs, "capacity")?)?;
    let price = parse_price(required(attrs, "price")?)?;

    Ok(ParsedZone {
        base_zone_id: base_zone_id.to_string(),
        name: name.to_string(),
        capacity,
        price,
        numbered: parse_bool(optional(attrs, "numbered")),
    })
}
