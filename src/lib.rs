// Event feed synchronization: fetch provider XML, parse it tolerantly, reconcile it
// into a history-preserving store and serve range searches from that store.

pub mod config;
pub mod model;
pub mod orchestrator;
pub mod provider_client;
pub mod read_model;
pub mod reconcile;
pub mod search_cache;
pub mod store;
pub mod xml_parser;

// Re-export key types for convenience
pub use config::{ConfigError, ProviderConfig, RetryConfig, Settings, SyncSettings};
pub use model::{EventRecord, ItemError, ParsedEvent, PlanRecord, SellMode, ZoneRecord};
pub use orchestrator::{ProviderOutcome, RunState, SyncError, SyncOrchestrator, SyncReport};
pub use provider_client::{FeedSource, FetchError, ProviderClient};
pub use read_model::{search, EventSummary, SearchFilter};
pub use reconcile::{ReconcileCounts, ReconcileError, ReconciliationEngine};
pub use search_cache::{CacheStats, SearchCache};
pub use store::{EventStore, StoreError};
pub use xml_parser::{parse_feed, FeedParser, ParsedFeed, StructuralParseError};
