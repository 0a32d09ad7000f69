use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use event_sync::model::ItemKind;
use event_sync::{
    search, EventStore, FeedSource, FetchError, ProviderClient, ProviderConfig, RetryConfig, RunState,
    SearchCache, SearchFilter, SyncOrchestrator, SyncSettings,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const SAMPLE_FEED: &str = include_str!("../samples/provider_feed.xml");

fn open_store() -> (EventStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = EventStore::open(dir.path().join("events.db"), 4).unwrap();
    (store, dir)
}

fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

// Minimal HTTP/1.1 responder serving the same status and body to every request.
async fn serve(status_line: &'static str, body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}/api/events")
}

struct StaticFeed(String);

#[async_trait]
impl FeedSource for StaticFeed {
    async fn fetch(&self, _provider: &ProviderConfig) -> Result<String, FetchError> {
        Ok(self.0.clone())
    }
}

// Serves a fixed body per provider name.
struct FeedMap(HashMap<String, String>);

#[async_trait]
impl FeedSource for FeedMap {
    async fn fetch(&self, provider: &ProviderConfig) -> Result<String, FetchError> {
        self.0.get(&provider.name).cloned().ok_or_else(|| FetchError::Permanent {
            provider: provider.name.clone(),
            status: Some(404),
            reason: "unknown provider".to_string(),
        })
    }
}

#[tokio::test]
async fn sync_over_http_then_search() {
    let (store, _dir) = open_store();
    let healthy = serve("200 OK", SAMPLE_FEED.to_string()).await;
    let failing = serve("503 Service Unavailable", String::new()).await;

    let retry = RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        ..RetryConfig::default()
    };
    let client = Arc::new(ProviderClient::new(retry));
    let orchestrator = SyncOrchestrator::new(store.clone(), client.clone(), SyncSettings::default());
    let providers = vec![
        ProviderConfig::new("primary", healthy, 5),
        ProviderConfig::new("flaky", failing, 5),
    ];

    let report = orchestrator.run_sync(&providers, utc(2021, 1, 1)).await;
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);

    let flaky = report.outcome("flaky").unwrap();
    assert_eq!(flaky.state, RunState::Failed);
    assert!(flaky.error.as_ref().unwrap().to_string().contains("3 attempt(s)"));

    let found = search(&store, utc(2021, 6, 1), utc(2021, 8, 1), &SearchFilter::default()).unwrap();
    let ids: Vec<_> = found.iter().map(|e| e.base_event_id.as_str()).collect();
    assert_eq!(ids, vec!["291", "1591"]);
    assert_eq!(found[0].plans[0].zones.len(), 3);

    let cache = SearchCache::new(store.clone(), Duration::from_secs(60));
    let cached = cache
        .get_or_load(utc(2021, 6, 1), utc(2021, 8, 1), SearchFilter::default())
        .unwrap();
    assert_eq!(cached.as_slice(), found.as_slice());

    let nothing = search(&store, utc(2000, 1, 1), utc(2000, 12, 31), &SearchFilter::default()).unwrap();
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn invalid_plan_is_reported_and_skipped() {
    let (store, _dir) = open_store();
    let feed = r#"<planList><output>
        <base_plan base_plan_id="1" sell_mode="online" title="Valid">
            <plan plan_id="1" plan_start_date="2024-07-04T20:00:00" plan_end_date="2024-07-04T22:00:00">
                <zone zone_id="1" capacity="10" price="5.00" name="Floor"/>
            </plan>
        </base_plan>
        <base_plan base_plan_id="2" sell_mode="online" title="Mixed">
            <plan plan_id="2a" plan_start_date="2024-07-05T20:00:00" plan_end_date="2024-07-05T22:00:00"/>
            <plan plan_id="2b" capacity="-1" plan_start_date="2024-07-06T20:00:00" plan_end_date="2024-07-06T22:00:00"/>
            <plan plan_id="2c" plan_start_date="2024-07-07T20:00:00" plan_end_date="2024-07-07T22:00:00"/>
        </base_plan>
        <base_plan base_plan_id="3" sell_mode="offline" title="Also valid">
            <plan plan_id="3" plan_start_date="2024-07-08T20:00:00" plan_end_date="2024-07-08T22:00:00"/>
        </base_plan>
    </output></planList>"#;

    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        Arc::new(StaticFeed(feed.to_string())),
        SyncSettings::default(),
    );
    let providers = vec![ProviderConfig::new("primary", "http://primary.test/feed", 5)];

    let report = orchestrator.run_sync(&providers, utc(2024, 6, 1)).await;
    let outcome = report.outcome("primary").unwrap();
    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.counts.events.created, 3);
    // Of the three plans under event 2 only the two valid ones are stored.
    assert_eq!(outcome.counts.plans.created, 4);
    assert_eq!(outcome.item_errors.len(), 1);
    assert_eq!(outcome.item_errors[0].kind, ItemKind::Plan);
    assert_eq!(outcome.item_errors[0].base_plan_id.as_deref(), Some("2b"));

    // Running the same feed again changes nothing but the counters.
    let again = orchestrator.run_sync(&providers, utc(2024, 6, 1)).await;
    let outcome = again.outcome("primary").unwrap();
    assert_eq!(outcome.counts.created(), 0);
    assert_eq!(outcome.counts.updated(), 3 + 4 + 1);
    assert_eq!(store.counts().unwrap(), (3, 4, 1));

    let july = search(&store, utc(2024, 7, 1), utc(2024, 7, 31), &SearchFilter::default()).unwrap();
    let plans: Vec<_> = july
        .iter()
        .flat_map(|e| e.plans.iter().map(|p| p.base_plan_id.as_str()))
        .collect();
    assert_eq!(plans, vec!["1", "2a", "2c", "3"]);
    let mixed = july.iter().find(|e| e.base_event_id == "2").unwrap();
    assert_eq!(mixed.plans.len(), 2);
}

#[tokio::test]
async fn one_broken_provider_among_three() {
    let (store, _dir) = open_store();
    let second_feed = r#"<planList><output>
        <base_plan base_plan_id="9001" sell_mode="online" title="Jazz night">
            <plan plan_id="9001" plan_start_date="2021-07-15T21:00:00" plan_end_date="2021-07-15T23:00:00">
                <zone zone_id="1" capacity="80" price="25.00" name="Hall"/>
                <zone zone_id="2" capacity="20" price="40.00" name="Front"/>
            </plan>
        </base_plan>
    </output></planList>"#;

    let feeds = HashMap::from([
        ("alpha".to_string(), SAMPLE_FEED.to_string()),
        ("beta".to_string(), second_feed.to_string()),
        ("gamma".to_string(), "<planList><output><base_plan base_plan_id=\"1\">".to_string()),
    ]);
    let orchestrator = SyncOrchestrator::new(store.clone(), Arc::new(FeedMap(feeds)), SyncSettings::default());
    let providers = vec![
        ProviderConfig::new("alpha", "http://alpha.test/feed", 5),
        ProviderConfig::new("beta", "http://beta.test/feed", 5),
        ProviderConfig::new("gamma", "http://gamma.test/feed", 5),
    ];

    let report = orchestrator.run_sync(&providers, utc(2021, 1, 1)).await;
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);

    let alpha = report.outcome("alpha").unwrap();
    assert_eq!(alpha.state, RunState::Done);
    assert_eq!(
        (alpha.counts.events.created, alpha.counts.plans.created, alpha.counts.zones.created),
        (3, 4, 7)
    );

    let beta = report.outcome("beta").unwrap();
    assert_eq!(beta.state, RunState::Done);
    assert_eq!(
        (beta.counts.events.created, beta.counts.plans.created, beta.counts.zones.created),
        (1, 1, 2)
    );

    let gamma = report.outcome("gamma").unwrap();
    assert_eq!(gamma.state, RunState::Failed);
    assert_eq!(gamma.counts.created(), 0);
    assert!(gamma.error.is_some());

    // The store holds exactly what the two healthy providers sent.
    assert_eq!(store.counts().unwrap(), (4, 5, 9));
    assert!(store.sync_state("gamma").unwrap().unwrap().last_success_at.is_none());

    let found = search(&store, utc(2021, 6, 1), utc(2021, 8, 1), &SearchFilter::default()).unwrap();
    let ids: Vec<_> = found.iter().map(|e| e.base_event_id.as_str()).collect();
    assert_eq!(ids, vec!["291", "9001", "1591"]);
}
