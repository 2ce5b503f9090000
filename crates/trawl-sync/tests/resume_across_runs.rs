// Two separate trawler instances sharing one store behave like two process
// invocations: the second resumes at the checkpoint and stores nothing new.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use trawl_core::{ActivityRecord, DayWindow, HotspotIdentity, Page};
use trawl_source::{ActivitySource, SourceError};
use trawl_storage::MemoryDocumentStore;
use trawl_sync::{Trawler, METADATA_INDEX};

struct StaticHistory;

fn at(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 3, d, h, 0, 0).single().expect("valid timestamp")
}

#[async_trait]
impl ActivitySource for StaticHistory {
    async fn identity(&self, address: &str) -> Result<HotspotIdentity, SourceError> {
        Ok(HotspotIdentity {
            address: address.to_string(),
            name: "fierce-lemon-owl".to_string(),
            birthday: at(1, 9),
        })
    }

    async fn first_page(&self, _address: &str, window: &DayWindow) -> Result<Page, SourceError> {
        let day = window.max_time.format("%d").to_string();
        let records = vec![
            json!({ "hash": format!("reward-{day}"), "type": "rewards_v2", "time": window.max_time.timestamp(), "rewards": [{ "amount": 2_500_000 }] }),
            json!({ "hash": format!("poc-{day}"), "type": "poc_receipts_v1", "time": window.max_time.timestamp(), "path": [{ "challengee_lat": 52.1, "challengee_lon": 4.3 }] }),
        ];
        Ok(Page {
            records: records
                .into_iter()
                .map(|r| ActivityRecord::from_json(r).expect("record"))
                .collect(),
            cursor: None,
        })
    }

    async fn next_page(&self, _address: &str, cursor: &str) -> Result<Page, SourceError> {
        Err(SourceError::Remote(format!("unexpected cursor {cursor}")))
    }
}

#[tokio::test]
async fn second_invocation_resumes_and_stores_nothing_new() {
    let store = Arc::new(MemoryDocumentStore::new());
    let now = at(3, 15);

    let first = Trawler::new("11xyz", Arc::new(StaticHistory), store.clone())
        .trawl_until(now)
        .await
        .expect("trawl");
    assert_eq!(first.days_synced, 3);
    assert_eq!(first.new_docs, 6);
    assert_eq!(store.count("fierce-lemon-owl").await, 6);

    let second = Trawler::new("11xyz", Arc::new(StaticHistory), store.clone())
        .trawl_until(now)
        .await
        .expect("trawl");
    assert_eq!(second.resumed_from, at(3, 0));
    assert_eq!(second.days_synced, 1);
    assert_eq!(second.new_docs, 0);
    assert_eq!(second.duplicate_docs, 2);
    assert_eq!(store.count("fierce-lemon-owl").await, 6);

    let checkpoint = store.document(METADATA_INDEX, "fierce-lemon-owl").await.expect("checkpoint");
    assert_eq!(checkpoint["lastRun"], json!(at(3, 0).timestamp_millis()));

    let poc = store.document("fierce-lemon-owl", "poc-02").await.expect("poc document");
    assert_eq!(poc["path"][0]["challengee_location"], json!("52.1,4.3"));
    let reward = store.document("fierce-lemon-owl", "reward-02").await.expect("reward document");
    assert_eq!(reward["totalHnt"].to_string(), "0.025");
}
