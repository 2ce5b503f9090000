//! Trawl engine: day/page iteration, enrichment, dedup and checkpointing.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use num_bigint::BigInt;
use serde::Serialize;
use serde_json::{json, Number, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, trace, Instrument};
use trawl_core::{
    start_of_day, ActivityKind, ActivityRecord, Checkpoint, DayStats, DayWindow, HotspotIdentity,
    JsonObject,
};
use trawl_source::{ActivitySource, ApiBase, HeliumApi, HeliumApiConfig, SourceError};
use trawl_storage::{DocumentStore, ElasticStore, HttpClientConfig, StoreError};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trawl-sync";

/// Collection holding one checkpoint document per hotspot name.
pub const METADATA_INDEX: &str = "metadataindex";

/// HNT carries eight decimal places; the integer unit is the bone.
pub const HNT_DECIMALS: i64 = 8;

const DAY_FORMAT: &str = "%d-%b-%Y";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub hotspot: String,
    pub es_server_address: String,
    pub api_base: ApiBase,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };

        let hotspot = lookup("HOTSPOT")
            .filter(|v| !v.trim().is_empty())
            .context("HOTSPOT must be set to the hotspot address")?;
        let api_base = ApiBase::from_flags(flag("USE_HELIUM_API"), flag("USE_STAKEJOY_API"))?;

        Ok(Self {
            hotspot,
            es_server_address: lookup("ES_SERVER_ADDRESS")
                .unwrap_or_else(|| "http://localhost:9200".to_string()),
            api_base,
            user_agent: lookup("USER_AGENT").unwrap_or_else(|| "heliumevents".to_string()),
            http_timeout_secs: lookup("TRAWL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }
}

#[derive(Debug, Error)]
pub enum TrawlError {
    #[error("could not resolve hotspot {address}")]
    IdentityResolution {
        address: String,
        #[source]
        source: SourceError,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not set up {what}")]
    Setup {
        what: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Turns a raw activity record into the document that gets stored.
///
/// - `time` becomes an ISO-8601 string with offset.
/// - `poc_receipts_v1` gains `path[0].challengee_location` as `"<lat>,<lon>"`.
/// - `rewards_v2` gains `totalBones` and an exact decimal `totalHnt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordEnricher;

impl RecordEnricher {
    pub fn enrich(&self, record: ActivityRecord) -> JsonObject {
        let ActivityRecord {
            kind,
            time,
            mut document,
            ..
        } = record;

        if let Some(stamp) = iso_timestamp(time) {
            document.insert("time".to_string(), JsonValue::String(stamp));
        }

        match kind {
            ActivityKind::PocReceiptsV1 => patch_challengee_location(&mut document),
            ActivityKind::RewardsV2 => patch_reward_totals(&mut document),
            ActivityKind::Other(_) => {}
        }
        document
    }
}

fn iso_timestamp(seconds: i64) -> Option<String> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, false))
}

fn patch_challengee_location(document: &mut JsonObject) {
    let Some(first_hop) = document
        .get_mut("path")
        .and_then(JsonValue::as_array_mut)
        .and_then(|path| path.first_mut())
        .and_then(JsonValue::as_object_mut)
    else {
        return;
    };

    let lat = coordinate(first_hop.get("challengee_lat"));
    let lon = coordinate(first_hop.get("challengee_lon"));
    first_hop.insert(
        "challengee_location".to_string(),
        JsonValue::String(format!("{lat},{lon}")),
    );
}

/// Missing coordinates read as -1; whole numbers keep one decimal (`-1.0`).
fn coordinate(value: Option<&JsonValue>) -> String {
    let value = value.and_then(JsonValue::as_f64).unwrap_or(-1.0);
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

fn patch_reward_totals(document: &mut JsonObject) {
    let total_bones = document
        .get("rewards")
        .and_then(JsonValue::as_array)
        .map(|rewards| {
            rewards
                .iter()
                .filter_map(|reward| reward.get("amount").and_then(JsonValue::as_i64))
                .fold(0i64, i64::saturating_add)
        })
        .unwrap_or(0);

    let total_hnt = bones_to_hnt(total_bones);
    let total_hnt = total_hnt
        .to_string()
        .parse::<Number>()
        .map(JsonValue::Number)
        .unwrap_or_else(|_| JsonValue::String(total_hnt.to_string()));

    document.insert("totalBones".to_string(), JsonValue::from(total_bones));
    document.insert("totalHnt".to_string(), total_hnt);
}

/// Exact bones → HNT conversion, without trailing zeros.
pub fn bones_to_hnt(bones: i64) -> BigDecimal {
    let hnt = BigDecimal::new(BigInt::from(bones), HNT_DECIMALS).normalized();
    let (_, scale) = hnt.as_bigint_and_exponent();
    if scale < 0 {
        hnt.with_scale(0)
    } else {
        hnt
    }
}

/// Reads and writes the per-hotspot "last fully synced day" marker.
pub struct CheckpointTracker {
    store: Arc<dyn DocumentStore>,
}

impl CheckpointTracker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Create the hotspot's metadata document if it is missing. The placeholder
    /// has no `lastRun`, so `read` still reports it as never synced. A failed
    /// existence check counts as missing.
    pub async fn ensure(&self, hotspot_name: &str) -> Result<bool, StoreError> {
        match self.store.exists(METADATA_INDEX, hotspot_name).await {
            Ok(true) => return Ok(false),
            Ok(false) => {}
            Err(err) => debug!(error = %err, "metadata existence check failed, treating as missing"),
        }
        info!("setting up metadata index for {hotspot_name}");
        self.store
            .put(METADATA_INDEX, hotspot_name, &json!({ "position": 0 }))
            .await?;
        Ok(true)
    }

    pub async fn read(&self, hotspot_name: &str) -> Result<Option<Checkpoint>, StoreError> {
        let Some(document) = self.store.get(METADATA_INDEX, hotspot_name).await? else {
            return Ok(None);
        };
        if document.get("lastRun").map_or(true, JsonValue::is_null) {
            return Ok(None);
        }
        serde_json::from_value(document)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                path: ElasticStore::doc_path(METADATA_INDEX, hotspot_name),
                source,
            })
    }

    pub async fn write(&self, hotspot_name: &str, day: DateTime<Utc>) -> Result<(), StoreError> {
        let document = serde_json::to_value(Checkpoint::for_day(day)).map_err(|source| {
            StoreError::Malformed {
                path: ElasticStore::doc_path(METADATA_INDEX, hotspot_name),
                source,
            }
        })?;
        self.store.put(METADATA_INDEX, hotspot_name, &document).await
    }
}

/// Field mapping for a hotspot's collection: `time` as a date and the
/// challengee location as a geo point.
pub fn collection_mapping() -> JsonValue {
    json!({
        "mappings": {
            "properties": {
                "time": { "type": "date" },
                "path.challengee_location": { "type": "geo_point" }
            }
        }
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TrawlSummary {
    pub run_id: Uuid,
    pub hotspot: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resumed_from: DateTime<Utc>,
    pub days_synced: usize,
    pub fetched: usize,
    pub new_docs: usize,
    pub duplicate_docs: usize,
}

pub struct Trawler {
    address: String,
    source: Arc<dyn ActivitySource>,
    store: Arc<dyn DocumentStore>,
    checkpoints: CheckpointTracker,
    enricher: RecordEnricher,
}

impl Trawler {
    pub fn new(
        address: impl Into<String>,
        source: Arc<dyn ActivitySource>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            address: address.into(),
            source,
            checkpoints: CheckpointTracker::new(store.clone()),
            store,
            enricher: RecordEnricher,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let timeout = StdDuration::from_secs(config.http_timeout_secs);
        info!("using {} API", config.api_base.label());
        let source = HeliumApi::new(HeliumApiConfig {
            base: config.api_base.clone(),
            user_agent: config.user_agent.clone(),
            timeout,
        })?;

        info!("using Elasticsearch at {}", config.es_server_address);
        let store = ElasticStore::new(
            config.es_server_address.clone(),
            &HttpClientConfig {
                timeout,
                user_agent: None,
            },
        )?;

        Ok(Self::new(
            config.hotspot.clone(),
            Arc::new(source),
            Arc::new(store),
        ))
    }

    pub fn checkpoints(&self) -> &CheckpointTracker {
        &self.checkpoints
    }

    pub async fn trawl(&self) -> Result<TrawlSummary, TrawlError> {
        self.trawl_until(Utc::now()).await
    }

    /// Sync every day from the resume point up to `now`. Any collaborator
    /// error ends the run; the day in progress is left unchecked so the next
    /// run repeats it in full.
    pub async fn trawl_until(&self, now: DateTime<Utc>) -> Result<TrawlSummary, TrawlError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let identity = self
            .source
            .identity(&self.address)
            .await
            .map_err(|source| TrawlError::IdentityResolution {
                address: self.address.clone(),
                source,
            })?;

        let span = info_span!("trawl", %run_id, hotspot = %identity.name);
        let mut summary = self.run(&identity, now).instrument(span).await?;
        summary.run_id = run_id;
        summary.started_at = started_at;
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Idempotent collection setup: metadata document and field mapping.
    pub async fn bootstrap(&self, identity: &HotspotIdentity) -> Result<(), TrawlError> {
        self.checkpoints
            .ensure(&identity.name)
            .await
            .map_err(|source| TrawlError::Setup {
                what: "metadata index",
                source,
            })?;

        if self
            .store
            .get_raw(&format!("/{}/_mapping", identity.name))
            .await
            .is_err()
        {
            info!("setting up mappings for time (date field) and path.challengee_location (geo_point)");
            self.store
                .put_raw(&format!("/{}", identity.name), &collection_mapping())
                .await
                .map_err(|source| TrawlError::Setup {
                    what: "field mapping",
                    source,
                })?;
        }
        Ok(())
    }

    async fn run(
        &self,
        identity: &HotspotIdentity,
        now: DateTime<Utc>,
    ) -> Result<TrawlSummary, TrawlError> {
        self.bootstrap(identity).await?;

        let resumed_from = self
            .checkpoints
            .read(&identity.name)
            .await?
            .and_then(|checkpoint| checkpoint.day())
            .unwrap_or(identity.birthday);

        info!(
            "syncing from {} for hotspot {}, born on {}",
            resumed_from.format(DAY_FORMAT),
            identity.name,
            identity.birthday.format("%d-%b-%Y %H:%M"),
        );

        let mut summary = TrawlSummary {
            run_id: Uuid::nil(),
            hotspot: identity.name.clone(),
            started_at: now,
            finished_at: now,
            resumed_from,
            days_synced: 0,
            fetched: 0,
            new_docs: 0,
            duplicate_docs: 0,
        };

        let mut day = start_of_day(resumed_from);
        while day < now {
            let stats = self.sync_day(identity, day, now).await?;
            info!(
                "{} processed, fetched {} transactions: {} new, {} already known",
                day.format(DAY_FORMAT),
                stats.fetched,
                stats.new_docs,
                stats.duplicate_docs
            );

            self.checkpoints.write(&identity.name, day).await?;

            summary.days_synced += 1;
            summary.fetched += stats.fetched;
            summary.new_docs += stats.new_docs;
            summary.duplicate_docs += stats.duplicate_docs;
            day += Duration::days(1);
        }

        info!("sync complete");
        Ok(summary)
    }

    /// Fetch and store every page of one day's window. Does not checkpoint.
    pub async fn sync_day(
        &self,
        identity: &HotspotIdentity,
        day: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DayStats, TrawlError> {
        let window = DayWindow::for_day(day, now);
        debug!(
            min_time = %window.min_time,
            max_time = %window.max_time,
            "fetching events for {}",
            day.format(DAY_FORMAT)
        );

        let mut stats = DayStats::default();
        let mut page = self.source.first_page(&identity.address, &window).await?;
        loop {
            let cursor = page.cursor.take();
            self.store_records(&identity.name, page.records, &mut stats)
                .await?;
            let Some(cursor) = cursor else {
                break;
            };
            page = self.source.next_page(&identity.address, &cursor).await?;
        }
        Ok(stats)
    }

    async fn store_records(
        &self,
        collection: &str,
        records: Vec<ActivityRecord>,
        stats: &mut DayStats,
    ) -> Result<(), StoreError> {
        for record in records {
            let hash = record.hash.clone();
            let kind = record.kind.as_str().to_string();
            let document = JsonValue::Object(self.enricher.enrich(record));

            if self.store.exists(collection, &hash).await? {
                stats.record_duplicate();
                continue;
            }

            trace!(%hash, %kind, "{document}");
            self.store.put(collection, &hash, &document).await?;
            stats.record_new();
        }
        Ok(())
    }
}

pub async fn run_trawl_once_from_env() -> Result<TrawlSummary> {
    let config = SyncConfig::from_env()?;
    let trawler = Trawler::from_config(&config)?;
    let summary = trawler.trawl().await?;
    Ok(summary)
}
