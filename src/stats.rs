//! Asynchronous statistics collection
//!
//! Tunnels emit one [`TrafficEvent`] when they close. Events are sent
//! over a bounded channel to a single collector task that aggregates
//! them into keyed buckets and flushes the buckets to the database in
//! transactional batches. A full channel drops the event: tunnel I/O
//! is never stalled by statistics.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{hour_key, minute_key, StatsDb, TrafficRecord};
use crate::geoip::GeoIp;

/// Bounded queue between tunnels and the collector task.
const EVENT_QUEUE_SIZE: usize = 10_000;
/// Buffer size that forces a flush ahead of the timer.
const MAX_BUFFER: usize = 5_000;

/// Emitted when a CONNECT tunnel closes, carrying per-connection
/// traffic with directional byte counts.
#[derive(Debug, Clone)]
pub struct TrafficEvent {
    pub username: String,
    pub domain: String,
    pub target_ip: String,
    pub upload: u64,
    pub download: u64,
    pub timestamp: DateTime<Utc>,
    pub country: String,
    pub country_name: String,
    pub continent: String,
}

impl TrafficEvent {
    pub fn new(username: String, domain: String, target_ip: String, upload: u64, download: u64) -> Self {
        Self {
            username,
            domain,
            target_ip,
            upload,
            download,
            timestamp: Utc::now(),
            country: String::new(),
            country_name: String::new(),
            continent: String::new(),
        }
    }
}

/// Uniquely identifies an aggregation bucket within a flush cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    username: String,
    domain: String,
    country: String,
    minute: String,
    hour: String,
}

struct Bucket {
    upload: u64,
    download: u64,
    conn_count: i64,
    country_name: String,
    continent: String,
    last_seen: DateTime<Utc>,
}

/// Cheap handle tunnels use to queue events.
#[derive(Clone)]
pub struct StatsSender {
    tx: mpsc::Sender<TrafficEvent>,
}

impl StatsSender {
    /// Queue an event. Non-blocking; if the channel is full the event
    /// is dropped and logged.
    pub fn record(&self, event: TrafficEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(
                    "Stats channel full, dropping event for {}/{}",
                    ev.username, ev.domain
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Stats collector already stopped, event dropped");
            }
        }
    }
}

/// Receives traffic events, aggregates in memory, periodically flushes
/// to [`StatsDb`].
pub struct StatsCollector {
    sender: StatsSender,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatsCollector {
    /// Spawn the collector task. `flush_seconds` controls how often
    /// the buffer is written out (0 means the 30 s default).
    pub fn new(db: StatsDb, geoip: Option<Arc<GeoIp>>, flush_seconds: u64) -> Self {
        let flush_seconds = if flush_seconds == 0 { 30 } else { flush_seconds };
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            rx,
            db,
            geoip,
            Duration::from_secs(flush_seconds),
            cancel.clone(),
        ));
        Self {
            sender: StatsSender { tx },
            cancel,
            handle,
        }
    }

    pub fn sender(&self) -> StatsSender {
        self.sender.clone()
    }

    pub fn record(&self, event: TrafficEvent) {
        self.sender.record(event);
    }

    /// Drain the queue, perform one final flush and shut down. Callers
    /// must make sure all tunnels have terminated first; events queued
    /// afterwards are dropped.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run(
    mut rx: mpsc::Receiver<TrafficEvent>,
    db: StatsDb,
    geoip: Option<Arc<GeoIp>>,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut buffer: HashMap<BufferKey, Bucket> = HashMap::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Drain whatever is still queued, then one final flush
                while let Ok(event) = rx.try_recv() {
                    aggregate(&mut buffer, geoip.as_deref(), event);
                }
                flush(&db, &mut buffer).await;
                info!("Stats collector shut down");
                break;
            }
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        aggregate(&mut buffer, geoip.as_deref(), event);
                        if buffer.len() >= MAX_BUFFER {
                            flush(&db, &mut buffer).await;
                        }
                    }
                    None => {
                        // All senders gone without an explicit stop
                        flush(&db, &mut buffer).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&db, &mut buffer).await;
            }
        }
    }
}

fn aggregate(buffer: &mut HashMap<BufferKey, Bucket>, geoip: Option<&GeoIp>, mut event: TrafficEvent) {
    // Country enrichment happens here, off the tunnel hot path
    if event.country.is_empty() && !event.target_ip.is_empty() {
        if let Some(geo) = geoip.and_then(|g| g.lookup(&event.target_ip)) {
            event.country = geo.country;
            event.country_name = geo.country_name;
            event.continent = geo.continent;
        }
    }

    let key = BufferKey {
        username: event.username,
        domain: event.domain,
        country: event.country,
        minute: minute_key(&event.timestamp),
        hour: hour_key(&event.timestamp),
    };

    let bucket = buffer.entry(key).or_insert_with(|| Bucket {
        upload: 0,
        download: 0,
        conn_count: 0,
        country_name: event.country_name,
        continent: event.continent,
        last_seen: event.timestamp,
    });
    bucket.upload += event.upload;
    bucket.download += event.download;
    bucket.conn_count += 1;
    if event.timestamp > bucket.last_seen {
        bucket.last_seen = event.timestamp;
    }
}

async fn flush(db: &StatsDb, buffer: &mut HashMap<BufferKey, Bucket>) {
    if buffer.is_empty() {
        return;
    }

    let swapped = mem::take(buffer);
    let records: Vec<TrafficRecord> = swapped
        .iter()
        .map(|(key, bucket)| TrafficRecord {
            username: key.username.clone(),
            domain: key.domain.clone(),
            upload: bucket.upload as i64,
            download: bucket.download as i64,
            conn_count: bucket.conn_count,
            country: key.country.clone(),
            country_name: bucket.country_name.clone(),
            continent: bucket.continent.clone(),
            minute: key.minute.clone(),
            hour: key.hour.clone(),
            timestamp: bucket.last_seen,
        })
        .collect();

    match db.batch_upsert(&records).await {
        Ok(()) => debug!("Flushed {} stat buckets", records.len()),
        Err(e) => {
            error!("Stats flush failed: {} (will retry next cycle)", e);
            // Merge the failed batch back so nothing is lost
            for (key, bucket) in swapped {
                match buffer.entry(key) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        let existing = entry.get_mut();
                        existing.upload += bucket.upload;
                        existing.download += bucket.download;
                        existing.conn_count += bucket.conn_count;
                        if bucket.last_seen > existing.last_seen {
                            existing.last_seen = bucket.last_seen;
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(bucket);
                    }
                }
            }
        }
    }
}
