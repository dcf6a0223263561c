pub mod batcher;
pub mod fid;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::batcher::{BatchWrite, Batcher};
use crate::db::fid::{fid_create, fid_pack_high, fid_pack_low};
use crate::flow::FlowEntry;

const FLOW_BATCH_SIZE: usize = 1000;
const ITEM_BATCH_SIZE: usize = 2000;
const INDEX_BATCH_SIZE: usize = 4000;
const BATCH_TIMEOUT: StdDuration = StdDuration::from_secs(5);

pub const CHUNK_SIZE: usize = 1024;
pub const CHUNK_OVERLAP: usize = 64;

const SCHEMA: &str = r#"
CREATE EXTENSION IF NOT EXISTS "uuid-ossp";

CREATE TABLE IF NOT EXISTS pcap (
    id uuid PRIMARY KEY DEFAULT uuid_generate_v4(),
    name text UNIQUE NOT NULL,
    position bigint NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS flow (
    id uuid PRIMARY KEY,
    src_ip text NOT NULL,
    dst_ip text NOT NULL,
    src_port integer NOT NULL,
    dst_port integer NOT NULL,
    start_time timestamptz NOT NULL,
    duration_ms bigint NOT NULL,
    num_packets integer NOT NULL,
    size bigint NOT NULL,
    tags jsonb NOT NULL DEFAULT '[]',
    flags jsonb NOT NULL DEFAULT '[]',
    flagids jsonb NOT NULL DEFAULT '[]',
    flags_in integer NOT NULL DEFAULT 0,
    flags_out integer NOT NULL DEFAULT 0,
    fingerprints integer[] NOT NULL DEFAULT '{}',
    signatures jsonb NOT NULL DEFAULT '[]',
    pcap_id uuid,
    link_parent_id uuid,
    link_child_id uuid
);
CREATE INDEX IF NOT EXISTS flow_tuple_idx ON flow (src_ip, dst_ip, src_port, dst_port);
CREATE INDEX IF NOT EXISTS flow_tags_idx ON flow USING gin (tags);

CREATE TABLE IF NOT EXISTS flow_item (
    id uuid PRIMARY KEY,
    flow_id uuid NOT NULL,
    kind text NOT NULL,
    direction text NOT NULL,
    data bytea NOT NULL,
    time timestamptz NOT NULL
);
CREATE INDEX IF NOT EXISTS flow_item_flow_idx ON flow_item (flow_id);

CREATE TABLE IF NOT EXISTS flow_index (
    flow_id uuid NOT NULL,
    text text NOT NULL
);
CREATE INDEX IF NOT EXISTS flow_index_flow_idx ON flow_index (flow_id);

CREATE TABLE IF NOT EXISTS fingerprint (
    id integer PRIMARY KEY,
    grp integer NOT NULL
);
CREATE INDEX IF NOT EXISTS fingerprint_grp_idx ON fingerprint (grp);

CREATE TABLE IF NOT EXISTS tag (
    name text PRIMARY KEY,
    sort integer NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS flag_id (
    id uuid PRIMARY KEY DEFAULT uuid_generate_v4(),
    content text NOT NULL,
    time timestamptz NOT NULL DEFAULT now()
);

CREATE OR REPLACE FUNCTION fid_pack_low(t timestamptz) RETURNS uuid AS $$
DECLARE
    hex text := lpad(to_hex((extract(epoch FROM t) * 1000000)::bigint), 16, '0');
BEGIN
    RETURN (substr(hex, 1, 12) || '8' || substr(hex, 13, 3) || '8'
            || substr(hex, 16, 1) || repeat('0', 14))::uuid;
END
$$ LANGUAGE plpgsql IMMUTABLE;

CREATE OR REPLACE FUNCTION fid_pack_high(t timestamptz) RETURNS uuid AS $$
DECLARE
    hex text := lpad(to_hex((extract(epoch FROM t) * 1000000)::bigint), 16, '0');
BEGIN
    RETURN (substr(hex, 1, 12) || '8' || substr(hex, 13, 3) || '8'
            || substr(hex, 16, 1) || repeat('f', 14))::uuid;
END
$$ LANGUAGE plpgsql IMMUTABLE;

CREATE OR REPLACE FUNCTION jsonb_unique(arr jsonb) RETURNS jsonb AS $$
    SELECT coalesce(jsonb_agg(DISTINCT value), '[]'::jsonb)
    FROM jsonb_array_elements(arr) AS value
$$ LANGUAGE sql IMMUTABLE;
"#;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(url: &str) -> anyhow::Result<Database> {
        let workers = (std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            / 2)
        .max(2);

        let pool = PgPoolOptions::new()
            .max_connections(workers as u32)
            .connect(url)
            .await
            .context("failed to connect to the database")?;

        info!("Connected to database with {} workers", workers);
        Ok(Database { pool })
    }

    pub async fn configure(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to configure database schema")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn pcap_position(&self, name: &str) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query("SELECT position FROM pcap WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("position")))
    }

    /// Registers a source (or moves its resume cursor) and returns its id.
    pub async fn upsert_pcap(&self, name: &str, position: i64) -> anyhow::Result<Uuid> {
        let row = sqlx::query(
            "INSERT INTO pcap (name, position) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET position = EXCLUDED.position
             RETURNING id",
        )
        .bind(name)
        .bind(position)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    pub async fn current_flagids(&self, lifetime: Duration) -> anyhow::Result<Vec<String>> {
        let cutoff = Utc::now() - lifetime;
        let rows = sqlx::query("SELECT content FROM flag_id WHERE time > $1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("content"))
            .collect())
    }

    pub async fn load_tags(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM tag")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .collect())
    }

    pub async fn store_tags(&self, tags: &[String]) -> anyhow::Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        sqlx::query("INSERT INTO tag (name) SELECT unnest($1::text[]) ON CONFLICT (name) DO NOTHING")
            .bind(tags)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Attaches a detector signature to the flow matching the tuple within
    /// the time window, trying the reversed tuple when the forward one finds
    /// nothing. Returns false when no flow matched.
    pub async fn add_signature_to_flow(
        &self,
        tuple: &FlowTuple,
        window: Duration,
        signature: Option<&Signature>,
        extra_tags: &[String],
    ) -> anyhow::Result<bool> {
        let low = fid_pack_low(tuple.start - window);
        let high = fid_pack_high(tuple.start + window);

        let mut flow_id: Option<Uuid> = None;
        for (src_ip, src_port, dst_ip, dst_port) in [
            (&tuple.src_ip, tuple.src_port, &tuple.dst_ip, tuple.dst_port),
            (&tuple.dst_ip, tuple.dst_port, &tuple.src_ip, tuple.src_port),
        ] {
            let row = sqlx::query(
                "SELECT id FROM flow
                 WHERE id BETWEEN $1 AND $2
                   AND src_ip = $3 AND src_port = $4 AND dst_ip = $5 AND dst_port = $6
                 LIMIT 1",
            )
            .bind(low)
            .bind(high)
            .bind(src_ip)
            .bind(src_port as i32)
            .bind(dst_ip)
            .bind(dst_port as i32)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                flow_id = Some(row.get("id"));
                break;
            }
        }

        let Some(flow_id) = flow_id else {
            return Ok(false);
        };

        let tags = serde_json::to_value(extra_tags)?;
        let signatures = match signature {
            Some(signature) => serde_json::to_value([signature])?,
            None => serde_json::Value::Array(vec![]),
        };
        sqlx::query(
            "UPDATE flow SET
                 signatures = jsonb_unique(signatures || $1::jsonb),
                 tags = jsonb_unique(tags || $2::jsonb)
             WHERE id = $3",
        )
        .bind(signatures)
        .bind(tags)
        .bind(flow_id)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Upserts a batch of per-flow fingerprint sets, merges their groups and
    /// rewrites the parent/child links of every flow in the touched groups
    /// into a time-ordered chain.
    pub async fn link_fingerprints(&self, batch: &[(Uuid, Vec<i32>)]) -> anyhow::Result<()> {
        let mut touched_groups: BTreeSet<i32> = BTreeSet::new();

        for (_, fingerprints) in batch {
            if fingerprints.is_empty() {
                continue;
            }

            let rows = sqlx::query("SELECT id, grp FROM fingerprint WHERE id = ANY($1)")
                .bind(fingerprints)
                .fetch_all(&self.pool)
                .await?;
            let existing: Vec<i32> = rows.iter().map(|row| row.get::<i32, _>("grp")).collect();
            let target = existing.iter().min().copied().unwrap_or(fingerprints[0]);

            sqlx::query(
                "INSERT INTO fingerprint (id, grp) SELECT unnest($1::integer[]), $2
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(fingerprints)
            .bind(target)
            .execute(&self.pool)
            .await?;

            let merged: Vec<i32> = existing.into_iter().filter(|grp| *grp != target).collect();
            if !merged.is_empty() {
                sqlx::query("UPDATE fingerprint SET grp = $1 WHERE grp = ANY($2)")
                    .bind(target)
                    .bind(&merged)
                    .execute(&self.pool)
                    .await?;
            }
            touched_groups.insert(target);
        }

        if touched_groups.is_empty() {
            return Ok(());
        }

        let groups: Vec<i32> = touched_groups.into_iter().collect();
        sqlx::query(
            "WITH members AS (
                 SELECT DISTINCT f.id, f.start_time, fp.grp
                 FROM flow f
                 JOIN fingerprint fp ON fp.id = ANY(f.fingerprints)
                 WHERE fp.grp = ANY($1)
             ),
             linked AS (
                 SELECT id,
                        lag(id) OVER (PARTITION BY grp ORDER BY start_time, id) AS parent_id,
                        lead(id) OVER (PARTITION BY grp ORDER BY start_time, id) AS child_id
                 FROM members
             )
             UPDATE flow SET link_parent_id = linked.parent_id,
                             link_child_id = linked.child_id
             FROM linked WHERE flow.id = linked.id",
        )
        .bind(&groups)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Signature {
    pub id: i64,
    pub msg: String,
    pub action: String,
}

#[derive(Debug, Clone)]
pub struct FlowTuple {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub start: DateTime<Utc>,
}

struct FlowRow {
    id: Uuid,
    src_ip: String,
    dst_ip: String,
    src_port: i32,
    dst_port: i32,
    start_time: DateTime<Utc>,
    duration_ms: i64,
    num_packets: i32,
    size: i64,
    tags: serde_json::Value,
    flags: serde_json::Value,
    flagids: serde_json::Value,
    flags_in: i32,
    flags_out: i32,
    fingerprints: Vec<i32>,
    pcap_id: Option<Uuid>,
}

struct ItemRow {
    id: Uuid,
    flow_id: Uuid,
    kind: String,
    direction: String,
    data: Vec<u8>,
    time: DateTime<Utc>,
}

struct IndexRow {
    flow_id: Uuid,
    text: String,
}

struct FlowWriter {
    pool: PgPool,
}

impl BatchWrite for FlowWriter {
    type Row = FlowRow;

    async fn write(&self, rows: &[FlowRow]) -> anyhow::Result<()> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO flow (id, src_ip, dst_ip, src_port, dst_port, start_time, \
             duration_ms, num_packets, size, tags, flags, flagids, flags_in, flags_out, \
             fingerprints, pcap_id) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(&row.src_ip)
                .push_bind(&row.dst_ip)
                .push_bind(row.src_port)
                .push_bind(row.dst_port)
                .push_bind(row.start_time)
                .push_bind(row.duration_ms)
                .push_bind(row.num_packets)
                .push_bind(row.size)
                .push_bind(&row.tags)
                .push_bind(&row.flags)
                .push_bind(&row.flagids)
                .push_bind(row.flags_in)
                .push_bind(row.flags_out)
                .push_bind(&row.fingerprints)
                .push_bind(row.pcap_id);
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

struct ItemWriter {
    pool: PgPool,
}

impl BatchWrite for ItemWriter {
    type Row = ItemRow;

    async fn write(&self, rows: &[ItemRow]) -> anyhow::Result<()> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO flow_item (id, flow_id, kind, direction, data, time) ");
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.flow_id)
                .push_bind(&row.kind)
                .push_bind(&row.direction)
                .push_bind(&row.data)
                .push_bind(row.time);
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

struct IndexWriter {
    pool: PgPool,
}

impl BatchWrite for IndexWriter {
    type Row = IndexRow;

    async fn write(&self, rows: &[IndexRow]) -> anyhow::Result<()> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO flow_index (flow_id, text) ");
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.flow_id).push_bind(&row.text);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

/// The write side of the pipeline: three independent batchers plus the
/// fingerprint queue and the in-memory tag catalog.
pub struct FlowStore {
    db: Database,
    flows: Batcher<FlowRow>,
    items: Batcher<ItemRow>,
    index: Batcher<IndexRow>,
    pcap_ids: Mutex<HashMap<String, Uuid>>,
    fingerprint_queue: Mutex<Vec<(Uuid, Vec<i32>)>>,
    tag_set: RwLock<BTreeSet<String>>,
}

impl FlowStore {
    pub fn new(db: Database) -> Arc<FlowStore> {
        let flows = Batcher::start(
            "flow",
            FlowWriter {
                pool: db.pool.clone(),
            },
            FLOW_BATCH_SIZE,
            BATCH_TIMEOUT,
        );
        let items = Batcher::start(
            "flow_item",
            ItemWriter {
                pool: db.pool.clone(),
            },
            ITEM_BATCH_SIZE,
            BATCH_TIMEOUT,
        );
        let index = Batcher::start(
            "flow_index",
            IndexWriter {
                pool: db.pool.clone(),
            },
            INDEX_BATCH_SIZE,
            BATCH_TIMEOUT,
        );

        Arc::new(FlowStore {
            db,
            flows,
            items,
            index,
            pcap_ids: Mutex::new(HashMap::new()),
            fingerprint_queue: Mutex::new(vec![]),
            tag_set: RwLock::new(BTreeSet::new()),
        })
    }

    /// Persists one enriched flow: item rows first, then the flow row once
    /// its items have landed, full-text chunks alongside. The flow row is
    /// dropped only when every single item row failed.
    pub async fn submit(self: &Arc<FlowStore>, flow: FlowEntry) {
        let pcap_id = self.resolve_pcap(&flow.source_name).await;

        {
            let mut known = self.tag_set.write().expect("tag set lock poisoned");
            for tag in &flow.tags {
                known.insert(tag.clone());
            }
        }

        let fingerprints: Vec<i32> = flow.fingerprints.iter().map(|fp| *fp as i32).collect();
        if !fingerprints.is_empty() {
            self.fingerprint_queue
                .lock()
                .expect("fingerprint queue lock poisoned")
                .push((flow.id, fingerprints.clone()));
        }

        let flow_row = FlowRow {
            id: flow.id,
            src_ip: flow.src_ip.to_string(),
            dst_ip: flow.dst_ip.to_string(),
            src_port: flow.src_port as i32,
            dst_port: flow.dst_port as i32,
            start_time: flow.start_time,
            duration_ms: flow.duration.num_milliseconds(),
            num_packets: flow.num_packets as i32,
            size: flow.size_bytes as i64,
            tags: to_json_array(&flow.tags),
            flags: to_json_array(&flow.flags),
            flagids: to_json_array(&flow.flagids),
            flags_in: flow.flags_in as i32,
            flags_out: flow.flags_out as i32,
            fingerprints,
            pcap_id,
        };

        let mut acks = vec![];
        for item in &flow.items {
            for chunk in index_chunks(&item.payload) {
                self.index
                    .push(IndexRow {
                        flow_id: flow.id,
                        text: chunk,
                    })
                    .await;
            }

            let ack = self
                .items
                .push_with_ack(ItemRow {
                    id: fid_create(item.time),
                    flow_id: flow.id,
                    kind: item.kind.clone(),
                    direction: item.direction.as_str().to_string(),
                    data: item.payload.to_vec(),
                    time: item.time,
                })
                .await;
            acks.push(ack);
        }

        let total = acks.len();
        let store = self.clone();
        tokio::spawn(async move {
            let mut succeeded = 0usize;
            for ack in acks {
                if matches!(ack.await, Ok(Ok(()))) {
                    succeeded += 1;
                }
            }
            if total > 0 && succeeded == 0 {
                warn!("No item landed for flow {}, dropping its flow row", flow_row.id);
                return;
            }
            store.flows.push(flow_row).await;
        });
    }

    async fn resolve_pcap(&self, name: &str) -> Option<Uuid> {
        if let Some(id) = self
            .pcap_ids
            .lock()
            .expect("pcap id cache lock poisoned")
            .get(name)
        {
            return Some(*id);
        }

        match self.db.pcap_position(name).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.db.upsert_pcap(name, 0).await {
                    warn!("Failed to register pcap {}: {:#}", name, e);
                    return None;
                }
            }
            Err(e) => {
                warn!("Failed to look up pcap {}: {:#}", name, e);
                return None;
            }
        }

        let row = sqlx::query("SELECT id FROM pcap WHERE name = $1")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await;
        match row {
            Ok(Some(row)) => {
                let id: Uuid = row.get("id");
                self.pcap_ids
                    .lock()
                    .expect("pcap id cache lock poisoned")
                    .insert(name.to_string(), id);
                Some(id)
            }
            _ => None,
        }
    }

    /// Drains the fingerprint queue; called by the 5 s linking timer.
    pub async fn flush_fingerprints(&self) {
        let batch: Vec<(Uuid, Vec<i32>)> = std::mem::take(
            &mut *self
                .fingerprint_queue
                .lock()
                .expect("fingerprint queue lock poisoned"),
        );
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.db.link_fingerprints(&batch).await {
            warn!("Failed to link fingerprints: {:#}", e);
        } else {
            debug!("Linked fingerprints for {} flows", batch.len());
        }
    }

    /// Two-way sync between the in-memory tag catalog and the tag table;
    /// called by the 5 s tag timer. Flow insertion never waits on this.
    pub async fn sync_tags(&self) {
        let known: Vec<String> = {
            let set = self.tag_set.read().expect("tag set lock poisoned");
            set.iter().cloned().collect()
        };

        match self.db.load_tags().await {
            Ok(stored) => {
                let fresh: Vec<String> = known
                    .iter()
                    .filter(|tag| !stored.contains(tag))
                    .cloned()
                    .collect();
                if let Err(e) = self.db.store_tags(&fresh).await {
                    warn!("Failed to store tags: {:#}", e);
                }
                let mut set = self.tag_set.write().expect("tag set lock poisoned");
                set.extend(stored);
            }
            Err(e) => warn!("Failed to load tags: {:#}", e),
        }
    }
}

fn to_json_array(set: &BTreeSet<String>) -> serde_json::Value {
    serde_json::Value::Array(
        set.iter()
            .map(|value| serde_json::Value::String(value.clone()))
            .collect(),
    )
}

/// Splits a payload into overlapping chunks for full-text indexing. Invalid
/// UTF-8 is replaced and NULs are stripped; the overlap keeps phrases that
/// straddle a boundary searchable.
pub fn index_chunks(payload: &[u8]) -> Vec<String> {
    let text: Vec<char> = String::from_utf8_lossy(payload)
        .chars()
        .filter(|c| *c != '\0')
        .collect();
    if text.is_empty() {
        return vec![];
    }

    let step = CHUNK_SIZE - CHUNK_OVERLAP;
    let mut chunks = vec![];
    let mut start = 0;
    loop {
        let end = (start + CHUNK_SIZE).min(text.len());
        chunks.push(text[start..end].iter().collect());
        if end == text.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_payload_is_one_chunk() {
        let chunks = index_chunks(b"hello world");
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn chunks_overlap_across_boundaries() {
        let payload: String = (0..3000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = index_chunks(payload.as_bytes());

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].chars().count(), CHUNK_SIZE);
        // Adjacent chunks share the overlap region
        let tail: String = chunks[0].chars().skip(CHUNK_SIZE - CHUNK_OVERLAP).collect();
        let head: String = chunks[1].chars().take(CHUNK_OVERLAP).collect();
        assert_eq!(tail, head);
    }

    #[test]
    fn nuls_are_stripped_and_invalid_bytes_replaced() {
        let chunks = index_chunks(b"ab\x00cd\xff");
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].contains('\0'));
        assert!(chunks[0].starts_with("abcd"));
    }

    #[test]
    fn empty_payload_has_no_chunks() {
        assert!(index_chunks(b"").is_empty());
    }
}
