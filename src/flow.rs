use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use uuid::Uuid;

use crate::db::fid::fid_create;

pub const RAW_KIND: &str = "raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "c")]
    ClientToServer,
    #[serde(rename = "s")]
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "c",
            Direction::ServerToClient => "s",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowItem {
    pub kind: String,
    pub direction: Direction,
    pub payload: Bytes,
    pub time: DateTime<Utc>,
}

/// One reconstructed conversation, ready for enrichment and persistence.
#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub id: Uuid,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub start_time: DateTime<Utc>,
    pub duration: Duration,
    pub num_packets: u32,
    pub size_bytes: usize,
    pub tags: BTreeSet<String>,
    pub flags: BTreeSet<String>,
    pub flagids: BTreeSet<String>,
    pub flags_in: u32,
    pub flags_out: u32,
    pub fingerprints: BTreeSet<u32>,
    pub source_name: String,
    pub items: Vec<FlowItem>,
}

impl FlowEntry {
    /// Builds a flow from an emitted item sequence. Returns `None` for empty
    /// sequences: without items there is no timestamp to anchor the flow to.
    #[allow(clippy::too_many_arguments)]
    pub fn from_items(
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        num_packets: u32,
        size_bytes: usize,
        source_name: String,
        base_tag: &str,
        items: Vec<FlowItem>,
    ) -> Option<FlowEntry> {
        let start_time = items.first()?.time;
        let end_time = items.last().map(|item| item.time)?;

        Some(FlowEntry {
            id: fid_create(start_time),
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            start_time,
            duration: end_time - start_time,
            num_packets,
            size_bytes,
            tags: BTreeSet::from([base_tag.to_string()]),
            flags: BTreeSet::new(),
            flagids: BTreeSet::new(),
            flags_in: 0,
            flags_out: 0,
            fingerprints: BTreeSet::new(),
            source_name,
            items,
        })
    }

    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.contains(tag) {
            self.tags.insert(tag.to_string());
        }
    }
}

/// Append-only item accumulator used by both reassemblers: consecutive
/// same-direction payloads extend the previous item, and bytes past the
/// per-flow cap are silently truncated.
#[derive(Debug)]
pub struct ItemBuffer {
    items: Vec<FlowItem>,
    accepted: usize,
    max_size: usize,
}

impl ItemBuffer {
    pub fn new(max_size: usize) -> ItemBuffer {
        ItemBuffer {
            items: vec![],
            accepted: 0,
            max_size,
        }
    }

    pub fn push(&mut self, direction: Direction, data: &[u8], time: DateTime<Utc>) {
        if data.is_empty() {
            return;
        }

        let available = self.max_size.saturating_sub(self.accepted);
        let length = data.len().min(available);
        if length == 0 {
            return;
        }
        self.accepted += length;
        let data = &data[..length];

        match self.items.last_mut() {
            Some(last) if last.direction == direction => {
                let mut payload = Vec::with_capacity(last.payload.len() + length);
                payload.extend_from_slice(&last.payload);
                payload.extend_from_slice(data);
                last.payload = Bytes::from(payload);
            }
            _ => self.items.push(FlowItem {
                kind: RAW_KIND.to_string(),
                direction,
                payload: Bytes::copy_from_slice(data),
                time,
            }),
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<FlowItem> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn same_direction_items_coalesce() {
        let mut buffer = ItemBuffer::new(1024);
        buffer.push(Direction::ClientToServer, b"GET ", ts(0));
        buffer.push(Direction::ClientToServer, b"/ HTTP/1.1", ts(5));
        buffer.push(Direction::ServerToClient, b"200", ts(10));

        let items = buffer.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(&items[0].payload[..], b"GET / HTTP/1.1");
        // Coalescing keeps the first packet's timestamp
        assert_eq!(items[0].time, ts(0));
        assert_eq!(items[1].direction, Direction::ServerToClient);
    }

    #[test]
    fn cap_truncates_silently() {
        let mut buffer = ItemBuffer::new(10);
        buffer.push(Direction::ClientToServer, b"0123456789abcdef", ts(0));
        buffer.push(Direction::ServerToClient, b"more", ts(1));

        assert_eq!(buffer.accepted(), 10);
        let items = buffer.into_items();
        assert_eq!(items.len(), 1);
        assert_eq!(&items[0].payload[..], b"0123456789");
    }

    #[test]
    fn flow_times_span_items() {
        let mut buffer = ItemBuffer::new(1024);
        buffer.push(Direction::ClientToServer, b"ping", ts(100));
        buffer.push(Direction::ServerToClient, b"pong", ts(250));

        let entry = FlowEntry::from_items(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            1234,
            9999,
            2,
            8,
            "test.pcap".into(),
            "tcp",
            buffer.into_items(),
        )
        .unwrap();

        assert_eq!(entry.start_time, ts(100));
        assert_eq!(entry.duration, Duration::milliseconds(150));
        assert!(entry.tags.contains("tcp"));
    }

    #[test]
    fn empty_item_sequence_yields_no_flow() {
        let entry = FlowEntry::from_items(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            1,
            2,
            0,
            0,
            "test.pcap".into(),
            "tcp",
            vec![],
        );
        assert!(entry.is_none());
    }
}
