use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::flow::{Direction, FlowEntry, ItemBuffer};

/// UDP has no close signal, so pseudo-flows are keyed by the unordered
/// endpoint and port pairs and finished purely by idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PseudoFlowKey {
    endpoints: (IpAddr, IpAddr),
    ports: (u16, u16),
}

impl PseudoFlowKey {
    fn new(src: (IpAddr, u16), dst: (IpAddr, u16)) -> PseudoFlowKey {
        PseudoFlowKey {
            endpoints: (src.0.min(dst.0), src.0.max(dst.0)),
            ports: (src.1.min(dst.1), src.1.max(dst.1)),
        }
    }
}

struct UdpStream {
    client: (IpAddr, u16),
    server: (IpAddr, u16),
    items: ItemBuffer,
    num_packets: u32,
    source: String,
    last_seen: DateTime<Utc>,
}

pub struct UdpAssembler {
    streams: HashMap<PseudoFlowKey, UdpStream>,
    max_item_size: usize,
}

impl UdpAssembler {
    pub fn new(max_item_size: usize) -> UdpAssembler {
        UdpAssembler {
            streams: HashMap::new(),
            max_item_size,
        }
    }

    pub fn pending(&self) -> usize {
        self.streams.len()
    }

    pub fn assemble(
        &mut self,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        payload: &[u8],
        time: DateTime<Utc>,
        source: &str,
    ) {
        if payload.is_empty() {
            return;
        }

        let key = PseudoFlowKey::new(src, dst);
        let max_item_size = self.max_item_size;
        let stream = self.streams.entry(key).or_insert_with(|| UdpStream {
            // Whoever speaks first is the client
            client: src,
            server: dst,
            items: ItemBuffer::new(max_item_size),
            num_packets: 0,
            source: source.to_string(),
            last_seen: time,
        });

        let direction = if src == stream.client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };

        stream.last_seen = time;
        stream.num_packets += 1;
        stream.items.push(direction, payload, time);
    }

    pub fn complete_older_than(&mut self, threshold: DateTime<Utc>) -> Vec<FlowEntry> {
        let expired: Vec<PseudoFlowKey> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.last_seen < threshold)
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.streams.remove(&key))
            .filter_map(UdpStream::into_flow)
            .collect()
    }

    pub fn complete_all(&mut self) -> Vec<FlowEntry> {
        self.streams
            .drain()
            .filter_map(|(_, stream)| stream.into_flow())
            .collect()
    }
}

impl UdpStream {
    fn into_flow(self) -> Option<FlowEntry> {
        let size_bytes = self.items.accepted();
        FlowEntry::from_items(
            self.client.0,
            self.server.0,
            self.client.1,
            self.server.1,
            self.num_packets,
            size_bytes,
            self.source,
            "udp",
            self.items.into_items(),
        )
    }
}
