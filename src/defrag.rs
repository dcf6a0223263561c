use anyhow::bail;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use crate::packet::{Net, Packet, parse_transport};

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragKey {
    src: IpAddr,
    dst: IpAddr,
    id: u16,
    protocol: u8,
}

#[derive(Debug, Default)]
struct FragBuffer {
    /// byte offset → fragment payload
    fragments: BTreeMap<usize, Bytes>,
    total_len: Option<usize>,
    first_seen: Option<DateTime<Utc>>,
}

/// Collects IPv4 fragments until a datagram is whole, then re-parses its
/// transport layer. IPv6 and unfragmented traffic pass through untouched.
#[derive(Debug, Default)]
pub struct Defragmenter {
    buffers: HashMap<FragKey, FragBuffer>,
}

impl Defragmenter {
    pub fn new() -> Defragmenter {
        Defragmenter::default()
    }

    /// Returns `Ok(None)` while a datagram is still incomplete; such packets
    /// are dropped from the pipeline. Disagreeing fragments fail the whole
    /// datagram.
    pub fn process(&mut self, packet: Packet) -> anyhow::Result<Option<Packet>> {
        let Net::V4 { header, payload } = &packet.net else {
            return Ok(Some(packet));
        };
        if !header.is_fragmenting_payload() {
            return Ok(Some(packet));
        }

        let key = FragKey {
            src: packet.net.src(),
            dst: packet.net.dst(),
            id: header.identification,
            protocol: header.protocol.0,
        };
        let offset = header.fragment_offset.value() as usize * 8;
        if offset + payload.len() > MAX_DATAGRAM {
            self.buffers.remove(&key);
            bail!("fragment exceeds the maximum datagram size");
        }

        let buffer = self.buffers.entry(key).or_default();
        buffer.first_seen.get_or_insert(packet.time);

        if let Some(existing) = buffer.fragments.get(&offset)
            && existing != payload
        {
            self.buffers.remove(&key);
            bail!("fragments disagree at offset {offset}");
        }
        buffer.fragments.insert(offset, payload.clone());

        if !header.more_fragments {
            buffer.total_len = Some(offset + payload.len());
        }

        let Some(total_len) = buffer.total_len else {
            return Ok(None);
        };

        // Walk coverage; bail out (still incomplete) on any hole
        let mut data = Vec::with_capacity(total_len);
        for (&frag_offset, fragment) in &buffer.fragments {
            if frag_offset > data.len() {
                return Ok(None);
            }
            let skip = data.len() - frag_offset;
            if skip < fragment.len() {
                data.extend_from_slice(&fragment[skip..]);
            }
        }
        if data.len() < total_len {
            return Ok(None);
        }

        let mut header = header.clone();
        self.buffers.remove(&key);
        header.more_fragments = false;
        header.fragment_offset = etherparse::IpFragOffset::ZERO;

        let transport = parse_transport(header.protocol, &data);
        Ok(Some(Packet {
            time: packet.time,
            net: Net::V4 {
                header,
                payload: Bytes::from(data),
            },
            transport,
        }))
    }

    /// Drops fragment buffers that started before the threshold.
    pub fn discard_older_than(&mut self, threshold: DateTime<Utc>) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| buffer.first_seen.is_none_or(|seen| seen >= threshold));
        before - self.buffers.len()
    }
}
