use chrono::{DateTime, Utc};
use etherparse::TcpHeader;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tracing::{debug, trace};

use crate::flow::{Direction, FlowEntry, ItemBuffer};
use crate::packet::Net;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub max_item_size: usize,
    /// Enforce RFC 793 transitions; when false a mid-stream packet on an
    /// unknown connection promotes it straight to `Established`.
    pub strict: bool,
    pub verify_checksum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Closed,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
}

#[derive(Debug)]
struct TcpFsm {
    state: FsmState,
    strict: bool,
    /// Side that sent the first FIN, used to tell retransmits from the
    /// closing handshake of the other side.
    fin_from: Option<Direction>,
}

impl TcpFsm {
    fn new(strict: bool) -> TcpFsm {
        TcpFsm {
            state: FsmState::Closed,
            strict,
            fin_from: None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.fin_from.is_some() && matches!(self.state, FsmState::TimeWait | FsmState::Closed)
    }

    /// Runs one packet through the state machine. Returns false when the
    /// transition is not allowed; in strict mode such packets are rejected.
    fn accept(&mut self, dir: Direction, tcp: &TcpHeader) -> bool {
        use FsmState::*;

        if tcp.rst {
            self.state = Closed;
            self.fin_from.get_or_insert(dir);
            return true;
        }

        let next = match (self.state, dir) {
            (Closed, Direction::ClientToServer) if tcp.syn && !tcp.ack => Some(SynSent),
            (Closed, _) if !self.strict => Some(Established),
            (SynSent, Direction::ServerToClient) if tcp.syn && tcp.ack => Some(SynRecv),
            (SynSent, Direction::ClientToServer) if tcp.syn && !tcp.ack => Some(SynSent),
            (SynRecv, Direction::ClientToServer) if tcp.ack && !tcp.syn => {
                if tcp.fin {
                    self.fin_from = Some(dir);
                    Some(FinWait)
                } else {
                    Some(Established)
                }
            }
            (SynRecv, Direction::ServerToClient) if tcp.syn && tcp.ack => Some(SynRecv),
            (Established, _) => {
                if tcp.fin {
                    self.fin_from = Some(dir);
                    Some(FinWait)
                } else {
                    Some(Established)
                }
            }
            (FinWait, d) => {
                if tcp.fin && self.fin_from != Some(d) {
                    Some(Closing)
                } else if tcp.fin {
                    Some(FinWait)
                } else if tcp.ack && self.fin_from != Some(d) {
                    Some(CloseWait)
                } else {
                    Some(FinWait)
                }
            }
            (CloseWait, d) => {
                if tcp.fin && self.fin_from != Some(d) {
                    Some(LastAck)
                } else {
                    Some(CloseWait)
                }
            }
            (LastAck, d) => {
                if tcp.ack && self.fin_from == Some(d) {
                    Some(TimeWait)
                } else {
                    Some(LastAck)
                }
            }
            (Closing, _) if tcp.ack => Some(TimeWait),
            (Closing, _) => Some(Closing),
            (TimeWait, _) => Some(TimeWait),
            _ => None,
        };

        match next {
            Some(state) => {
                self.state = state;
                true
            }
            None => !self.strict,
        }
    }
}

#[derive(Debug)]
struct QueuedSegment {
    data: Vec<u8>,
    time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct HalfStream {
    expected_seq: Option<u32>,
    queued: BTreeMap<u32, QueuedSegment>,
    oldest_queued: Option<DateTime<Utc>>,
}

impl HalfStream {
    /// Accepts in-order data, queues out-of-order data, trims overlaps.
    /// Every byte handed to `out` is in stream order.
    fn accept(
        &mut self,
        seq: u32,
        data: &[u8],
        time: DateTime<Utc>,
        mut out: impl FnMut(&[u8], DateTime<Utc>),
    ) {
        if data.is_empty() {
            return;
        }

        let expected = *self.expected_seq.get_or_insert(seq);
        let diff = seq.wrapping_sub(expected) as i32;

        if diff > 0 {
            self.queued.entry(seq).or_insert(QueuedSegment {
                data: data.to_vec(),
                time,
            });
            let oldest = self.oldest_queued.get_or_insert(time);
            if time < *oldest {
                *oldest = time;
            }
            return;
        }

        // Retransmission that brings nothing new
        if (diff as i64) + (data.len() as i64) <= 0 {
            return;
        }

        let fresh = &data[(-diff) as usize..];
        out(fresh, time);
        self.expected_seq = Some(seq.wrapping_add(data.len() as u32));
        self.drain(&mut out);
    }

    fn drain(&mut self, out: &mut impl FnMut(&[u8], DateTime<Utc>)) {
        while let Some((&seq, _)) = self.queued.first_key_value() {
            let expected = self.expected_seq.unwrap_or(seq);
            let diff = seq.wrapping_sub(expected) as i32;
            if diff > 0 {
                break;
            }

            let segment = self.queued.remove(&seq).unwrap();
            if (diff as i64) + (segment.data.len() as i64) > 0 {
                let fresh = &segment.data[(-diff) as usize..];
                out(fresh, segment.time);
                self.expected_seq = Some(seq.wrapping_add(segment.data.len() as u32));
            }
        }
        self.oldest_queued = self.queued.values().map(|segment| segment.time).min();
    }

    /// Gives up on the oldest gap: jumps the expected counter to the first
    /// queued segment and drains whatever became contiguous.
    fn skip_gap(&mut self, out: &mut impl FnMut(&[u8], DateTime<Utc>)) {
        if let Some((&seq, _)) = self.queued.first_key_value() {
            self.expected_seq = Some(seq);
            self.drain(out);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    lo: (IpAddr, u16),
    hi: (IpAddr, u16),
}

impl StreamKey {
    fn new(a: (IpAddr, u16), b: (IpAddr, u16)) -> StreamKey {
        if a <= b {
            StreamKey { lo: a, hi: b }
        } else {
            StreamKey { lo: b, hi: a }
        }
    }
}

struct TcpStream {
    client: (IpAddr, u16),
    server: (IpAddr, u16),
    fsm: TcpFsm,
    to_server: HalfStream,
    to_client: HalfStream,
    items: ItemBuffer,
    num_packets: u32,
    source: String,
    last_seen: DateTime<Utc>,
    /// Set once the flow has been handed downstream. The record stays in the
    /// pool so a late ACK does not open a fresh stream.
    emitted: bool,
}

impl TcpStream {
    fn complete(&mut self) -> Option<FlowEntry> {
        if self.emitted {
            return None;
        }
        self.emitted = true;

        let items = std::mem::replace(&mut self.items, ItemBuffer::new(0));
        let size_bytes = items.accepted();
        FlowEntry::from_items(
            self.client.0,
            self.server.0,
            self.client.1,
            self.server.1,
            self.num_packets,
            size_bytes,
            self.source.clone(),
            "tcp",
            items.into_items(),
        )
    }

    fn oldest_gap(&self) -> Option<DateTime<Utc>> {
        match (self.to_server.oldest_queued, self.to_client.oldest_queued) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

pub struct TcpAssembler {
    streams: HashMap<StreamKey, TcpStream>,
    config: TcpConfig,
}

impl TcpAssembler {
    pub fn new(config: TcpConfig) -> TcpAssembler {
        TcpAssembler {
            streams: HashMap::new(),
            config,
        }
    }

    pub fn pending(&self) -> usize {
        self.streams.values().filter(|s| !s.emitted).count()
    }

    /// Feeds one TCP packet into the pool. Returns a completed flow when the
    /// packet closes its connection.
    pub fn assemble(
        &mut self,
        net: &Net,
        tcp: &TcpHeader,
        payload: &[u8],
        time: DateTime<Utc>,
        source: &str,
    ) -> Option<FlowEntry> {
        if self.config.verify_checksum
            && let Net::V4 { header, .. } = net
            && tcp
                .calc_checksum_ipv4(header, payload)
                .map(|sum| sum != tcp.checksum)
                .unwrap_or(true)
        {
            debug!("Dropped tcp packet with bad checksum");
            return None;
        }

        let src = (net.src(), tcp.source_port);
        let dst = (net.dst(), tcp.destination_port);
        let key = StreamKey::new(src, dst);

        let stream = self.streams.entry(key).or_insert_with(|| TcpStream {
            client: src,
            server: dst,
            fsm: TcpFsm::new(self.config.strict),
            to_server: HalfStream::default(),
            to_client: HalfStream::default(),
            items: ItemBuffer::new(self.config.max_item_size),
            num_packets: 0,
            source: source.to_string(),
            last_seen: time,
            emitted: false,
        });

        let direction = if src == stream.client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };

        if !stream.fsm.accept(direction, tcp) {
            trace!("Rejected tcp packet in state {:?}", stream.fsm.state);
            return None;
        }

        stream.last_seen = time;
        stream.num_packets += 1;

        if !payload.is_empty() {
            // SYN consumes one sequence number ahead of any data
            let seq = if tcp.syn {
                tcp.sequence_number.wrapping_add(1)
            } else {
                tcp.sequence_number
            };

            let items = &mut stream.items;
            let half = match direction {
                Direction::ClientToServer => &mut stream.to_server,
                Direction::ServerToClient => &mut stream.to_client,
            };
            half.accept(seq, payload, time, |data, first_seen| {
                items.push(direction, data, first_seen);
            });
        }

        if stream.fsm.is_terminal() {
            return stream.complete();
        }
        None
    }

    /// Periodic flush: connections whose oldest un-filled gap predates the
    /// threshold get the gap skipped; idle connections are force-completed.
    /// Tombstones of already-emitted connections are dropped once idle.
    pub fn flush_older_than(&mut self, threshold: DateTime<Utc>) -> Vec<FlowEntry> {
        let mut completed = vec![];

        for stream in self.streams.values_mut() {
            if stream.emitted {
                continue;
            }

            if stream.oldest_gap().is_some_and(|oldest| oldest < threshold) {
                let items = &mut stream.items;
                for (half, direction) in [
                    (&mut stream.to_server, Direction::ClientToServer),
                    (&mut stream.to_client, Direction::ServerToClient),
                ] {
                    while half.oldest_queued.is_some_and(|oldest| oldest < threshold) {
                        half.skip_gap(&mut |data, first_seen| {
                            items.push(direction, data, first_seen);
                        });
                    }
                }
            }

            if stream.last_seen < threshold {
                completed.extend(stream.complete());
            }
        }

        self.streams
            .retain(|_, stream| !(stream.emitted && stream.last_seen < threshold));
        completed
    }

    /// Drains every remaining connection, queued gaps included. Used on
    /// shutdown so in-flight conversations are not lost.
    pub fn flush_all(&mut self) -> Vec<FlowEntry> {
        let mut completed = vec![];
        for stream in self.streams.values_mut() {
            let items = &mut stream.items;
            for (half, direction) in [
                (&mut stream.to_server, Direction::ClientToServer),
                (&mut stream.to_client, Direction::ServerToClient),
            ] {
                while !half.queued.is_empty() {
                    half.skip_gap(&mut |data, first_seen| {
                        items.push(direction, data, first_seen);
                    });
                }
            }
            completed.extend(stream.complete());
        }
        self.streams.clear();
        completed
    }
}
