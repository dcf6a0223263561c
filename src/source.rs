use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use inotify::{Inotify, WatchMask};
use pcap_file::DataLink;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration as StdDuration, Instant};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DumpSettings, Settings};
use crate::db::Database;
use crate::defrag::Defragmenter;
use crate::filter::PacketFilter;
use crate::flow::FlowEntry;
use crate::packet::{self, Packet, Transport};
use crate::tcp::TcpAssembler;
use crate::udp::UdpAssembler;

const RECONNECT_BACKOFF: StdDuration = StdDuration::from_secs(5);
const WATCH_SETTLE: StdDuration = StdDuration::from_secs(2);

/// Defrag + TCP + UDP reassembly behind one lock. Capture threads push
/// packets synchronously; flush timers sweep the same state.
pub struct Assembler {
    defrag: Defragmenter,
    tcp: TcpAssembler,
    udp: UdpAssembler,
    bpf: Option<PacketFilter>,
    flush_after: chrono::Duration,
    flush_after_udp: chrono::Duration,
}

impl Assembler {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Assembler> {
        Ok(Assembler {
            defrag: Defragmenter::new(),
            tcp: TcpAssembler::new(settings.tcp.clone()),
            udp: UdpAssembler::new(settings.max_item_size),
            bpf: settings.bpf.clone(),
            flush_after: chrono::Duration::from_std(settings.flush_after)
                .context("flush-after out of range")?,
            flush_after_udp: chrono::Duration::from_std(settings.flush_after_udp)
                .context("flush-after-udp out of range")?,
        })
    }

    /// Runs one decoded packet through defrag, the BPF filter and the proper
    /// reassembler. Returns any flow the packet completed.
    pub fn ingest(&mut self, packet: Packet, source: &str) -> Vec<FlowEntry> {
        let packet = match self.defrag.process(packet) {
            Ok(Some(packet)) => packet,
            Ok(None) => return vec![],
            Err(e) => {
                debug!("Dropped datagram: {:#}", e);
                return vec![];
            }
        };

        if let Some(filter) = &self.bpf
            && !filter.matches(&packet)
        {
            return vec![];
        }

        match packet.transport {
            Some(Transport::Tcp {
                ref header,
                ref payload,
            }) => self
                .tcp
                .assemble(&packet.net, header, payload, packet.time, source)
                .into_iter()
                .collect(),
            Some(Transport::Udp {
                ref header,
                ref payload,
            }) => {
                self.udp.assemble(
                    (packet.net.src(), header.source_port),
                    (packet.net.dst(), header.destination_port),
                    payload,
                    packet.time,
                    source,
                );
                vec![]
            }
            None => vec![],
        }
    }

    /// Timer sweep: gap-skips and closes stale TCP connections, discards
    /// stale fragments, completes idle UDP pseudo-flows.
    pub fn flush(&mut self, now: DateTime<Utc>) -> (Vec<FlowEntry>, usize) {
        let mut flows = self.tcp.flush_older_than(now - self.flush_after);
        let discarded = self.defrag.discard_older_than(now - self.flush_after);
        flows.extend(self.udp.complete_older_than(now - self.flush_after_udp));
        (flows, discarded)
    }

    pub fn flush_all(&mut self) -> Vec<FlowEntry> {
        let mut flows = self.tcp.flush_all();
        flows.extend(self.udp.complete_all());
        flows
    }
}

/// Rotating pcap recorder. Packets land in a temp file that is persisted
/// under its final name on rotation; the final name is registered up front
/// with `position = i64::MAX` so the directory watcher never re-ingests it.
pub struct DumpWriter {
    settings: DumpSettings,
    state: Option<DumpState>,
}

struct DumpState {
    tmp: NamedTempFile,
    writer: PcapWriter<File>,
    path: PathBuf,
    name: String,
    created: Instant,
    count: u64,
}

impl DumpWriter {
    pub fn new(settings: DumpSettings) -> anyhow::Result<DumpWriter> {
        std::fs::create_dir_all(&settings.dir)
            .with_context(|| format!("failed to create dump dir {}", settings.dir.display()))?;
        Ok(DumpWriter {
            settings,
            state: None,
        })
    }

    pub fn current_name(&self) -> Option<String> {
        self.state.as_ref().map(|state| state.name.clone())
    }

    /// Appends one packet, opening a fresh file if none is active. Returns
    /// the new file's registered name when one was created.
    pub fn write(
        &mut self,
        datalink: DataLink,
        data: &[u8],
        timestamp: StdDuration,
    ) -> anyhow::Result<Option<String>> {
        let mut created = None;

        if self.state.is_none() {
            let filename = Utc::now().format(&self.settings.filename_format).to_string();
            let path = self.settings.dir.join(&filename);

            let tmp = NamedTempFile::new_in(&self.settings.dir)?;
            let file = tmp.as_file().try_clone()?;
            let header = PcapHeader {
                datalink,
                ..Default::default()
            };
            let writer = PcapWriter::with_header(file, header)?;

            let name = path.to_string_lossy().into_owned();
            info!("Created pcap dump {}", name);
            created = Some(name.clone());
            self.state = Some(DumpState {
                tmp,
                writer,
                path,
                name,
                created: Instant::now(),
                count: 0,
            });
        }

        let state = self.state.as_mut().expect("dump state just ensured");
        state.writer.write_packet(&PcapPacket {
            timestamp,
            orig_len: data.len() as u32,
            data: Cow::Borrowed(data),
        })?;
        state.count += 1;
        Ok(created)
    }

    pub fn rotate_if_due(&mut self) -> anyhow::Result<()> {
        let due = self
            .state
            .as_ref()
            .is_some_and(|state| state.created.elapsed() >= self.settings.interval);
        if due {
            self.close()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> anyhow::Result<()> {
        if let Some(state) = self.state.take() {
            drop(state.writer);
            state
                .tmp
                .persist(&state.path)
                .map_err(|e| e.error)
                .with_context(|| format!("failed to persist dump {}", state.path.display()))?;
            info!("Closed pcap dump {} with {} packets", state.name, state.count);
        }
        Ok(())
    }
}

/// Shared capture machinery: every source mode funnels its packets through
/// `process_stream`, which owns resume offsets, periodic flushing and dump
/// recording.
pub struct CaptureService {
    pub assembler: Mutex<Assembler>,
    db: Database,
    flows: mpsc::Sender<FlowEntry>,
    dump: Option<Mutex<DumpWriter>>,
    flush_interval: StdDuration,
    shutdown: Arc<AtomicBool>,
    handle: tokio::runtime::Handle,
}

impl CaptureService {
    pub fn new(
        db: Database,
        flows: mpsc::Sender<FlowEntry>,
        settings: &Settings,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<Arc<CaptureService>> {
        let dump = settings
            .dump
            .clone()
            .map(DumpWriter::new)
            .transpose()?
            .map(Mutex::new);

        Ok(Arc::new(CaptureService {
            assembler: Mutex::new(Assembler::from_settings(settings)?),
            db,
            flows,
            dump,
            flush_interval: settings.flush_interval,
            shutdown,
            handle: tokio::runtime::Handle::current(),
        }))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn send_flows(&self, flows: Vec<FlowEntry>) {
        for flow in flows {
            if self.flows.blocking_send(flow).is_err() {
                warn!("Flow channel closed, dropping flow");
            }
        }
    }

    /// Sweeps the reassembly state; runs from capture threads and from the
    /// periodic flusher. Must not be called from an async context.
    pub fn flush_connections(&self) {
        let (flows, discarded) = {
            let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
            assembler.flush(Utc::now())
        };
        if !flows.is_empty() || discarded > 0 {
            info!(
                "Flushed {} connections, discarded {} fragment buffers",
                flows.len(),
                discarded
            );
        }
        self.send_flows(flows);
    }

    /// Drains everything still buffered; used at shutdown.
    pub fn drain(&self) {
        let flows = {
            let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
            assembler.flush_all()
        };
        if !flows.is_empty() {
            info!("Drained {} in-flight connections", flows.len());
        }
        self.send_flows(flows);
    }

    pub fn process_file(&self, path: &Path) {
        let name = path.to_string_lossy().into_owned();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to open pcap {}: {}", name, e);
                return;
            }
        };

        if let Err(e) = self.process_stream(BufReader::new(file), &name, false) {
            warn!("Failed to process pcap {}: {:#}", name, e);
        }
    }

    fn process_stream<R: Read>(
        &self,
        reader: R,
        source_name: &str,
        live: bool,
    ) -> anyhow::Result<()> {
        let mut pcap = PcapReader::new(reader).context("failed to read pcap header")?;
        let datalink = pcap.header().datalink;

        let resume = self
            .handle
            .block_on(self.db.pcap_position(source_name))?
            .unwrap_or(0);
        if resume == i64::MAX {
            debug!("Skipping own dump file {}", source_name);
            return Ok(());
        }
        if resume > 0 {
            info!("Skipped {} packets from {}", resume, source_name);
        }

        let mut count = 0i64;
        let mut last_flush = Instant::now();

        while let Some(next) = pcap.next_packet() {
            if self.is_shutdown() {
                break;
            }

            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    warn!("Read error on {}: {}", source_name, e);
                    break;
                }
            };
            count += 1;
            if count <= resume {
                continue;
            }

            if !self.flush_interval.is_zero() && last_flush.elapsed() >= self.flush_interval {
                self.flush_connections();
                self.persist_position(source_name, count);
                info!("Processed {} packets from {}", count - resume, source_name);
                last_flush = Instant::now();
            }

            let mut flow_source = Cow::Borrowed(source_name);
            if let Some(dump) = &self.dump {
                let mut dump = dump.lock().expect("dump lock poisoned");
                if let Err(e) = dump.rotate_if_due() {
                    error!("Failed to rotate pcap dump: {:#}", e);
                }
                match dump.write(datalink, &record.data, record.timestamp) {
                    Ok(Some(created)) => {
                        // Register before the watcher can see the file
                        if let Err(e) =
                            self.handle.block_on(self.db.upsert_pcap(&created, i64::MAX))
                        {
                            warn!("Failed to register dump {}: {:#}", created, e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("Failed to record packet: {:#}", e),
                }
                if live && let Some(name) = dump.current_name() {
                    flow_source = Cow::Owned(name);
                }
            }

            let time = DateTime::from_timestamp(
                record.timestamp.as_secs() as i64,
                record.timestamp.subsec_nanos(),
            )
            .unwrap_or_else(Utc::now);

            let decoded = match packet::decode(datalink, &record.data, time) {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    trace!("Dropped undecodable packet: {:#}", e);
                    continue;
                }
            };

            let flows = {
                let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
                assembler.ingest(decoded, &flow_source)
            };
            self.send_flows(flows);
        }

        self.flush_connections();
        self.persist_position(source_name, count.max(resume));
        info!(
            "Processed {} packets from {}",
            (count - resume).max(0),
            source_name
        );
        Ok(())
    }

    fn persist_position(&self, source_name: &str, position: i64) {
        if let Err(e) = self.handle.block_on(self.db.upsert_pcap(source_name, position)) {
            warn!("Failed to persist position for {}: {:#}", source_name, e);
        }
    }

    /// Processes existing pcaps in scan order, then follows the directory
    /// for new files. A settling delay guards against read-while-write.
    pub async fn watch_dir(self: Arc<Self>, dir: PathBuf) -> anyhow::Result<()> {
        let stat = std::fs::metadata(&dir)
            .with_context(|| format!("failed to open watch dir {}", dir.display()))?;
        if !stat.is_dir() {
            anyhow::bail!("{} is not a directory", dir.display());
        }
        info!("Monitoring dir {}", dir.display());

        let mut existing: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_pcap_name(path))
            .collect();
        existing.sort();

        for path in existing {
            let service = self.clone();
            tokio::task::spawn_blocking(move || service.process_file(&path)).await?;
            if self.is_shutdown() {
                return Ok(());
            }
        }

        let inotify = Inotify::init().context("failed to initialize inotify")?;
        inotify
            .watches()
            .add(
                &dir,
                WatchMask::CREATE | WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO,
            )
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let mut buffer = [0u8; 4096];
        let mut stream = inotify.into_event_stream(&mut buffer)?;
        while let Some(event) = stream.next().await {
            if self.is_shutdown() {
                break;
            }
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("Inotify error: {}", e);
                    continue;
                }
            };

            let Some(name) = event.name else { continue };
            let path = dir.join(&name);
            if !is_pcap_name(&path) {
                continue;
            }

            info!("Found new file {}", path.display());
            // Settle: the writer may still be mid-file
            sleep(WATCH_SETTLE).await;

            let service = self.clone();
            tokio::task::spawn_blocking(move || service.process_file(&path)).await?;
        }

        Ok(())
    }

    /// Connects to one PCAP-over-IP endpoint and feeds its stream, forever.
    /// Each (re)connect gets a unique source name so resume offsets from a
    /// previous connection never skip fresh packets.
    pub async fn pcap_over_ip(self: Arc<Self>, endpoint: String) {
        while !self.is_shutdown() {
            info!("Connecting to PCAP-over-IP {}", endpoint);
            let service = self.clone();
            let target = endpoint.clone();

            let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let stream = TcpStream::connect(&target)
                    .with_context(|| format!("failed to connect to {target}"))?;
                let source_name = format!("{}:{}", target, Utc::now().timestamp());
                info!("Connected to PCAP-over-IP {}", source_name);
                service.process_stream(BufReader::new(stream), &source_name, true)
            })
            .await;

            match result {
                Ok(Ok(())) => debug!("PCAP-over-IP stream {} ended", endpoint),
                Ok(Err(e)) => warn!("PCAP-over-IP {}: {:#}", endpoint, e),
                Err(e) => warn!("PCAP-over-IP task failed: {}", e),
            }

            if self.is_shutdown() {
                break;
            }
            sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// Closes the active dump file, if any.
    pub fn close_dump(&self) {
        if let Some(dump) = &self.dump
            && let Err(e) = dump.lock().expect("dump lock poisoned").close()
        {
            error!("Failed to close pcap dump: {:#}", e);
        }
    }
}

pub fn is_pcap_name(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.starts_with("pcap"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssemblerArgs;
    use crate::flow::Direction;
    use clap::Parser;
    use etherparse::PacketBuilder;

    fn settings(extra: &[&str]) -> Settings {
        let mut argv = vec!["assembler", "--timescale", "postgres://x", "--nonstrict", "--skipchecksum"];
        argv.extend(extra);
        Settings::resolve(AssemblerArgs::parse_from(argv)).unwrap()
    }

    fn tcp_frame(
        src: [u8; 4],
        dst: [u8; 4],
        sport: u16,
        dport: u16,
        seq: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([0x11; 6], [0x22; 6])
            .ipv4(src, dst, 64)
            .tcp(sport, dport, seq, 65535)
            .psh()
            .ack(1);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn decode_at(frame: &[u8], ms: i64) -> Packet {
        packet::decode(
            DataLink::ETHERNET,
            frame,
            chrono::TimeZone::timestamp_millis_opt(&Utc, ms).unwrap(),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn ingest_reassembles_a_conversation() {
        let mut assembler = Assembler::from_settings(&settings(&[])).unwrap();

        let c2s = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 9999, 100, b"ping");
        let s2c = tcp_frame([10, 0, 0, 2], [10, 0, 0, 1], 9999, 40000, 500, b"pong");

        assert!(assembler.ingest(decode_at(&c2s, 0), "t").is_empty());
        assert!(assembler.ingest(decode_at(&s2c, 10), "t").is_empty());

        let flows = assembler.flush_all();
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(flow.items.len(), 2);
        assert_eq!(flow.items[0].direction, Direction::ClientToServer);
        assert_eq!(&flow.items[0].payload[..], b"ping");
        assert_eq!(flow.source_name, "t");
    }

    #[test]
    fn bpf_filter_drops_unmatched_packets() {
        let mut assembler =
            Assembler::from_settings(&settings(&["--bpf", "port 1234"])).unwrap();

        let other = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 9999, 100, b"nope");
        assembler.ingest(decode_at(&other, 0), "t");
        assert!(assembler.flush_all().is_empty());

        let mut assembler = Assembler::from_settings(&settings(&["--bpf", "port 9999"])).unwrap();
        let hit = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 9999, 100, b"yep");
        assembler.ingest(decode_at(&hit, 0), "t");
        assert_eq!(assembler.flush_all().len(), 1);
    }

    #[test]
    fn udp_flow_completes_only_by_timer() {
        let mut assembler = Assembler::from_settings(&settings(&[])).unwrap();

        let builder = PacketBuilder::ethernet2([0x11; 6], [0x22; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(5353, 53);
        let mut query = vec![];
        builder.write(&mut query, b"query").unwrap();

        let builder = PacketBuilder::ethernet2([0x22; 6], [0x11; 6])
            .ipv4([10, 0, 0, 2], [10, 0, 0, 1], 64)
            .udp(53, 5353);
        let mut answer = vec![];
        builder.write(&mut answer, b"answer").unwrap();

        assembler.ingest(decode_at(&query, 0), "t");
        assembler.ingest(decode_at(&answer, 100), "t");

        // Not yet idle for flush-after-udp
        let (flows, _) = assembler.flush(chrono::TimeZone::timestamp_millis_opt(&Utc, 5000).unwrap());
        assert!(flows.is_empty());

        let (flows, _) = assembler.flush(chrono::TimeZone::timestamp_millis_opt(&Utc, 60_000).unwrap());
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].items.len(), 2);
        assert_eq!(flows[0].items[0].direction, Direction::ClientToServer);
        assert!(flows[0].tags.contains("udp"));
    }

    #[test]
    fn pcap_roundtrip_through_reader() {
        // Write a pcap into memory, read it back and reassemble
        let header = PcapHeader {
            datalink: DataLink::ETHERNET,
            ..Default::default()
        };
        let mut writer = PcapWriter::with_header(vec![], header).unwrap();
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 9999, 100, b"hello");
        writer
            .write_packet(&PcapPacket {
                timestamp: StdDuration::from_millis(1500),
                orig_len: frame.len() as u32,
                data: Cow::Borrowed(&frame),
            })
            .unwrap();
        let bytes = writer.into_writer();

        let mut reader = PcapReader::new(&bytes[..]).unwrap();
        let datalink = reader.header().datalink;
        let mut assembler = Assembler::from_settings(&settings(&[])).unwrap();

        let mut count = 0;
        while let Some(record) = reader.next_packet() {
            let record = record.unwrap();
            count += 1;
            let time = DateTime::from_timestamp(
                record.timestamp.as_secs() as i64,
                record.timestamp.subsec_nanos(),
            )
            .unwrap();
            let packet = packet::decode(datalink, &record.data, time).unwrap().unwrap();
            assembler.ingest(packet, "mem");
        }

        assert_eq!(count, 1);
        let flows = assembler.flush_all();
        assert_eq!(flows.len(), 1);
        assert_eq!(&flows[0].items[0].payload[..], b"hello");
        assert_eq!(flows[0].start_time.timestamp_millis(), 1500);
    }

    #[test]
    fn dump_writer_rotates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut dump = DumpWriter::new(DumpSettings {
            dir: dir.path().to_path_buf(),
            interval: StdDuration::from_millis(0),
            filename_format: "%Y%m%d-%H%M%S%.f.pcap".into(),
        })
        .unwrap();

        let created = dump
            .write(DataLink::ETHERNET, b"\x00\x01", StdDuration::from_secs(1))
            .unwrap()
            .expect("first write creates a file");
        assert!(dump.current_name().is_some());

        // Interval of zero: due immediately
        dump.rotate_if_due().unwrap();
        assert!(dump.current_name().is_none());
        assert!(PathBuf::from(&created).exists());
    }

    #[test]
    fn pcap_name_matching() {
        assert!(is_pcap_name(Path::new("/tmp/dump.pcap")));
        assert!(is_pcap_name(Path::new("/tmp/dump.pcapng")));
        assert!(!is_pcap_name(Path::new("/tmp/dump.txt")));
        assert!(!is_pcap_name(Path::new("/tmp/pcap")));
    }
}
