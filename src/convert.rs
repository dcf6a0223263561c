use anyhow::{Context, bail};
use bytes::Bytes;
use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::flow::{Direction, FlowEntry, FlowItem};

const CALL_TIMEOUT: Duration = Duration::from_secs(1);
const RESPAWN_BACKOFF: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(250);

/// Converter layout per service: destination port → ordered stages, each an
/// ordered list of converter names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConverterConfig {
    #[serde(default)]
    pub services: HashMap<u16, Vec<Vec<String>>>,
}

impl ConverterConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<ConverterConfig> {
        let reader = std::io::BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open converter config {}", path.display()))?,
        );
        Ok(serde_yaml::from_reader(reader)?)
    }

    fn converter_names(&self) -> BTreeSet<String> {
        self.services
            .values()
            .flatten()
            .flatten()
            .cloned()
            .collect()
    }
}

#[derive(Serialize)]
struct ConvertRequest<'a> {
    src_ip: String,
    src_port: u16,
    dst_ip: String,
    dst_port: u16,
    flow: Vec<WireItem<'a>>,
}

#[derive(Serialize)]
struct WireItem<'a> {
    direction: &'static str,
    #[serde(with = "serde_bytes")]
    data: &'a [u8],
    /// Epoch milliseconds
    time: i64,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    direction: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    #[serde(default)]
    time: i64,
}

struct ChildIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

/// One long-lived helper process. Calls serialize on the io mutex; a crashed
/// or killed child leaves the io slot empty until the supervisor respawns it.
pub struct Worker {
    name: String,
    command: PathBuf,
    io: Mutex<Option<ChildIo>>,
    child: std::sync::Mutex<Option<Child>>,
    restarting: AtomicBool,
    restarted: Notify,
}

impl Worker {
    fn spawn_process(command: &Path) -> anyhow::Result<(Child, ChildIo)> {
        let mut child = Command::new("python3")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn converter {}", command.display()))?;

        let stdin = child.stdin.take().context("converter has no stdin")?;
        let stdout = child.stdout.take().context("converter has no stdout")?;
        Ok((child, ChildIo { stdin, stdout }))
    }

    fn start(name: &str, dir: &Path) -> anyhow::Result<Arc<Worker>> {
        let command = dir.join(format!("{name}.py"));
        let (child, io) = Self::spawn_process(&command)?;

        Ok(Arc::new(Worker {
            name: name.to_string(),
            command,
            io: Mutex::new(Some(io)),
            child: std::sync::Mutex::new(Some(child)),
            restarting: AtomicBool::new(false),
            restarted: Notify::new(),
        }))
    }

    fn kill(&self) {
        if let Ok(mut guard) = self.child.lock()
            && let Some(child) = guard.as_mut()
        {
            let _ = child.kill();
        }
    }

    async fn call(&self, request: Vec<u8>) -> anyhow::Result<Vec<WireChunk>> {
        while self.restarting.load(Ordering::Acquire) {
            self.restarted.notified().await;
        }

        let mut guard = self.io.lock().await;
        let Some(mut io) = guard.take() else {
            bail!("converter {} is restarting", self.name);
        };

        let exchange = tokio::task::spawn_blocking(move || -> anyhow::Result<(ChildIo, Vec<WireChunk>)> {
            io.stdin.write_all(&request)?;
            io.stdin.flush()?;
            let chunks = rmp_serde::from_read(&mut io.stdout)?;
            Ok((io, chunks))
        });

        match tokio::time::timeout(CALL_TIMEOUT, exchange).await {
            Ok(Ok(Ok((io, chunks)))) => {
                *guard = Some(io);
                Ok(chunks)
            }
            Ok(Ok(Err(e))) => {
                // Io is gone; kill the child so the supervisor respawns it
                self.kill();
                Err(e.context(format!("converter {} call failed", self.name)))
            }
            Ok(Err(join)) => {
                self.kill();
                bail!("converter {} worker panicked: {join}", self.name);
            }
            Err(_) => {
                // No retry: a converter that hung once will almost certainly
                // hang on the same input again
                self.kill();
                bail!("converter {} call timed out", self.name);
            }
        }
    }

    /// Watches for child exit and respawns with backoff. Callers waiting on
    /// the worker block until the restart event fires.
    async fn supervise(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        loop {
            let exited = {
                let mut guard = self.child.lock().expect("child lock poisoned");
                match guard.as_mut().map(|child| child.try_wait()) {
                    Some(Ok(Some(status))) => {
                        debug!("Converter {} exited with {status}", self.name);
                        *guard = None;
                        true
                    }
                    Some(Err(e)) => {
                        warn!("Failed to poll converter {}: {}", self.name, e);
                        false
                    }
                    _ => false,
                }
            };

            if shutdown.load(Ordering::Acquire) {
                self.kill();
                if let Ok(mut guard) = self.child.lock()
                    && let Some(mut child) = guard.take()
                {
                    let _ = child.wait();
                }
                return;
            }

            if !exited {
                tokio::time::sleep(EXIT_POLL).await;
                continue;
            }

            self.restarting.store(true, Ordering::Release);
            self.io.lock().await.take();

            loop {
                match Self::spawn_process(&self.command) {
                    Ok((child, io)) => {
                        *self.child.lock().expect("child lock poisoned") = Some(child);
                        *self.io.lock().await = Some(io);
                        info!("Respawned converter {}", self.name);
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to respawn converter {}: {}", self.name, e);
                        tokio::time::sleep(RESPAWN_BACKOFF).await;
                    }
                }
            }

            self.restarting.store(false, Ordering::Release);
            self.restarted.notify_waiters();
        }
    }
}

pub struct ConverterPool {
    workers: HashMap<String, Vec<Arc<Worker>>>,
    counters: HashMap<String, AtomicU64>,
    services: HashMap<u16, Vec<Vec<String>>>,
    shutdown: Arc<AtomicBool>,
}

impl ConverterPool {
    /// Spawns `workers_per_converter` children for every converter named in
    /// the config, each with its own supervisor task.
    pub fn start(
        config: ConverterConfig,
        dir: &Path,
        workers_per_converter: usize,
    ) -> anyhow::Result<ConverterPool> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers: HashMap<String, Vec<Arc<Worker>>> = HashMap::new();
        let mut counters = HashMap::new();

        for name in config.converter_names() {
            let mut set = vec![];
            for _ in 0..workers_per_converter.max(1) {
                let worker = Worker::start(&name, dir)?;
                tokio::spawn(worker.clone().supervise(shutdown.clone()));
                set.push(worker);
            }
            counters.insert(name.clone(), AtomicU64::new(0));
            workers.insert(name, set);
        }

        Ok(ConverterPool {
            workers,
            counters,
            services: config.services,
            shutdown,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in self.workers.values().flatten() {
            worker.kill();
        }
    }

    /// Round-robin rather than first-free: under contention first-free pick
    /// is prone to deadlock against the per-worker call serialization.
    fn pick(&self, name: &str) -> Option<&Arc<Worker>> {
        let set = self.workers.get(name)?;
        let counter = self.counters.get(name)?;
        let index = counter.fetch_add(1, Ordering::Relaxed) as usize;
        set.get(index % set.len())
    }

    /// Runs the per-service converter stages over a completed flow. Items are
    /// grouped by kind; a converter never sees a group it produced itself,
    /// and later stages see the accumulated output of earlier ones.
    pub async fn run_pipeline(&self, flow: &mut FlowEntry) {
        let Some(stages) = self.services.get(&flow.dst_port) else {
            return;
        };

        for stage in stages {
            let groups = kind_groups(&flow.items);
            let mut produced: Vec<FlowItem> = vec![];

            for converter in stage {
                for (kind, indices) in &groups {
                    if produced_by(kind, converter) {
                        continue;
                    }

                    match self.try_convert(converter, flow, indices).await {
                        Ok(chunks) => {
                            let kind = format!("{kind} -> {converter}");
                            produced.extend(chunks_to_items(chunks, &kind, flow));
                        }
                        Err(e) => warn!("Converter {converter} failed: {e:#}"),
                    }
                }
            }

            flow.items.extend(produced);
        }
    }

    async fn try_convert(
        &self,
        converter: &str,
        flow: &FlowEntry,
        indices: &[usize],
    ) -> anyhow::Result<Vec<WireChunk>> {
        let Some(worker) = self.pick(converter) else {
            bail!("no worker exists for converter {converter}");
        };

        let request = ConvertRequest {
            src_ip: flow.src_ip.to_string(),
            src_port: flow.src_port,
            dst_ip: flow.dst_ip.to_string(),
            dst_port: flow.dst_port,
            flow: indices
                .iter()
                .map(|&idx| {
                    let item = &flow.items[idx];
                    WireItem {
                        direction: item.direction.as_str(),
                        data: &item.payload,
                        time: item.time.timestamp_millis(),
                    }
                })
                .collect(),
        };

        worker.call(rmp_serde::to_vec_named(&request)?).await
    }
}

fn kind_groups(items: &[FlowItem]) -> Vec<(String, Vec<usize>)> {
    let mut order: Vec<String> = vec![];
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, item) in items.iter().enumerate() {
        if !groups.contains_key(&item.kind) {
            order.push(item.kind.clone());
        }
        groups.entry(item.kind.clone()).or_default().push(idx);
    }
    order
        .into_iter()
        .map(|kind| {
            let indices = groups.remove(&kind).unwrap_or_default();
            (kind, indices)
        })
        .collect()
}

fn produced_by(kind: &str, converter: &str) -> bool {
    kind.rsplit(" -> ").next() == Some(converter)
}

fn chunks_to_items(chunks: Vec<WireChunk>, kind: &str, flow: &FlowEntry) -> Vec<FlowItem> {
    // Empty output means "no change"
    chunks
        .into_iter()
        .filter(|chunk| !chunk.data.is_empty())
        .map(|chunk| {
            let direction = if chunk.direction == "s" {
                Direction::ServerToClient
            } else {
                Direction::ClientToServer
            };
            let time = chrono::Utc
                .timestamp_millis_opt(chunk.time)
                .single()
                .filter(|_| chunk.time > 0)
                .unwrap_or(flow.start_time);
            FlowItem {
                kind: kind.to_string(),
                direction,
                payload: Bytes::from(chunk.data),
                time,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(kind: &str, payload: &[u8]) -> FlowItem {
        FlowItem {
            kind: kind.to_string(),
            direction: Direction::ClientToServer,
            payload: Bytes::copy_from_slice(payload),
            time: Utc::now(),
        }
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let items = vec![
            item("raw", b"a"),
            item("raw -> b64decode", b"b"),
            item("raw", b"c"),
        ];
        let groups = kind_groups(&items);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], ("raw".to_string(), vec![0, 2]));
        assert_eq!(groups[1], ("raw -> b64decode".to_string(), vec![1]));
    }

    #[test]
    fn converters_do_not_see_their_own_output() {
        assert!(produced_by("raw -> b64decode", "b64decode"));
        assert!(produced_by("raw -> websockets -> b64decode", "b64decode"));
        assert!(!produced_by("raw -> websockets", "b64decode"));
        assert!(!produced_by("raw", "b64decode"));
    }

    #[test]
    fn wire_request_roundtrips_as_msgpack() {
        let request = ConvertRequest {
            src_ip: "10.0.0.1".into(),
            src_port: 40000,
            dst_ip: "10.0.0.2".into(),
            dst_port: 3003,
            flow: vec![WireItem {
                direction: "c",
                data: b"payload",
                time: 1234,
            }],
        };
        let encoded = rmp_serde::to_vec_named(&request).unwrap();

        #[derive(Deserialize)]
        struct Echo {
            src_ip: String,
            dst_port: u16,
            flow: Vec<WireChunk>,
        }
        let echo: Echo = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(echo.src_ip, "10.0.0.1");
        assert_eq!(echo.dst_port, 3003);
        assert_eq!(echo.flow[0].data, b"payload");
        assert_eq!(echo.flow[0].direction, "c");
    }

    #[test]
    fn chunk_time_defaults_to_flow_start() {
        let flow = FlowEntry::from_items(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            1,
            2,
            1,
            1,
            "t".into(),
            "tcp",
            vec![item("raw", b"x")],
        )
        .unwrap();

        let items = chunks_to_items(
            vec![
                WireChunk {
                    direction: "s".into(),
                    data: b"decoded".to_vec(),
                    time: 0,
                },
                WireChunk {
                    direction: "c".into(),
                    data: vec![],
                    time: 0,
                },
            ],
            "raw -> b64decode",
            &flow,
        );

        // Empty chunks are dropped, missing times clamp to flow start
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].time, flow.start_time);
        assert_eq!(items[0].direction, Direction::ServerToClient);
        assert_eq!(items[0].kind, "raw -> b64decode");
    }

    #[tokio::test]
    async fn hung_worker_call_times_out_and_is_killed() {
        // A child that never writes anything back
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let io = ChildIo {
            stdin: child.stdin.take().unwrap(),
            stdout: child.stdout.take().unwrap(),
        };
        let worker = Arc::new(Worker {
            name: "sleepy".into(),
            command: PathBuf::from("sleepy.py"),
            io: Mutex::new(Some(io)),
            child: std::sync::Mutex::new(Some(child)),
            restarting: AtomicBool::new(false),
            restarted: Notify::new(),
        });

        let started = std::time::Instant::now();
        let result = worker.call(vec![0x90]).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));

        // The kill must leave the child reapable
        let status = worker
            .child
            .lock()
            .unwrap()
            .as_mut()
            .unwrap()
            .wait()
            .unwrap();
        assert!(!status.success());
    }
}
