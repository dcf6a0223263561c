use regex::bytes::Regex;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::convert::ConverterPool;
use crate::db::{Database, FlowStore};
use crate::flow::FlowEntry;
use crate::http::{self, HttpConfig};
use crate::tags::{FlagIdMatcher, apply_flag_tags};
use crate::validator::FlagValidator;

const LINK_INTERVAL: StdDuration = StdDuration::from_secs(5);

/// Enrichment worker pool. Every completed flow runs HTTP recognition, the
/// converter pipeline, then one flag/flag-id pass over all representations,
/// and is finally submitted to the batchers.
pub struct Pipeline {
    inner: Arc<PipelineInner>,
    workers: Vec<JoinHandle<()>>,
}

struct PipelineInner {
    store: Arc<FlowStore>,
    db: Database,
    http: HttpConfig,
    validator: FlagValidator,
    flag_pattern: Option<String>,
    // Compiled lazily on the first completed flow, read lock-free after
    flag_regex: OnceLock<Regex>,
    converters: Option<ConverterPool>,
    flagid_enabled: bool,
    flagids: RwLock<Option<Arc<FlagIdMatcher>>>,
    flag_lifetime: chrono::Duration,
    tick_length: StdDuration,
}

impl Pipeline {
    pub fn start(
        db: Database,
        store: Arc<FlowStore>,
        settings: Settings,
        flows: mpsc::Receiver<FlowEntry>,
    ) -> anyhow::Result<Pipeline> {
        let converters = match settings.converters {
            Some((config, dir, workers)) => Some(ConverterPool::start(config, &dir, workers)?),
            None => None,
        };

        let inner = Arc::new(PipelineInner {
            store,
            db,
            http: settings.http.clone(),
            validator: settings.validator,
            flag_pattern: settings.flag_regex.clone(),
            flag_regex: OnceLock::new(),
            converters,
            flagid_enabled: settings.flagid,
            flagids: RwLock::new(None),
            flag_lifetime: settings.flag_lifetime,
            tick_length: settings.tick_length.to_std().unwrap_or(StdDuration::from_secs(60)),
        });

        let flows = Arc::new(tokio::sync::Mutex::new(flows));
        let mut workers = vec![];
        for _ in 0..settings.concurrent_flows.max(1) {
            let inner = inner.clone();
            let flows = flows.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = { flows.lock().await.recv().await };
                    match next {
                        Some(flow) => inner.process(flow).await,
                        None => break,
                    }
                }
            }));
        }
        info!("Started {} flow workers", workers.len());

        if inner.flagid_enabled {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(inner.tick_length);
                loop {
                    timer.tick().await;
                    inner.refresh_flagids().await;
                }
            });
        }

        {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(LINK_INTERVAL);
                loop {
                    timer.tick().await;
                    inner.store.flush_fingerprints().await;
                    inner.store.sync_tags().await;
                }
            });
        }

        Ok(Pipeline { inner, workers })
    }

    /// Waits for the workers to drain the flow channel, then runs one last
    /// fingerprint/tag sync so nothing is stranded in memory.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
        self.inner.store.flush_fingerprints().await;
        self.inner.store.sync_tags().await;
        if let Some(converters) = &self.inner.converters {
            converters.shutdown();
        }
    }
}

impl PipelineInner {
    async fn process(&self, mut flow: FlowEntry) {
        http::process_flow(&mut flow, &self.http);

        if let Some(converters) = &self.converters {
            converters.run_pipeline(&mut flow).await;
        }

        if let Some(regex) = self.flag_regex() {
            apply_flag_tags(&mut flow, regex, &self.validator);
        }

        if self.flagid_enabled {
            let matcher = self
                .flagids
                .read()
                .expect("flagid lock poisoned")
                .clone();
            if let Some(matcher) = matcher {
                matcher.apply(&mut flow);
            }
        }

        debug!(
            flow = %flow.id,
            items = flow.items.len(),
            tags = ?flow.tags,
            "Processed flow"
        );
        self.store.submit(flow).await;
    }

    fn flag_regex(&self) -> Option<&Regex> {
        let pattern = self.flag_pattern.as_deref()?;
        if let Some(regex) = self.flag_regex.get() {
            return Some(regex);
        }
        match Regex::new(pattern) {
            Ok(regex) => Some(self.flag_regex.get_or_init(|| regex)),
            Err(e) => {
                warn!("Failed to compile flag regex: {}", e);
                None
            }
        }
    }

    async fn refresh_flagids(&self) {
        match self.db.current_flagids(self.flag_lifetime).await {
            Ok(flagids) => {
                let matcher = FlagIdMatcher::new(flagids).map(Arc::new);
                *self.flagids.write().expect("flagid lock poisoned") = matcher;
            }
            Err(e) => warn!("Failed to refresh flagids: {:#}", e),
        }
    }
}
