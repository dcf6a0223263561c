use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::db::{Database, FlowTuple, Signature};

/// Byte-offset ratchet over the append-only eve log. Only complete lines
/// advance the offset; a truncated trailing line is retried next cycle.
pub struct EveReader {
    path: PathBuf,
    offset: u64,
}

impl EveReader {
    pub fn new(path: PathBuf) -> EveReader {
        EveReader { path, offset: 0 }
    }

    pub fn read_new_lines(&mut self) -> anyhow::Result<Vec<String>> {
        let size = std::fs::metadata(&self.path)
            .with_context(|| format!("failed to stat {}", self.path.display()))?
            .len();

        if size < self.offset {
            debug!("Eve file shrank, rescanning from the start");
            self.offset = 0;
        }
        if size == self.offset {
            return Ok(vec![]);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![];
        file.read_to_end(&mut buf)?;

        let mut lines = vec![];
        let mut consumed = 0usize;
        for chunk in buf.split_inclusive(|byte| *byte == b'\n') {
            if chunk.last() != Some(&b'\n') {
                break;
            }
            consumed += chunk.len();
            let line = String::from_utf8_lossy(&chunk[..chunk.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        self.offset += consumed as u64;
        Ok(lines)
    }
}

#[derive(Debug)]
pub struct EveEvent {
    pub tuple: FlowTuple,
    pub signature: Option<Signature>,
    pub blocked: bool,
    pub metadata_tags: Vec<String>,
    pub flowbits: Vec<String>,
}

/// Pulls the consumed subset out of one eve line. `None` covers both invalid
/// JSON and events that cannot be matched to a flow (missing tuple or start
/// time) — either way the line is done with.
pub fn parse_line(line: &str) -> Option<EveEvent> {
    let value: Value = serde_json::from_str(line).ok()?;

    // Addresses re-parse through IpAddr so they compare equal to the
    // representation the reassembler stored.
    let src_ip = value["src_ip"].as_str()?.parse::<IpAddr>().ok()?;
    let dst_ip = value["dest_ip"].as_str()?.parse::<IpAddr>().ok()?;
    let src_port = value["src_port"].as_u64()? as u16;
    let dst_port = value["dest_port"].as_u64()? as u16;
    let start = parse_eve_time(value["flow"]["start"].as_str()?)?;

    let alert = &value["alert"];
    let signature = alert["signature_id"].as_i64().map(|id| Signature {
        id,
        msg: alert["signature"].as_str().unwrap_or("").to_string(),
        action: alert["action"].as_str().unwrap_or("").to_string(),
    });
    let blocked = alert["action"].as_str() == Some("blocked");

    let metadata_tags = alert["metadata"]["tag"]
        .as_array()
        .map(|tags| {
            tags.iter()
                .filter_map(|tag| tag.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let flowbits = value["metadata"]["flowbits"]
        .as_array()
        .map(|bits| {
            bits.iter()
                .filter_map(|bit| bit.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(EveEvent {
        tuple: FlowTuple {
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
            src_port,
            dst_port,
            start,
        },
        signature,
        blocked,
        metadata_tags,
        flowbits,
    })
}

fn parse_eve_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z")
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

pub struct Enricher {
    pub db: Database,
    pub reader: EveReader,
    pub window: Duration,
    pub flowbits: bool,
}

impl Enricher {
    /// One rescan cycle: reads appended lines and applies every event that
    /// matches a flow. Returns the number of flows updated.
    pub async fn scan(&mut self) -> anyhow::Result<usize> {
        let mut updated = 0;

        for line in self.reader.read_new_lines()? {
            let Some(event) = parse_line(&line) else {
                continue;
            };

            let mut tags = vec![];
            if event.signature.is_some() {
                tags.push("suricata".to_string());
                if event.blocked {
                    tags.push("blocked".to_string());
                }
                tags.extend(event.metadata_tags.iter().cloned());
            }
            if self.flowbits {
                tags.extend(event.flowbits.iter().cloned());
            }
            if event.signature.is_none() && tags.is_empty() {
                continue;
            }

            match self
                .db
                .add_signature_to_flow(&event.tuple, self.window, event.signature.as_ref(), &tags)
                .await
            {
                Ok(true) => updated += 1,
                Ok(false) => debug!(
                    "No flow matched event {}:{} -> {}:{}",
                    event.tuple.src_ip, event.tuple.src_port, event.tuple.dst_ip, event.tuple.dst_port
                ),
                Err(e) => warn!("Failed to attach signature: {:#}", e),
            }
        }

        Ok(updated)
    }
}
