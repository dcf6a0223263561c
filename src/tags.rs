use aho_corasick::AhoCorasick;
use regex::bytes::Regex;
use tracing::debug;

use crate::flow::{Direction, FlowEntry};
use crate::validator::{FlagValidator, Validate};

/// Runs the flag regex over every item and tags the flow. Counts take the
/// maximum over any single item per direction: converter output often repeats
/// the flags of the representation it was derived from, so summing across
/// items would overcount.
pub fn apply_flag_tags(flow: &mut FlowEntry, regex: &Regex, validator: &FlagValidator) {
    let mut flags_in = 0u32;
    let mut flags_out = 0u32;

    for idx in 0..flow.items.len() {
        let item = &flow.items[idx];
        let matches: Vec<String> = regex
            .find_iter(&item.payload)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .collect();
        if matches.is_empty() {
            continue;
        }

        let count = matches.len() as u32;
        let direction = item.direction;
        let time = item.time;
        match direction {
            Direction::ClientToServer => {
                flags_in = flags_in.max(count);
                flow.add_tag("flag-in");
            }
            Direction::ServerToClient => {
                flags_out = flags_out.max(count);
                flow.add_tag("flag-out");
            }
        }

        for flag in matches {
            if !validator.is_valid(&flag, time) {
                flow.add_tag("fake-flag");
            }
            flow.flags.insert(flag);
        }
    }

    flow.flags_in = flow.flags_in.max(flags_in);
    flow.flags_out = flow.flags_out.max(flags_out);
}

/// Multi-pattern search over the current flag-id list. Rebuilt on every cache
/// refresh, shared read-only by the flow workers.
pub struct FlagIdMatcher {
    patterns: Vec<String>,
    automaton: AhoCorasick,
}

impl FlagIdMatcher {
    pub fn new(patterns: Vec<String>) -> Option<FlagIdMatcher> {
        if patterns.is_empty() {
            return None;
        }
        match AhoCorasick::new(&patterns) {
            Ok(automaton) => Some(FlagIdMatcher {
                patterns,
                automaton,
            }),
            Err(e) => {
                debug!("Failed to build flagid matcher: {}", e);
                None
            }
        }
    }

    pub fn apply(&self, flow: &mut FlowEntry) {
        let mut hits = vec![];
        for item in &flow.items {
            let found: Vec<usize> = self
                .automaton
                .find_iter(&item.payload[..])
                .map(|m| m.pattern().as_usize())
                .collect();
            if found.is_empty() {
                continue;
            }

            let tag = match item.direction {
                Direction::ClientToServer => "flagid-in",
                Direction::ServerToClient => "flagid-out",
            };
            hits.push((tag, found));
        }

        for (tag, found) in hits {
            flow.add_tag(tag);
            for index in found {
                flow.flagids.insert(self.patterns[index].clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowItem, RAW_KIND};
    use crate::validator::ValidatorConfig;
    use bytes::Bytes;
    use chrono::{Duration, TimeZone, Utc};

    fn item(direction: Direction, payload: &[u8]) -> FlowItem {
        FlowItem {
            kind: RAW_KIND.to_string(),
            direction,
            payload: Bytes::copy_from_slice(payload),
            time: Utc.timestamp_millis_opt(0).unwrap(),
        }
    }

    fn flow_of(items: Vec<FlowItem>) -> FlowEntry {
        FlowEntry::from_items(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            40000,
            9999,
            items.len() as u32,
            items.iter().map(|i| i.payload.len()).sum(),
            "test.pcap".into(),
            "tcp",
            items,
        )
        .unwrap()
    }

    fn dummy() -> FlagValidator {
        FlagValidator::from_type(
            "",
            ValidatorConfig {
                team: -1,
                tick_start: None,
                tick_length: Duration::seconds(120),
                tolerance: Duration::hours(1),
                xor_key: String::new(),
            },
        )
        .unwrap()
    }

    #[test]
    fn client_flag_tags_flag_in() {
        let regex = Regex::new(r"FLAG\{[a-z]+\}").unwrap();
        let mut flow = flow_of(vec![item(
            Direction::ClientToServer,
            b"submit FLAG{abcd} please",
        )]);

        apply_flag_tags(&mut flow, &regex, &dummy());

        assert!(flow.tags.contains("flag-in"));
        assert!(!flow.tags.contains("flag-out"));
        assert!(!flow.tags.contains("fake-flag"));
        assert_eq!(flow.flags_in, 1);
        assert_eq!(flow.flags_out, 0);
        assert!(flow.flags.contains("FLAG{abcd}"));
    }

    #[test]
    fn counts_take_max_over_single_item() {
        let regex = Regex::new(r"FLAG\{[a-z]+\}").unwrap();
        let mut flow = flow_of(vec![
            item(Direction::ClientToServer, b"FLAG{a}"),
            item(Direction::ServerToClient, b"ok"),
            // A converted representation repeating the same flag three times
            item(
                Direction::ClientToServer,
                b"FLAG{a} FLAG{b} FLAG{c}",
            ),
        ]);

        apply_flag_tags(&mut flow, &regex, &dummy());
        assert_eq!(flow.flags_in, 3);
        assert_eq!(flow.flags.len(), 3);
    }

    #[test]
    fn invalid_flags_mark_fake() {
        let regex = Regex::new(r"FAUST_[A-Za-z0-9+/=]+").unwrap();
        let validator = FlagValidator::from_type(
            "FAUST",
            ValidatorConfig {
                team: 1,
                tick_start: None,
                tick_length: Duration::seconds(120),
                tolerance: Duration::hours(1),
                xor_key: "CTF-GAMESERVER".into(),
            },
        )
        .unwrap();

        let mut flow = flow_of(vec![item(
            Direction::ClientToServer,
            b"FAUST_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
        )]);
        apply_flag_tags(&mut flow, &regex, &validator);
        assert!(flow.tags.contains("flag-in"));
        assert!(flow.tags.contains("fake-flag"));
    }

    #[test]
    fn flagids_tag_by_direction() {
        let matcher =
            FlagIdMatcher::new(vec!["user-4242".into(), "note-1717".into()]).unwrap();
        let mut flow = flow_of(vec![
            item(Direction::ClientToServer, b"GET /profile/user-4242"),
            item(Direction::ServerToClient, b"<p>note-1717</p>"),
        ]);

        matcher.apply(&mut flow);
        assert!(flow.tags.contains("flagid-in"));
        assert!(flow.tags.contains("flagid-out"));
        assert!(flow.flagids.contains("user-4242"));
        assert!(flow.flagids.contains("note-1717"));
    }

    #[test]
    fn empty_pattern_list_builds_no_matcher() {
        assert!(FlagIdMatcher::new(vec![]).is_none());
    }
}
