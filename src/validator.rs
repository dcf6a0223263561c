use anyhow::bail;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Games with verifiable flag formats let the tagger mark flags that could
/// never score ("fake-flag"): replayed from an old tick, forged for another
/// team, or plain garbage with the right shape.
#[enum_dispatch::enum_dispatch]
pub trait Validate {
    fn is_valid(&self, flag: &str, reference: DateTime<Utc>) -> bool;
}

#[enum_dispatch::enum_dispatch(Validate)]
pub enum FlagValidator {
    Dummy(DummyValidator),
    Faust(FaustValidator),
    Enowars(EnowarsValidator),
    ItalyAd(ItalyAdValidator),
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Team id the flag should belong to; -1 disables the check.
    pub team: i64,
    /// Origin of tick 0; `None` disables tick-based time reconstruction.
    pub tick_start: Option<DateTime<Utc>>,
    pub tick_length: Duration,
    /// Accept window around the reference time; zero disables the check.
    pub tolerance: Duration,
    /// XOR key for the Faust format.
    pub xor_key: String,
}

impl FlagValidator {
    pub fn from_type(kind: &str, config: ValidatorConfig) -> anyhow::Result<FlagValidator> {
        match kind {
            "" => Ok(DummyValidator.into()),
            "FAUST" => Ok(FaustValidator { config }.into()),
            "ENO" => Ok(EnowarsValidator { config }.into()),
            "ITAD" => Ok(ItalyAdValidator { config }.into()),
            other => bail!("unknown flag validator type {other:?}"),
        }
    }
}

fn time_ok(config: &ValidatorConfig, flag_time: DateTime<Utc>, reference: DateTime<Utc>) -> bool {
    if config.tolerance.is_zero() {
        return true;
    }
    let delta = flag_time - reference;
    -config.tolerance <= delta && delta <= config.tolerance
}

fn tick_time(config: &ValidatorConfig, tick: i64) -> Option<DateTime<Utc>> {
    Some(config.tick_start? + config.tick_length * tick as i32)
}

pub struct DummyValidator;

impl Validate for DummyValidator {
    fn is_valid(&self, _flag: &str, _reference: DateTime<Utc>) -> bool {
        true
    }
}

/// Faust format: the last 32 base64 characters decode to at least 14 bytes
/// which, XORed against the game key, carry a big-endian millisecond
/// timestamp (bytes 0-7) and the owner's subnet id (bytes 12-13).
pub struct FaustValidator {
    config: ValidatorConfig,
}

impl Validate for FaustValidator {
    fn is_valid(&self, flag: &str, reference: DateTime<Utc>) -> bool {
        const DATA_LEN: usize = 8 + 4 + 2;

        let Some(tail) = flag.len().checked_sub(32).and_then(|at| flag.get(at..)) else {
            return false;
        };
        let Ok(mut data) = BASE64.decode(tail) else {
            return false;
        };
        if data.len() < DATA_LEN {
            return false;
        }

        let key = self.config.xor_key.as_bytes();
        for (byte, key_byte) in data.iter_mut().zip(key.iter().cycle()).take(DATA_LEN) {
            *byte ^= key_byte;
        }

        let millis = u64::from_be_bytes(data[0..8].try_into().unwrap());
        let team = u16::from_be_bytes(data[12..14].try_into().unwrap());

        if self.config.team >= 0 && i64::from(team) != self.config.team {
            return false;
        }
        match Utc.timestamp_millis_opt(millis as i64).single() {
            Some(flag_time) => time_ok(&self.config, flag_time, reference),
            None => false,
        }
    }
}

/// Enowars format: the last 48 base64 characters decode to four little-endian
/// u32 values `(service_id, round_offset, owner_team_id, round_id)`.
pub struct EnowarsValidator {
    config: ValidatorConfig,
}

const ENOWARS_MAX_SERVICES: u32 = 64;
const ENOWARS_MAX_FLAG_STORES: u32 = 16;

impl Validate for EnowarsValidator {
    fn is_valid(&self, flag: &str, reference: DateTime<Utc>) -> bool {
        const DATA_LEN: usize = 4 * 4;

        let Some(tail) = flag.len().checked_sub(48).and_then(|at| flag.get(at..)) else {
            return false;
        };
        let Ok(data) = BASE64.decode(tail) else {
            return false;
        };
        if data.len() < DATA_LEN {
            return false;
        }

        let service_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let round_offset = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let owner = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let round = u32::from_le_bytes(data[12..16].try_into().unwrap());

        if service_id > ENOWARS_MAX_SERVICES || round_offset > ENOWARS_MAX_FLAG_STORES {
            return false;
        }
        if self.config.team >= 0 && i64::from(owner) != self.config.team {
            return false;
        }
        match tick_time(&self.config, i64::from(round)) {
            Some(flag_time) => time_ok(&self.config, flag_time, reference),
            None => true,
        }
    }
}

/// Italian attack/defense format: flag characters 0-1, 3 and 5 are base-36
/// digits encoding `(round, team, service)`.
pub struct ItalyAdValidator {
    config: ValidatorConfig,
}

impl Validate for ItalyAdValidator {
    fn is_valid(&self, flag: &str, reference: DateTime<Utc>) -> bool {
        let chars: Vec<char> = flag.chars().take(6).collect();
        if chars.len() < 6 {
            return false;
        }

        let digit = |c: char| c.to_digit(36);
        let (round, team) = match (digit(chars[0]), digit(chars[1]), digit(chars[3]), digit(chars[5])) {
            (Some(hi), Some(lo), Some(team), Some(_service)) => (hi * 36 + lo, team),
            _ => return false,
        };

        if self.config.team >= 0 && i64::from(team) != self.config.team {
            return false;
        }
        match tick_time(&self.config, i64::from(round)) {
            Some(flag_time) => time_ok(&self.config, flag_time, reference),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(team: i64, tick_start: Option<DateTime<Utc>>) -> ValidatorConfig {
        ValidatorConfig {
            team,
            tick_start,
            tick_length: Duration::seconds(120),
            tolerance: Duration::hours(1),
            xor_key: "CTF-GAMESERVER".into(),
        }
    }

    #[test]
    fn dummy_accepts_anything() {
        let validator = FlagValidator::from_type("", config(-1, None)).unwrap();
        assert!(validator.is_valid("FLAG{whatever}", Utc::now()));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(FlagValidator::from_type("NOPE", config(-1, None)).is_err());
    }

    fn faust_flag(millis: u64, team: u16, key: &str) -> String {
        let mut data = [0u8; 24];
        data[0..8].copy_from_slice(&millis.to_be_bytes());
        data[8..12].copy_from_slice(&7u32.to_be_bytes());
        data[12..14].copy_from_slice(&team.to_be_bytes());
        for (byte, key_byte) in data.iter_mut().zip(key.as_bytes().iter().cycle()).take(14) {
            *byte ^= key_byte;
        }
        format!("FAUST_{}", BASE64.encode(data))
    }

    #[test]
    fn faust_checks_team_and_time() {
        let reference = Utc.with_ymd_and_hms(2026, 7, 12, 12, 0, 0).unwrap();
        let validator = FlagValidator::from_type("FAUST", config(42, None)).unwrap();

        let fresh = faust_flag(reference.timestamp_millis() as u64, 42, "CTF-GAMESERVER");
        assert!(validator.is_valid(&fresh, reference));

        let wrong_team = faust_flag(reference.timestamp_millis() as u64, 41, "CTF-GAMESERVER");
        assert!(!validator.is_valid(&wrong_team, reference));

        let stale_ref = reference + Duration::hours(3);
        assert!(!validator.is_valid(&fresh, stale_ref));

        assert!(!validator.is_valid("FAUST_not-base64!!", reference));
    }

    #[test]
    fn faust_team_check_disabled_by_sentinel() {
        let reference = Utc.with_ymd_and_hms(2026, 7, 12, 12, 0, 0).unwrap();
        let validator = FlagValidator::from_type("FAUST", config(-1, None)).unwrap();
        let flag = faust_flag(reference.timestamp_millis() as u64, 999, "CTF-GAMESERVER");
        assert!(validator.is_valid(&flag, reference));
    }

    fn enowars_flag(service: u32, store: u32, owner: u32, round: u32) -> String {
        let mut data = [0u8; 36];
        data[0..4].copy_from_slice(&service.to_le_bytes());
        data[4..8].copy_from_slice(&store.to_le_bytes());
        data[8..12].copy_from_slice(&owner.to_le_bytes());
        data[12..16].copy_from_slice(&round.to_le_bytes());
        format!("ENO{}", BASE64.encode(data))
    }

    #[test]
    fn enowars_reconstructs_time_from_round() {
        let start = Utc.with_ymd_and_hms(2026, 7, 12, 9, 0, 0).unwrap();
        let validator = FlagValidator::from_type("ENO", config(3, Some(start))).unwrap();

        // Round 10 → 9:20, within an hour of the reference
        let flag = enowars_flag(1, 0, 3, 10);
        let reference = start + Duration::minutes(30);
        assert!(validator.is_valid(&flag, reference));

        // Round 1000 → ~33 hours in, far outside the window
        let late = enowars_flag(1, 0, 3, 1000);
        assert!(!validator.is_valid(&late, reference));

        let wrong_owner = enowars_flag(1, 0, 4, 10);
        assert!(!validator.is_valid(&wrong_owner, reference));

        let wild_service = enowars_flag(5000, 0, 3, 10);
        assert!(!validator.is_valid(&wild_service, reference));
    }

    #[test]
    fn italy_ad_parses_base36_positions() {
        let start = Utc.with_ymd_and_hms(2026, 7, 12, 9, 0, 0).unwrap();
        let validator = FlagValidator::from_type("ITAD", config(10, Some(start))).unwrap();

        // round = "05" = 5, team = 'a' = 10, service = 'b'
        let reference = start + Duration::seconds(5 * 120);
        assert!(validator.is_valid("05xaxb-rest-of-flag", reference));

        // team 'b' = 11, mismatch
        assert!(!validator.is_valid("05xbxb-rest-of-flag", reference));

        assert!(!validator.is_valid("05!", reference));
    }
}
