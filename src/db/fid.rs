use chrono::{DateTime, Utc};
use rand::RngCore;
use uuid::Uuid;

// Ids are 32 hex nibbles: the first 16 carry the microsecond timestamp with
// two fixed `8` nibbles spliced in at the uuid version/variant positions, the
// remaining 14 are entropy. All ids for the same instant therefore sort
// between `fid_pack_low` and `fid_pack_high`, which lets time-range queries
// run on the primary key.
fn fid_pack(time: DateTime<Utc>, entropy: &[u8; 7]) -> Uuid {
    let mut hex_time = [0u8; 16];
    let micros = time.timestamp_micros() as u64;
    for (i, nibble) in hex_time.iter_mut().enumerate() {
        let shift = 60 - 4 * i;
        *nibble = char::from_digit(((micros >> shift) & 0xf) as u32, 16).unwrap() as u8;
    }

    let mut hex = String::with_capacity(32);
    hex.push_str(str::from_utf8(&hex_time[0..12]).unwrap());
    hex.push('8');
    hex.push_str(str::from_utf8(&hex_time[12..15]).unwrap());
    hex.push('8');
    hex.push_str(str::from_utf8(&hex_time[15..16]).unwrap());
    for byte in entropy {
        hex.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
        hex.push(char::from_digit((byte & 0xf) as u32, 16).unwrap());
    }

    Uuid::parse_str(&hex).expect("fid hex is always a valid uuid")
}

pub fn fid_create(time: DateTime<Utc>) -> Uuid {
    let mut entropy = [0u8; 7];
    rand::rng().fill_bytes(&mut entropy);
    fid_pack(time, &entropy)
}

pub fn fid_pack_low(time: DateTime<Utc>) -> Uuid {
    fid_pack(time, &[0u8; 7])
}

pub fn fid_pack_high(time: DateTime<Utc>) -> Uuid {
    fid_pack(time, &[0xffu8; 7])
}
