use anyhow::Context;
use byte_unit::{Byte, Unit};
use chrono::{DateTime, Utc};
use clap::Parser;
use regex::bytes::Regex;
use std::path::PathBuf;
use std::time::Duration;

use crate::convert::ConverterConfig;
use crate::filter::PacketFilter;
use crate::http::HttpConfig;
use crate::tcp::TcpConfig;
use crate::validator::{FlagValidator, ValidatorConfig};

pub const DEFAULT_FLAG_TOLERANCE_SECS: i64 = 3600;

#[derive(Debug, Clone, Parser)]
#[command(version)]
#[command(about = "Capture ingestion and flow enrichment", long_about = None)]
pub struct AssemblerArgs {
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory to watch for new pcaps
    #[arg(long = "dir")]
    pub watch_dir: Option<PathBuf>,

    /// host:port[,host:port...] live pcap stream endpoints
    #[arg(long = "pcap-over-ip", env = "PCAP_OVER_IP")]
    pub pcap_over_ip: Option<String>,

    /// Persistence connection string
    #[arg(long = "timescale", env = "TIMESCALE", required = true)]
    pub timescale: String,

    /// Flag regex, used for flag-in / flag-out tagging
    #[arg(long = "flag", env = "FLAG_REGEX")]
    pub flag_regex: Option<String>,

    /// Enable flag-id scanning
    #[arg(long = "flagid")]
    pub flagid: bool,

    /// FAUST, ENO, ITAD or empty for no validation
    #[arg(long = "flag-validator-type", env = "FLAG_VALIDATOR_TYPE", default_value = "")]
    pub flag_validator_type: String,

    /// Team id the flags should belong to; -1 disables the check
    #[arg(long = "flag-validator-team", default_value_t = -1)]
    pub flag_validator_team: i64,

    /// XOR key for the FAUST flag format
    #[arg(long = "flag-validator-key", default_value = "CTF-GAMESERVER")]
    pub flag_validator_key: String,

    /// Tick origin used to reconstruct flag times (RFC 3339)
    #[arg(long = "flag-tick-start", env = "FLAG_TICK_START")]
    pub flag_tick_start: Option<String>,

    /// Tick duration in seconds
    #[arg(long = "tick-length", default_value_t = 120)]
    pub tick_length: u64,

    /// Flag-id cache lifetime in ticks; -1 keeps everything
    #[arg(long = "flag-lifetime", default_value_t = -1)]
    pub flag_lifetime: i64,

    /// BPF filter applied to every capture source
    #[arg(long = "bpf", env = "BPF")]
    pub bpf: Option<String>,

    /// Do not enforce strict TCP handshakes
    #[arg(long)]
    pub nonstrict: bool,

    /// Skip TCP checksum verification
    #[arg(long)]
    pub skipchecksum: bool,

    /// Flush TCP connections whose oldest gap is older than this
    #[arg(long = "flush-after", default_value = "30s", value_parser = humantime::parse_duration)]
    pub flush_after: Duration,

    /// Complete UDP pseudo-flows idle for longer than this
    #[arg(long = "flush-after-udp", default_value = "30s", value_parser = humantime::parse_duration)]
    pub flush_after_udp: Duration,

    /// Period of flushing while processing one pcap
    #[arg(long = "flush-interval", default_value = "15s", value_parser = humantime::parse_duration)]
    pub flush_interval: Duration,

    /// Record passing traffic into rotating pcaps in this directory
    #[arg(long = "dump-pcaps", env = "DUMP_PCAPS")]
    pub dump_pcaps: Option<PathBuf>,

    #[arg(long = "dump-pcaps-interval", env = "DUMP_PCAPS_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    pub dump_pcaps_interval: Duration,

    /// chrono time format for dumped pcap filenames
    #[arg(long = "dump-pcaps-filename", env = "DUMP_PCAPS_FILENAME", default_value = "%Y-%m-%d_%H-%M-%S.pcap")]
    pub dump_pcaps_filename: String,

    /// Per-flow payload cap in MiB
    #[arg(long = "max-flow-item-size", default_value_t = 16)]
    pub max_flow_item_size: u64,

    /// Fingerprint HTTP session cookies for cross-flow linking
    #[arg(long = "http-session-tracking")]
    pub http_session_tracking: bool,

    /// Skip the converter pipeline entirely
    #[arg(long = "disable-converters")]
    pub disable_converters: bool,

    /// YAML file mapping destination ports to converter stages
    #[arg(long = "converters", env = "CONVERTERS")]
    pub converters: Option<PathBuf>,

    /// Directory holding the converter helper scripts
    #[arg(long = "converters-dir", default_value = "converters")]
    pub converters_dir: PathBuf,

    /// Helper processes per converter name
    #[arg(long = "concurrent-converters", default_value_t = 2)]
    pub concurrent_converters: usize,

    /// Flow post-processing workers; defaults to max(NumCPU/2, 4)
    #[arg(long = "concurrent-flows")]
    pub concurrent_flows: Option<usize>,

    /// Pcap files to process before watching
    pub pcaps: Vec<PathBuf>,
}

#[derive(Debug, Clone, Parser)]
#[command(version)]
#[command(about = "Eve log signature correlator", long_about = None)]
pub struct EnricherArgs {
    #[arg(short, long)]
    pub verbose: bool,

    /// Eve file to watch for intrusion detector events
    #[arg(long = "eve", env = "EVE", required = true)]
    pub eve: PathBuf,

    /// Persistence connection string
    #[arg(long = "timescale", env = "TIMESCALE", required = true)]
    pub timescale: String,

    /// Attach flowbits as flow tags
    #[arg(long = "flowbits")]
    pub flowbits: bool,

    /// Rescan period in seconds
    #[arg(short = 't', default_value_t = 30)]
    pub rescan_period: u64,
}

#[derive(Debug, Clone)]
pub struct DumpSettings {
    pub dir: PathBuf,
    pub interval: Duration,
    pub filename_format: String,
}

/// Everything the assembler needs, resolved and validated. Any failure here
/// is fatal misconfiguration.
pub struct Settings {
    pub db_url: String,
    pub watch_dir: Option<PathBuf>,
    pub pcap_over_ip: Vec<String>,
    pub pcap_files: Vec<PathBuf>,
    pub bpf: Option<PacketFilter>,
    pub tcp: TcpConfig,
    pub http: HttpConfig,
    pub max_item_size: usize,
    pub flush_after: Duration,
    pub flush_after_udp: Duration,
    pub flush_interval: Duration,
    pub dump: Option<DumpSettings>,
    pub flag_regex: Option<String>,
    pub flagid: bool,
    pub flag_lifetime: chrono::Duration,
    pub tick_length: chrono::Duration,
    pub validator: FlagValidator,
    pub converters: Option<(ConverterConfig, PathBuf, usize)>,
    pub concurrent_flows: usize,
}

impl Settings {
    pub fn resolve(args: AssemblerArgs) -> anyhow::Result<Settings> {
        let max_item_size = Byte::from_u64_with_unit(args.max_flow_item_size, Unit::MiB)
            .context("bad max-flow-item-size")?
            .as_u64() as usize;

        if let Some(pattern) = &args.flag_regex {
            Regex::new(pattern).context("bad flag regex")?;
        }

        let bpf = args
            .bpf
            .as_deref()
            .filter(|expr| !expr.is_empty())
            .map(PacketFilter::parse)
            .transpose()
            .context("bad bpf filter")?;

        let tick_length = chrono::Duration::seconds(args.tick_length.max(1) as i64);
        let tick_start = args
            .flag_tick_start
            .as_deref()
            .map(parse_tick_start)
            .transpose()
            .context("bad flag-tick-start")?;

        let validator = FlagValidator::from_type(
            &args.flag_validator_type,
            ValidatorConfig {
                team: args.flag_validator_team,
                tick_start,
                tick_length,
                tolerance: chrono::Duration::seconds(DEFAULT_FLAG_TOLERANCE_SECS),
                xor_key: args.flag_validator_key.clone(),
            },
        )?;

        let converters = if args.disable_converters {
            None
        } else {
            args.converters
                .as_deref()
                .map(ConverterConfig::load_from_file)
                .transpose()?
                .map(|config| {
                    (
                        config,
                        args.converters_dir.clone(),
                        args.concurrent_converters,
                    )
                })
        };

        let flag_lifetime = if args.flag_lifetime < 0 {
            chrono::Duration::days(3650)
        } else {
            tick_length * args.flag_lifetime as i32
        };

        let concurrent_flows = args.concurrent_flows.unwrap_or_else(default_flow_workers);

        let pcap_over_ip = args
            .pcap_over_ip
            .as_deref()
            .map(|endpoints| {
                endpoints
                    .split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let dump = args.dump_pcaps.map(|dir| DumpSettings {
            dir,
            interval: args.dump_pcaps_interval,
            filename_format: args.dump_pcaps_filename.clone(),
        });

        Ok(Settings {
            db_url: args.timescale,
            watch_dir: args.watch_dir,
            pcap_over_ip,
            pcap_files: args.pcaps,
            bpf,
            tcp: TcpConfig {
                max_item_size,
                strict: !args.nonstrict,
                verify_checksum: !args.skipchecksum,
            },
            http: HttpConfig {
                max_item_size,
                session_tracking: args.http_session_tracking,
            },
            max_item_size,
            flush_after: args.flush_after,
            flush_after_udp: args.flush_after_udp,
            flush_interval: args.flush_interval,
            dump,
            flag_regex: args.flag_regex,
            flagid: args.flagid,
            flag_lifetime,
            tick_length,
            validator,
            converters,
            concurrent_flows,
        })
    }
}

pub fn default_flow_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus / 2).max(4)
}

fn parse_tick_start(text: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Ok(time.with_timezone(&Utc));
    }
    // Also take the space-separated shape game admins tend to paste
    let naive = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("unparseable tick start {text:?}"))?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["assembler", "--timescale", "postgres://localhost/petal"]
    }

    #[test]
    fn defaults_resolve() {
        let args = AssemblerArgs::parse_from(base_args());
        let settings = Settings::resolve(args).unwrap();
        assert_eq!(settings.max_item_size, 16 << 20);
        assert_eq!(settings.flush_after, Duration::from_secs(30));
        assert_eq!(settings.flush_interval, Duration::from_secs(15));
        assert!(settings.tcp.strict);
        assert!(settings.tcp.verify_checksum);
        assert!(settings.concurrent_flows >= 4);
    }

    #[test]
    fn bad_flag_regex_is_fatal() {
        let mut argv = base_args();
        argv.extend(["--flag", "FLAG{["]);
        let args = AssemblerArgs::parse_from(argv);
        assert!(Settings::resolve(args).is_err());
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let mut argv = base_args();
        argv.extend(["--flush-after", "soon"]);
        assert!(AssemblerArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn unknown_validator_type_is_fatal() {
        let mut argv = base_args();
        argv.extend(["--flag-validator-type", "MYSTERY"]);
        let args = AssemblerArgs::parse_from(argv);
        assert!(Settings::resolve(args).is_err());
    }

    #[test]
    fn pcap_over_ip_splits_endpoints() {
        let mut argv = base_args();
        argv.extend(["--pcap-over-ip", "a:1337, b:1337"]);
        let args = AssemblerArgs::parse_from(argv);
        let settings = Settings::resolve(args).unwrap();
        assert_eq!(settings.pcap_over_ip, vec!["a:1337", "b:1337"]);
    }

    #[test]
    fn tick_start_accepts_rfc3339() {
        assert!(parse_tick_start("2026-07-12T09:00:00Z").is_ok());
        assert!(parse_tick_start("2026-07-12 09:00:00").is_ok());
        assert!(parse_tick_start("noon").is_err());
    }
}
