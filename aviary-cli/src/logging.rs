//! Cage log files: one line per record, daily rotation, flush-on-error.
//!
//! Records carry the full seven-step severity scale `ERR MSG WRN LOG INF
//! DBG NSE` (1..7), rendered as `HH:MM:SS.cc LVL [thread] message`. The
//! five tracing levels map onto the scale (`error!` -> `ERR`, `warn!` ->
//! `WRN`, `info!` -> `MSG`, `debug!` -> `DBG`, `trace!` -> `NSE`); an
//! event may pick any severity explicitly with a `severity` field, e.g.
//! `tracing::info!(severity = 5, "...")` for an `INF` record (`LOG` and
//! `INF` events are emitted at the `info!` level so the coarse tracing
//! filter lets them through). Records above the configured threshold
//! (default `LOG`) are dropped.
//!
//! Lines are transcoded into a configured 8-bit encoding (default
//! `windows-1251`) before the byte write, with unencodable characters
//! replaced; control bytes are replaced by spaces so a record is always
//! exactly one line. `ERR` records are fsync'ed so the tail of the log
//! survives a crash.

use std::{
    fmt::Write as _,
    fs::{File, OpenOptions},
    io,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Result};
use encoding_rs::{EncoderResult, Encoding, WINDOWS_1251};
use parking_lot::Mutex;
use tracing::{
    field::{Field, Visit},
    level_filters::LevelFilter,
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    fmt::{format::Writer, writer::MakeWriter, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
};

/// The seven-step severity scale of a log record; smaller is more
/// severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Err = 1,
    Msg = 2,
    Wrn = 3,
    Log = 4,
    Inf = 5,
    Dbg = 6,
    Nse = 7,
}

impl Severity {
    pub fn abbrev(self) -> &'static str {
        match self {
            Severity::Err => "ERR",
            Severity::Msg => "MSG",
            Severity::Wrn => "WRN",
            Severity::Log => "LOG",
            Severity::Inf => "INF",
            Severity::Dbg => "DBG",
            Severity::Nse => "NSE",
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u64) -> Option<Severity> {
        Some(match n {
            1 => Severity::Err,
            2 => Severity::Msg,
            3 => Severity::Wrn,
            4 => Severity::Log,
            5 => Severity::Inf,
            6 => Severity::Dbg,
            7 => Severity::Nse,
            _ => return None,
        })
    }

    fn from_tracing(level: Level) -> Severity {
        match level {
            Level::ERROR => Severity::Err,
            Level::WARN => Severity::Wrn,
            Level::INFO => Severity::Msg,
            Level::DEBUG => Severity::Dbg,
            Level::TRACE => Severity::Nse,
        }
    }

    /// The loosest tracing level that can still carry this severity;
    /// exact filtering happens against the severity itself.
    fn pre_filter(self) -> LevelFilter {
        match self {
            Severity::Err => LevelFilter::ERROR,
            Severity::Msg | Severity::Wrn | Severity::Log | Severity::Inf => LevelFilter::INFO,
            Severity::Dbg => LevelFilter::DEBUG,
            Severity::Nse => LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.abbrev())
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "ERR" => Severity::Err,
            "MSG" => Severity::Msg,
            "WRN" => Severity::Wrn,
            "LOG" => Severity::Log,
            "INF" => Severity::Inf,
            "DBG" => Severity::Dbg,
            "NSE" => Severity::Nse,
            other => bail!("unknown log severity '{other}'"),
        })
    }
}

#[derive(Clone, Copy)]
pub struct LogConfig {
    /// Records above this severity are dropped.
    pub threshold: Severity,
    /// The 8-bit encoding log lines are written in.
    pub encoding: &'static Encoding,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            threshold: Severity::Log,
            encoding: WINDOWS_1251,
        }
    }
}

impl LogConfig {
    /// The defaults, overridden by the `AVIARY_LOG` (severity threshold)
    /// and `AVIARY_LOG_ENCODING` (WHATWG encoding label) environment
    /// variables where present and valid.
    pub fn from_env() -> Self {
        let mut config = LogConfig::default();
        if let Ok(level) = std::env::var("AVIARY_LOG") {
            if let Ok(threshold) = level.parse() {
                config.threshold = threshold;
            }
        }
        if let Ok(label) = std::env::var("AVIARY_LOG_ENCODING") {
            if let Some(encoding) = Encoding::for_label(label.as_bytes()) {
                config.encoding = encoding;
            }
        }
        config
    }

    /// Picks the line encoding by its WHATWG label, e.g. `"windows-1251"`
    /// or `"koi8-r"`.
    pub fn with_encoding_label(mut self, label: &str) -> Result<Self> {
        self.encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| anyhow!("unknown encoding label '{label}'"))?;
        Ok(self)
    }
}

/// Installs the global subscriber writing to the cage's daily log files.
pub fn init(logs_dir: &Path, cage: &str, config: LogConfig) -> Result<()> {
    std::fs::create_dir_all(logs_dir)?;
    let writer = DailyLog::new(logs_dir.to_path_buf(), cage.to_string(), config.encoding);
    tracing_subscriber::fmt()
        .with_max_level(config.threshold.pre_filter())
        .event_format(CageFormat::new(config.threshold))
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow!("cannot install the log subscriber: {e}"))?;
    Ok(())
}

pub struct CageFormat {
    threshold: Severity,
}

impl CageFormat {
    pub fn new(threshold: Severity) -> Self {
        CageFormat { threshold }
    }
}

/// Picks up an explicit `severity` field from the event, if any.
struct SeverityVisitor {
    severity: Option<Severity>,
}

impl Visit for SeverityVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "severity" {
            self.severity = Severity::from_number(value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if value >= 0 {
            self.record_u64(field, value as u64);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

/// Renders the message and any remaining fields, hiding the `severity`
/// marker that is already part of the prefix.
struct LineVisitor<'a, 'b> {
    writer: &'a mut Writer<'b>,
    result: std::fmt::Result,
}

impl Visit for LineVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if self.result.is_err() {
            return;
        }
        self.result = match field.name() {
            "severity" => Ok(()),
            "message" => write!(self.writer, "{value:?}"),
            name => write!(self.writer, " {name}={value:?}"),
        };
    }
}

impl<S, N> FormatEvent<S, N> for CageFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut picked = SeverityVisitor { severity: None };
        event.record(&mut picked);
        let severity = picked
            .severity
            .unwrap_or_else(|| Severity::from_tracing(*event.metadata().level()));
        if severity > self.threshold {
            return Ok(());
        }

        let now = chrono::Local::now();
        let thread = std::thread::current();
        write!(
            writer,
            "{}.{:02} {severity} [{}] ",
            now.format("%H:%M:%S"),
            now.timestamp_subsec_millis() / 10,
            thread.name().unwrap_or("worker"),
        )?;
        let mut line = LineVisitor {
            writer: &mut writer,
            result: Ok(()),
        };
        event.record(&mut line);
        line.result?;
        writeln!(writer)
    }
}

/// A `MakeWriter` appending to `<cage>-YYYYMMDD.log`, switching files
/// when the local date changes. If rotation fails the previous file
/// keeps receiving records.
#[derive(Clone)]
pub struct DailyLog {
    shared: Arc<LogShared>,
}

struct LogShared {
    dir: PathBuf,
    cage: String,
    encoding: &'static Encoding,
    state: Mutex<LogState>,
}

struct LogState {
    date: String,
    file: Option<File>,
}

impl DailyLog {
    pub fn new(dir: PathBuf, cage: String, encoding: &'static Encoding) -> Self {
        DailyLog {
            shared: Arc::new(LogShared {
                dir,
                cage,
                encoding,
                state: Mutex::new(LogState {
                    date: String::new(),
                    file: None,
                }),
            }),
        }
    }

    pub fn current_file_name(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y%m%d").to_string();
        self.shared
            .dir
            .join(format!("{}-{}.log", self.shared.cage, today))
    }

    fn write_record(&self, buf: &[u8], fsync: bool) -> io::Result<usize> {
        let decoded = String::from_utf8_lossy(buf);
        let line = decoded.strip_suffix('\n').unwrap_or(&decoded);
        let mut encoded = Vec::with_capacity(line.len() + 1);
        encode_line(self.shared.encoding, line, &mut encoded);
        for byte in encoded.iter_mut() {
            if *byte < 0x20 {
                *byte = b' ';
            }
        }

        let today = chrono::Local::now().format("%Y%m%d").to_string();
        let mut state = self.shared.state.lock();
        if state.date != today {
            let path = self
                .shared
                .dir
                .join(format!("{}-{}.log", self.shared.cage, today));
            if let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) {
                state.file = Some(file);
                state.date = today;
            }
        }
        if let Some(file) = state.file.as_mut() {
            if !encoded.is_empty() {
                encoded.push(b'\n');
                file.write_all(&encoded)?;
            }
            if fsync {
                let _ = file.sync_data();
            }
        }
        Ok(buf.len())
    }
}

/// Transcodes one line into the target encoding, substituting `?` for
/// characters the encoding cannot express.
fn encode_line(encoding: &'static Encoding, line: &str, out: &mut Vec<u8>) {
    let mut encoder = encoding.new_encoder();
    let mut buf = [0u8; 256];
    let mut rest = line;
    loop {
        let (result, read, written) =
            encoder.encode_from_utf8_without_replacement(rest, &mut buf, true);
        out.extend_from_slice(&buf[..written]);
        rest = &rest[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::OutputFull => {}
            EncoderResult::Unmappable(_) => out.push(b'?'),
        }
    }
}

pub struct LogWriter {
    log: DailyLog,
    fsync: bool,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.write_record(buf, self.fsync)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DailyLog {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            log: self.clone(),
            fsync: false,
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        LogWriter {
            log: self.clone(),
            fsync: *meta.level() == Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn log(dir: &Path, encoding: &'static Encoding) -> DailyLog {
        DailyLog::new(dir.to_path_buf(), "test".to_string(), encoding)
    }

    #[test]
    fn severity_scale() {
        assert_eq!(Severity::Err.abbrev(), "ERR");
        assert_eq!(Severity::Log.abbrev(), "LOG");
        assert_eq!(Severity::Inf.abbrev(), "INF");
        assert_eq!(Severity::Nse.abbrev(), "NSE");
        assert_eq!(Severity::Log.number(), 4);

        // smaller is more severe; the default threshold admits ERR..LOG
        assert!(Severity::Err < Severity::Log);
        assert!(Severity::Inf > Severity::Log);

        assert_eq!(Severity::from_number(5), Some(Severity::Inf));
        assert_eq!(Severity::from_number(0), None);
        assert_eq!(Severity::from_number(8), None);
    }

    #[test]
    fn severity_parsing() {
        assert_eq!("LOG".parse::<Severity>().unwrap(), Severity::Log);
        assert_eq!("inf".parse::<Severity>().unwrap(), Severity::Inf);
        assert!("LOUD".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_pre_filter_covers_the_explicit_levels() {
        // LOG and INF records ride on info! events
        assert_eq!(Severity::Log.pre_filter(), LevelFilter::INFO);
        assert_eq!(Severity::Inf.pre_filter(), LevelFilter::INFO);
        assert_eq!(Severity::Nse.pre_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn records_are_transcoded_to_the_configured_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path(), WINDOWS_1251);

        let mut writer = log.make_writer();
        writer
            .write_all("Привет\tмир\n".as_bytes())
            .unwrap();

        let content = std::fs::read(log.current_file_name()).unwrap();
        assert_eq!(content, b"\xcf\xf0\xe8\xe2\xe5\xf2 \xec\xe8\xf0\n");
    }

    #[test]
    fn unencodable_characters_are_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path(), WINDOWS_1251);
        log.make_writer().write_all("a\u{2192}b\n".as_bytes()).unwrap();
        let content = std::fs::read(log.current_file_name()).unwrap();
        assert_eq!(content, b"a?b\n");
    }

    #[test]
    fn controls_and_interior_newlines_become_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path(), WINDOWS_1251);
        log.make_writer()
            .write_all(b"hello\tthere\x01!\nsecond\n")
            .unwrap();
        let content = std::fs::read_to_string(log.current_file_name()).unwrap();
        assert_eq!(content, "hello there ! second\n");
    }

    #[test]
    fn appends_across_writers() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path(), WINDOWS_1251);
        log.make_writer().write_all(b"one\n").unwrap();
        log.make_writer().write_all(b"two\n").unwrap();
        let content = std::fs::read_to_string(log.current_file_name()).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn encoding_is_configurable_by_label() {
        let config = LogConfig::default().with_encoding_label("koi8-r").unwrap();
        assert_eq!(config.encoding.name(), "KOI8-R");
        assert!(LogConfig::default().with_encoding_label("ebcdic-37").is_err());
    }
}
