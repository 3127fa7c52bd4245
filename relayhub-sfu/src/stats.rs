//! Per-stream reception statistics and the per-session statistics record
//!
//! Every inbound stream gets a [`StreamMonitor`] fed by its relay loop. When a
//! statistics directory is configured, a reporter task samples the monitors of
//! one session on a fixed period and appends [`StatsRecord`]s to a CSV file:
//!
//! ```text
//! timestamp,kind,packetsReceived,packetsLost,lossRatio,jitter,currentBitrateKbps,targetBitrateKbps
//! ```
//!
//! Packet counts are deltas since the previous record; jitter (seconds) and
//! bitrates are current values.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use crate::estimator::{BitrateEstimator, TransitClock};
use crate::types::{StreamKey, TrackKind};

pub const CSV_HEADER: &str =
    "timestamp,kind,packetsReceived,packetsLost,lossRatio,jitter,currentBitrateKbps,targetBitrateKbps";

/// Sequence-number and jitter bookkeeping (RFC 3550 appendix A.1/A.8)
#[derive(Debug, Default)]
struct Reception {
    base_seq: Option<u16>,
    max_seq: u16,
    cycles: u32,
    received: u64,
    /// Interarrival jitter in seconds
    jitter: f64,
    last_transit: Option<f64>,
}

impl Reception {
    fn update(&mut self, seq: u16, transit: f64) {
        match self.base_seq {
            None => {
                self.base_seq = Some(seq);
                self.max_seq = seq;
            }
            Some(_) => {
                let step = seq.wrapping_sub(self.max_seq);
                if step != 0 && step < 0x8000 {
                    if seq < self.max_seq {
                        self.cycles += 1;
                    }
                    self.max_seq = seq;
                }
            }
        }
        self.received += 1;

        if let Some(last) = self.last_transit {
            let d = (transit - last).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    fn expected(&self) -> u64 {
        self.base_seq.map_or(0, |base| {
            let extended_max = (u64::from(self.cycles) << 16) | u64::from(self.max_seq);
            extended_max + 1 - u64::from(base)
        })
    }

    fn lost(&self) -> u64 {
        self.expected().saturating_sub(self.received)
    }
}

/// Cumulative reception counters of one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceptionSnapshot {
    pub packets_received: u64,
    pub packets_lost: u64,
    /// Seconds
    pub jitter: f64,
    /// Bits per second over the last estimation window
    pub bitrate: f64,
    pub delay: Duration,
}

struct MonitorState {
    clock: TransitClock,
    reception: Reception,
}

/// Statistics of one inbound stream. Written only by its relay loop, read by
/// the reporter; never touches the hub lock.
pub struct StreamMonitor {
    key: StreamKey,
    kind: TrackKind,
    estimator: BitrateEstimator,
    state: Mutex<MonitorState>,
}

impl StreamMonitor {
    #[must_use]
    pub fn new(key: StreamKey, kind: TrackKind, clock_rate: u32, window: Duration) -> Self {
        Self {
            key,
            kind,
            estimator: BitrateEstimator::new(window),
            state: Mutex::new(MonitorState {
                clock: TransitClock::new(clock_rate),
                reception: Reception::default(),
            }),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub const fn estimator(&self) -> &BitrateEstimator {
        &self.estimator
    }

    /// Account one packet of `size` bytes
    pub fn observe(&self, sequence_number: u16, timestamp: u32, size: usize, arrival: Instant) {
        let delay = {
            let mut state = self.state.lock();
            let transit = state.clock.observe(timestamp, arrival);
            state.reception.update(sequence_number, transit.seconds);
            transit.delay
        };
        self.estimator.record_at(arrival, size, delay);
    }

    #[must_use]
    pub fn snapshot(&self) -> ReceptionSnapshot {
        let state = self.state.lock();
        ReceptionSnapshot {
            packets_received: state.reception.received,
            packets_lost: state.reception.lost(),
            jitter: state.reception.jitter,
            bitrate: self.estimator.bitrate(),
            delay: self.estimator.delay(),
        }
    }
}

/// One line of the statistics file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: TrackKind,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub loss_ratio: f64,
    pub jitter: f64,
    pub current_bitrate_kbps: u64,
    pub target_bitrate_kbps: u64,
}

impl StatsRecord {
    #[must_use]
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{:.2},{:.4},{},{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.kind,
            self.packets_received,
            self.packets_lost,
            self.loss_ratio,
            self.jitter,
            self.current_bitrate_kbps,
            self.target_bitrate_kbps,
        )
    }
}

/// Turns cumulative snapshots into per-tick records
#[derive(Debug, Default)]
pub struct RecordBuilder {
    previous: Option<ReceptionSnapshot>,
}

impl RecordBuilder {
    pub fn next(
        &mut self,
        kind: TrackKind,
        snapshot: ReceptionSnapshot,
        target_bitrate: Option<u64>,
        timestamp: DateTime<Utc>,
    ) -> StatsRecord {
        let previous = self.previous.replace(snapshot).unwrap_or_default();
        let received = snapshot
            .packets_received
            .saturating_sub(previous.packets_received);
        let lost = snapshot.packets_lost.saturating_sub(previous.packets_lost);
        let loss_ratio = if received + lost == 0 {
            0.0
        } else {
            lost as f64 / (received + lost) as f64
        };

        StatsRecord {
            timestamp,
            kind,
            packets_received: received,
            packets_lost: lost,
            loss_ratio,
            jitter: snapshot.jitter,
            current_bitrate_kbps: (snapshot.bitrate / 1000.0) as u64,
            target_bitrate_kbps: target_bitrate.unwrap_or(0) / 1000,
        }
    }
}

/// Destination of statistics records
pub trait StatsSink: Send + Sync {
    fn write(&self, record: &StatsRecord) -> std::io::Result<()>;
}

/// Append-only CSV file, one per session
pub struct CsvStatsSink {
    writer: Mutex<BufWriter<File>>,
}

impl CsvStatsSink {
    /// Create (truncate) the file and write the header
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{CSV_HEADER}")?;
        writer.flush()?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

impl StatsSink for CsvStatsSink {
    fn write(&self, record: &StatsRecord) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", record.to_csv_line())?;
        writer.flush()
    }
}
