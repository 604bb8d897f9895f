//! Conntrack table sampler.
//!
//! The kernel exposes its connection-tracking table as text at
//! `<proc_root>/net/nf_conntrack`. [`ConntrackSource`] reads it every poll
//! interval and turns the difference between two samples into OPEN and CLOSE
//! transitions, keyed by the original-direction tuple.
//!
//! A TCP entry that reaches `TIME_WAIT` or `CLOSE` counts as closed even while
//! the kernel keeps it in the table.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use conntrail_common::config::SourceConfig;
use conntrail_common::constants::CONNTRACK_TABLE;
use conntrail_common::types::{ConnectionTuple, Phase, Protocol};

use crate::error::SourceError;

/// Longest uninterrupted sleep, so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// A raw lifecycle transition read from the conntrack table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawConnection {
    /// Connection identity in the original direction.
    pub tuple: ConnectionTuple,
    /// Observed transition.
    pub phase: Phase,
}

/// One parsed conntrack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackEntry {
    /// Connection identity in the original direction.
    pub tuple: ConnectionTuple,
    /// Whether the connection is still established.
    pub live: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Entry(ConntrackEntry),
    Untracked,
    Malformed,
}

/// TCP states in which a tracked connection is already over.
const CLOSED_TCP_STATES: [&str; 2] = ["TIME_WAIT", "CLOSE"];

fn parse_line(line: &str) -> LineOutcome {
    let mut tokens = line.split_whitespace();
    let (Some(_family), Some(_family_number), Some(_name), Some(number)) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return LineOutcome::Malformed;
    };
    let Ok(number) = number.parse::<u8>() else {
        return LineOutcome::Malformed;
    };
    let Some(protocol) = Protocol::from_number(number) else {
        return LineOutcome::Untracked;
    };

    let mut live = true;
    let mut src: Option<IpAddr> = None;
    let mut dst: Option<IpAddr> = None;
    let mut sport: Option<u16> = None;
    let mut dport: Option<u16> = None;

    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            if src.is_none() && CLOSED_TCP_STATES.contains(&token) {
                live = false;
            }
            continue;
        };
        // The first occurrence of each key belongs to the original direction.
        let parsed = match key {
            "src" if src.is_none() => value.parse().map(|v| src = Some(v)).is_ok(),
            "dst" if dst.is_none() => value.parse().map(|v| dst = Some(v)).is_ok(),
            "sport" if sport.is_none() => value.parse().map(|v| sport = Some(v)).is_ok(),
            "dport" if dport.is_none() => value.parse().map(|v| dport = Some(v)).is_ok(),
            _ => true,
        };
        if !parsed {
            return LineOutcome::Malformed;
        }
        if src.is_some() && dst.is_some() && sport.is_some() && dport.is_some() {
            break;
        }
    }

    match (src, dst, sport, dport) {
        (Some(source_address), Some(destination_address), Some(source_port), Some(destination_port)) => {
            LineOutcome::Entry(ConntrackEntry {
                tuple: ConnectionTuple {
                    protocol,
                    source_address,
                    source_port,
                    destination_address,
                    destination_port,
                },
                live,
            })
        }
        _ => LineOutcome::Malformed,
    }
}

/// Parses a whole conntrack table, returning the tracked entries in file
/// order and the number of malformed lines.
pub fn parse_table(text: &str) -> (Vec<ConntrackEntry>, u64) {
    let mut entries = Vec::new();
    let mut malformed = 0_u64;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match parse_line(line) {
            LineOutcome::Entry(entry) => entries.push(entry),
            LineOutcome::Untracked => {}
            LineOutcome::Malformed => malformed += 1,
        }
    }
    (entries, malformed)
}

/// Reads the current conntrack entries once.
///
/// # Errors
///
/// Returns [`SourceError::FacilityUnavailable`] if the table cannot be read.
pub fn snapshot(proc_root: &Path) -> Result<Vec<ConntrackEntry>, SourceError> {
    let path = proc_root.join(CONNTRACK_TABLE);
    let text = std::fs::read_to_string(&path)
        .map_err(|source| SourceError::FacilityUnavailable { path, source })?;
    Ok(parse_table(&text).0)
}

/// Lazy, pull-based stream of connection transitions.
///
/// The first sample is a baseline: connections already present are emitted as
/// OPEN so their later CLOSE can be paired. Within one sample every OPEN is
/// yielded before any CLOSE.
///
/// After a fatal error the iterator ends. It also ends as soon as the shared
/// shutdown flag is raised.
#[derive(Debug)]
pub struct ConntrackSource {
    path: PathBuf,
    config: SourceConfig,
    shutdown: Arc<AtomicBool>,
    previous: HashMap<ConnectionTuple, bool>,
    pending: VecDeque<RawConnection>,
    next_delay: Option<Duration>,
    consecutive_failures: u32,
    malformed_lines: u64,
    finished: bool,
}

impl ConntrackSource {
    /// Opens the conntrack table under the configured proc root.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::FacilityUnavailable`] if the table does not exist
    /// or cannot be read.
    pub fn open(config: SourceConfig, shutdown: Arc<AtomicBool>) -> Result<Self, SourceError> {
        let path = config.proc_root.join(CONNTRACK_TABLE);
        if let Err(source) = std::fs::File::open(&path) {
            return Err(SourceError::FacilityUnavailable { path, source });
        }
        tracing::info!(
            table = %path.display(),
            interval_ms = config.poll_interval_ms,
            "conntrack source opened"
        );
        Ok(Self {
            path,
            config,
            shutdown,
            previous: HashMap::new(),
            pending: VecDeque::new(),
            next_delay: None,
            consecutive_failures: 0,
            malformed_lines: 0,
            finished: false,
        })
    }

    /// Total malformed lines skipped so far.
    pub const fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // Returns false when interrupted by shutdown.
    fn sleep(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_shutting_down() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !self.is_shutting_down()
    }

    fn sample(&mut self) -> io::Result<()> {
        let text = std::fs::read_to_string(&self.path)?;
        let (entries, malformed) = parse_table(&text);
        if malformed > 0 {
            self.malformed_lines += malformed;
            tracing::debug!(malformed, total = self.malformed_lines, "skipped malformed conntrack lines");
        }

        let mut current: HashMap<ConnectionTuple, bool> = HashMap::with_capacity(entries.len());
        let mut closes = Vec::new();
        for entry in entries {
            if current.contains_key(&entry.tuple) {
                continue;
            }
            let _ = current.insert(entry.tuple, entry.live);
            match (self.previous.get(&entry.tuple).copied(), entry.live) {
                (None, live) => {
                    self.pending.push_back(RawConnection {
                        tuple: entry.tuple,
                        phase: Phase::Open,
                    });
                    // Seen only after it already ended.
                    if !live {
                        closes.push(entry.tuple);
                    }
                }
                (Some(false), true) => self.pending.push_back(RawConnection {
                    tuple: entry.tuple,
                    phase: Phase::Open,
                }),
                _ => {}
            }
        }
        for (tuple, was_live) in &self.previous {
            if *was_live && current.get(tuple) != Some(&true) {
                closes.push(*tuple);
            }
        }
        self.pending.extend(closes.into_iter().map(|tuple| RawConnection {
            tuple,
            phase: Phase::Close,
        }));
        self.previous = current;
        Ok(())
    }

    fn backoff(&self) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(32);
        let factor = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self.config.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.config.max_backoff_ms))
    }
}

impl Iterator for ConntrackSource {
    type Item = Result<RawConnection, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.is_shutting_down() {
                self.finished = true;
                return None;
            }
            if let Some(raw) = self.pending.pop_front() {
                return Some(Ok(raw));
            }
            if let Some(delay) = self.next_delay.take() {
                if !self.sleep(delay) {
                    self.finished = true;
                    return None;
                }
            }
            match self.sample() {
                Ok(()) => {
                    self.consecutive_failures = 0;
                    self.next_delay = Some(self.config.poll_interval());
                }
                Err(source) => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.config.max_consecutive_failures {
                        self.finished = true;
                        return Some(Err(SourceError::Sustained {
                            path: self.path.clone(),
                            failures: self.consecutive_failures,
                            source,
                        }));
                    }
                    let delay = self.backoff();
                    tracing::warn!(
                        error = %source,
                        failures = self.consecutive_failures,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "conntrack read failed, backing off"
                    );
                    self.next_delay = Some(delay);
                }
            }
        }
    }
}
