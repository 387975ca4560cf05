// Copyright 2020 Joyent, Inc.

use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

use itertools::Itertools;
use serde::Deserialize;
use slog::Logger;
use thiserror::Error;

use crate::error::{Error, Result};

// Default idle threshold for eviction, in interval units
const DEFAULT_MAX_IDLE_INTERVAL: u64 = 300;
// Default zombie reconciliation period, in interval units
const DEFAULT_ZOMBIE_DETECTION_INTERVAL: u64 = 30;
// Default cap on eviction candidates inspected per sweep
const DEFAULT_NUM_TESTS_PER_EVICTION: u32 = 3;

#[derive(Debug, Error, PartialEq)]
pub enum ZkConnectStringError {
    #[error("connect string is empty")]
    EmptyString,
    #[error("connect string contains a malformed address")]
    MalformedAddr,
}

impl From<ParseIntError> for ZkConnectStringError {
    fn from(_: ParseIntError) -> Self {
        ZkConnectStringError::MalformedAddr
    }
}

///
/// One `host:port` entry of a connect string. The host is an IP address or
/// a DNS name; names are only resolved when a connection is made.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkAddr {
    host: String,
    port: u16,
}

impl ZkAddr {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Look up the socket addresses this entry currently stands for.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        (host, self.port).to_socket_addrs().map(Iterator::collect)
    }
}

impl From<SocketAddr> for ZkAddr {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        };
        ZkAddr {
            host,
            port: addr.port(),
        }
    }
}

impl fmt::Display for ZkAddr {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port)
    }
}

fn is_host_name(host: &str) -> bool {
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl FromStr for ZkAddr {
    type Err = ZkConnectStringError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(ZkAddr::from(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or(ZkConnectStringError::MalformedAddr)?;
        if !is_host_name(host) {
            return Err(ZkConnectStringError::MalformedAddr);
        }
        Ok(ZkAddr {
            host: host.to_ascii_lowercase(),
            port: port.parse()?,
        })
    }
}

///
/// `ZkConnectString` represents a list of coordinator addresses to connect
/// to, written as `host:port[,host:port...]`.
///
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct ZkConnectString(Vec<ZkAddr>);

impl ZkConnectString {
    pub fn addrs(&self) -> &[ZkAddr] {
        &self.0
    }

    ///
    /// Gets a reference to the address at the provided index. Returns None
    /// if the index is out of bounds.
    ///
    pub fn get_addr_at(&self, index: usize) -> Option<&ZkAddr> {
        self.0.get(index)
    }

    ///
    /// Resolve every entry, in order. Entries that fail to resolve are
    /// skipped; the error is only returned when nothing resolved.
    ///
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let mut resolved = Vec::new();
        let mut last_err = None;
        for addr in &self.0 {
            match addr.resolve() {
                Ok(addrs) => resolved.extend(addrs),
                Err(e) => last_err = Some(e),
            }
        }
        match (resolved.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(resolved),
        }
    }
}

impl ToString for ZkConnectString {
    fn to_string(&self) -> String {
        self.0.iter().map(|x| x.to_string()).join(",")
    }
}

impl FromStr for ZkConnectString {
    type Err = ZkConnectStringError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ZkConnectStringError::EmptyString);
        }
        s.split(',')
            .map(|x| ZkAddr::from_str(x.trim()))
            .collect::<std::result::Result<Vec<ZkAddr>, _>>()
            .map(ZkConnectString)
    }
}

impl TryFrom<String> for ZkConnectString {
    type Error = ZkConnectStringError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        ZkConnectString::from_str(&s)
    }
}

/// The time unit applied to every interval in the pool options.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl IntervalUnit {
    fn millis_per_unit(self) -> u64 {
        match self {
            IntervalUnit::Milliseconds => 1,
            IntervalUnit::Seconds => 1_000,
            IntervalUnit::Minutes => 60_000,
            IntervalUnit::Hours => 3_600_000,
        }
    }

    pub fn to_duration(self, amount: u64) -> Duration {
        Duration::from_millis(amount.saturating_mul(self.millis_per_unit()))
    }

    /// Convert a span of milliseconds into whole units, truncating any
    /// remainder. Negative spans (clock skew between participants) count as
    /// zero.
    pub fn from_millis(self, millis: i64) -> u64 {
        if millis <= 0 {
            return 0;
        }
        millis as u64 / self.millis_per_unit()
    }
}

impl Default for IntervalUnit {
    fn default() -> Self {
        IntervalUnit::Seconds
    }
}

/// The configuration options for a distributed object pool. This is required
/// to instantiate a new pool. Every participant sharing a pool should use
/// the same `name` and coordinator ensemble.
#[derive(Debug, Deserialize)]
pub struct PoolOptions {
    /// The pool namespace. It becomes the root path segment under which all
    /// pool state is kept and so may not be empty or contain a `/`.
    pub name: String,
    /// The coordinator ensemble to connect to.
    pub connect_string: ZkConnectString,
    /// The maximum number of objects in use across all participants. Must be
    /// greater than zero.
    pub size: u32,
    /// An optional number of objects to create when the pool is first
    /// bootstrapped. Must not exceed `size`. The default is 0.
    pub init_size: Option<u32>,
    /// An optional period between eviction sweeps. Eviction is disabled
    /// unless this is specified and greater than zero.
    pub evict_interval: Option<u64>,
    /// An optional idle threshold after which unused objects are eligible for
    /// eviction. The default is 300.
    pub max_idle_interval: Option<u64>,
    /// An optional cap on the number of candidates inspected per eviction
    /// sweep. The default is 3.
    pub num_tests_per_eviction: Option<u32>,
    /// An optional period between zombie reconciliations. The default is 30.
    /// Zero disables reconciliation.
    pub zombie_detection_interval: Option<u64>,
    /// An optional period between metrics reports. Reporting is disabled
    /// unless this is specified and greater than zero.
    pub metric_interval: Option<u64>,
    /// An optional time unit for all of the intervals above. The default is
    /// seconds.
    pub interval_unit: Option<IntervalUnit>,
    /// An optional address to advertise in this participant's registration
    /// node. If not specified the local address is discovered.
    pub participant_address: Option<String>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain which is
    /// essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    #[serde(skip)]
    pub log: Option<Logger>,
}

impl PoolOptions {
    /// Options with only the required fields set.
    pub fn new<S: Into<String>>(
        name: S,
        connect_string: ZkConnectString,
        size: u32,
    ) -> Self {
        PoolOptions {
            name: name.into(),
            connect_string,
            size,
            init_size: None,
            evict_interval: None,
            max_idle_interval: None,
            num_tests_per_eviction: None,
            zombie_detection_interval: None,
            metric_interval: None,
            interval_unit: None,
            participant_address: None,
            log: None,
        }
    }
}

// The pool options with all defaults applied.
#[doc(hidden)]
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub name: String,
    pub connect_string: ZkConnectString,
    pub size: usize,
    pub init_size: usize,
    pub evict_interval: Option<u64>,
    pub max_idle_interval: u64,
    pub num_tests_per_eviction: usize,
    pub zombie_detection_interval: Option<u64>,
    pub metric_interval: Option<u64>,
    pub interval_unit: IntervalUnit,
    pub participant_address: Option<String>,
}

impl PoolConfig {
    pub fn resolve(options: &PoolOptions) -> Self {
        let positive = |v: Option<u64>| v.filter(|v| *v > 0);
        PoolConfig {
            name: options.name.clone(),
            connect_string: options.connect_string.clone(),
            size: options.size as usize,
            init_size: options.init_size.unwrap_or(0) as usize,
            evict_interval: positive(options.evict_interval),
            max_idle_interval: options
                .max_idle_interval
                .unwrap_or(DEFAULT_MAX_IDLE_INTERVAL),
            num_tests_per_eviction: options
                .num_tests_per_eviction
                .unwrap_or(DEFAULT_NUM_TESTS_PER_EVICTION)
                as usize,
            zombie_detection_interval: positive(Some(
                options
                    .zombie_detection_interval
                    .unwrap_or(DEFAULT_ZOMBIE_DETECTION_INTERVAL),
            )),
            metric_interval: positive(options.metric_interval),
            interval_unit: options.interval_unit.unwrap_or_default(),
            participant_address: options.participant_address.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::Config(format!(
                "pool name '{}' must be non-empty and may not contain '/'",
                self.name
            )));
        }
        if self.size == 0 {
            return Err(Error::Config(String::from(
                "size must be greater than zero",
            )));
        }
        if self.init_size > self.size {
            return Err(Error::Config(format!(
                "init_size ({}) may not exceed size ({})",
                self.init_size, self.size
            )));
        }
        Ok(())
    }

    pub fn evict_period(&self) -> Option<Duration> {
        self.evict_interval
            .map(|i| self.interval_unit.to_duration(i))
    }

    pub fn zombie_detection_period(&self) -> Option<Duration> {
        self.zombie_detection_interval
            .map(|i| self.interval_unit.to_duration(i))
    }

    pub fn metric_period(&self) -> Option<Duration> {
        self.metric_interval
            .map(|i| self.interval_unit.to_duration(i))
    }
}
