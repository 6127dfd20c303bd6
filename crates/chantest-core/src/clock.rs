//! Trusted wall-clock time from a pool of SNTP servers.
//!
//! Selection and status bookkeeping compare timestamps written by different
//! CI runners, so the local clock is never consulted. [`TimeSource`] asks each
//! configured server in order and returns the first answer; if every server
//! fails the individual errors are aggregated into [`TimeError::Unavailable`].
//!
//! Timestamps are exchanged as text in exactly one layout,
//! `YYYY-MM-DDTHH:MM:SS+00:00` (see [`format_utc_time`] / [`parse_utc_time`]).

use std::fmt::Write as _;
use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::error::ErrorCode;

/// The single textual layout used for every persisted timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S+00:00";

/// Seconds between the NTP era-0 epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

/// Size of an SNTP packet without extension fields.
const PACKET_LEN: usize = 48;

/// Byte offset of the transmit timestamp inside an SNTP packet.
const TRANSMIT_OFFSET: usize = 40;

/// Failure of a single server query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Socket-level failure (resolution, send, receive timeout).
    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// The server answered with something that is not a usable SNTP reply.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors produced by the time source and timestamp codec.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// Every configured server failed.
    #[error("could not get timestamp. Errors: {}", render_failures(.errors))]
    Unavailable { errors: Vec<(String, QueryError)> },

    /// A timestamp string deviates from [`TIMESTAMP_FORMAT`].
    #[error("timestamp {input:?} does not match layout YYYY-MM-DDTHH:MM:SS+00:00: {reason}")]
    Format { input: String, reason: String },
}

impl TimeError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable { .. } => ErrorCode::TimeUnavailable,
            Self::Format { .. } => ErrorCode::TimestampFormat,
        }
    }
}

fn render_failures(errors: &[(String, QueryError)]) -> String {
    let mut out = String::new();
    for (i, (server, err)) in errors.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{server}: {err}");
    }
    out
}

/// One request/response exchange with a single time server.
pub trait TimeQuery {
    /// Ask `server` for the current time, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] on network failure or a malformed reply.
    fn query(&self, server: &str, timeout: Duration) -> Result<DateTime<Utc>, QueryError>;
}

/// Anything that can report the current trusted time.
pub trait Clock {
    /// Current UTC time.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Unavailable`] when no authority answered.
    fn now(&self) -> Result<DateTime<Utc>, TimeError>;
}

/// Minimal SNTP v4 client over UDP port 123.
#[derive(Debug, Default, Clone, Copy)]
pub struct SntpClient;

impl TimeQuery for SntpClient {
    fn query(&self, server: &str, timeout: Duration) -> Result<DateTime<Utc>, QueryError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;
        socket.connect((server, 123))?;

        socket.send(&request_packet())?;
        let mut response = [0u8; PACKET_LEN];
        let len = socket.recv(&mut response)?;
        decode_response(&response[..len])
    }
}

/// Client request: LI = 0, VN = 4, Mode = 3, everything else zero.
#[must_use]
pub const fn request_packet() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = (4 << 3) | 3;
    packet
}

/// Extract the transmit timestamp from a server reply.
///
/// Sub-second precision is dropped.
///
/// # Errors
///
/// Returns [`QueryError::Protocol`] for short packets, non-server modes,
/// kiss-of-death replies (stratum 0), or an unset transmit timestamp.
pub fn decode_response(packet: &[u8]) -> Result<DateTime<Utc>, QueryError> {
    if packet.len() < PACKET_LEN {
        return Err(QueryError::Protocol(format!(
            "short reply: {} bytes",
            packet.len()
        )));
    }
    let mode = packet[0] & 0b111;
    if mode != 4 && mode != 5 {
        return Err(QueryError::Protocol(format!("unexpected mode {mode}")));
    }
    if packet[1] == 0 {
        let code = String::from_utf8_lossy(&packet[12..16]).into_owned();
        return Err(QueryError::Protocol(format!("kiss-of-death {code:?}")));
    }

    let mut seconds = [0u8; 4];
    seconds.copy_from_slice(&packet[TRANSMIT_OFFSET..TRANSMIT_OFFSET + 4]);
    let ntp_seconds = i64::from(u32::from_be_bytes(seconds));
    if ntp_seconds == 0 {
        return Err(QueryError::Protocol("transmit timestamp not set".to_string()));
    }

    // Era 1 starts in 2036; small values are past the rollover.
    let ntp_seconds = if ntp_seconds < 1 << 31 {
        ntp_seconds + (1 << 32)
    } else {
        ntp_seconds
    };

    DateTime::from_timestamp(ntp_seconds - NTP_UNIX_OFFSET, 0)
        .ok_or_else(|| QueryError::Protocol(format!("timestamp {ntp_seconds} out of range")))
}

/// Ordered pool of time servers queried through a [`TimeQuery`].
#[derive(Debug, Clone)]
pub struct TimeSource<Q = SntpClient> {
    servers: Vec<String>,
    timeout: Duration,
    client: Q,
}

impl TimeSource<SntpClient> {
    /// Time source backed by the real SNTP client.
    #[must_use]
    pub const fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self::with_client(servers, timeout, SntpClient)
    }
}

impl<Q: TimeQuery> TimeSource<Q> {
    /// Time source backed by a caller-supplied client.
    #[must_use]
    pub const fn with_client(servers: Vec<String>, timeout: Duration, client: Q) -> Self {
        Self {
            servers,
            timeout,
            client,
        }
    }

    /// Query each server in order, returning the first answer.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Unavailable`] carrying every server's error when
    /// none of them answered.
    pub fn get_ntp_time(&self) -> Result<DateTime<Utc>, TimeError> {
        let mut errors = Vec::new();
        for server in &self.servers {
            match self.client.query(server, self.timeout) {
                Ok(time) => {
                    debug!(server = %server, time = %format_utc_time(time), "time server answered");
                    return Ok(time);
                }
                Err(err) => {
                    warn!(server = %server, error = %err, "time server query failed");
                    errors.push((server.clone(), err));
                }
            }
        }
        Err(TimeError::Unavailable { errors })
    }
}

impl<Q: TimeQuery> Clock for TimeSource<Q> {
    fn now(&self) -> Result<DateTime<Utc>, TimeError> {
        self.get_ntp_time()
    }
}

/// A clock that always reports the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> Result<DateTime<Utc>, TimeError> {
        Ok(self.0)
    }
}

/// Render a UTC timestamp in [`TIMESTAMP_FORMAT`].
///
/// The `Utc` type parameter carries the "already UTC" precondition, so there
/// is no runtime check.
#[must_use]
pub fn format_utc_time(time: DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp written by [`format_utc_time`].
///
/// # Errors
///
/// Returns [`TimeError::Format`] on any deviation from the layout, including
/// unpadded fields that a lenient parser would accept.
pub fn parse_utc_time(input: &str) -> Result<DateTime<Utc>, TimeError> {
    let naive =
        NaiveDateTime::parse_from_str(input, TIMESTAMP_FORMAT).map_err(|e| TimeError::Format {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
    let time = naive.and_utc();
    if format_utc_time(time) != input {
        return Err(TimeError::Format {
            input: input.to_string(),
            reason: "non-canonical field width".to_string(),
        });
    }
    Ok(time)
}
