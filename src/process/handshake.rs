//! Readiness handshake parsing
//!
//! The backend announces readiness on stdout by printing the port it listens
//! on and the pid of the serving process. Parsers turn stdout lines into
//! [`HandshakeUpdate`]s and [`ReadinessTracker`] decides when both values are
//! known.

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, trace, warn};

/// Values recognised on a single stdout line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeUpdate {
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

impl HandshakeUpdate {
    pub fn is_empty(&self) -> bool {
        self.port.is_none() && self.pid.is_none()
    }
}

/// Handshake parser trait for testing and alternative backends
pub trait HandshakeParser: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Parse a stdout line; lines without handshake data yield an empty update
    fn parse_line(&self, line: &str) -> HandshakeUpdate;
}

/// Default parser for `port:<digits>` and `pid:<digits>` markers
///
/// Markers must be whitespace-delimited tokens; surrounding whitespace on the
/// line is ignored.
#[derive(Clone)]
pub struct MarkerLineParser {
    port_regex: Regex,
    pid_regex: Regex,
}

impl MarkerLineParser {
    /// Create a new marker parser with compiled regex patterns
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // port:41234
            port_regex: Regex::new(r"(?:\s|^)port:(\d+)(?:\s|$)")?,
            // pid:8812
            pid_regex: Regex::new(r"(?:\s|^)pid:(\d+)(?:\s|$)")?,
        })
    }

    fn capture<T: std::str::FromStr>(regex: &Regex, line: &str, marker: &str) -> Option<T> {
        let digits = regex.captures(line)?.get(1)?.as_str();
        match digits.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring out of range {} marker: {}", marker, digits);
                None
            }
        }
    }
}

impl Default for MarkerLineParser {
    fn default() -> Self {
        Self::new().expect("Failed to compile regex patterns")
    }
}

impl HandshakeParser for MarkerLineParser {
    fn name(&self) -> &'static str {
        "marker-line"
    }

    fn parse_line(&self, line: &str) -> HandshakeUpdate {
        let line = line.trim();
        HandshakeUpdate {
            port: Self::capture(&self.port_regex, line, "port"),
            pid: Self::capture(&self.pid_regex, line, "pid"),
        }
    }
}

/// Alternative parser for a JSON announcement line: `{"port": N, "pid": N}`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineParser;

#[derive(Deserialize)]
struct JsonAnnouncement {
    port: Option<u16>,
    pid: Option<u32>,
}

impl HandshakeParser for JsonLineParser {
    fn name(&self) -> &'static str {
        "json-line"
    }

    fn parse_line(&self, line: &str) -> HandshakeUpdate {
        let line = line.trim();
        if !line.starts_with('{') {
            return HandshakeUpdate::default();
        }

        match serde_json::from_str::<JsonAnnouncement>(line) {
            Ok(announcement) => HandshakeUpdate {
                port: announcement.port,
                pid: announcement.pid,
            },
            Err(e) => {
                trace!("JsonLineParser: not an announcement ({}): {}", e, line);
                HandshakeUpdate::default()
            }
        }
    }
}

/// Accumulates handshake values for one process generation
///
/// The first value seen for each marker wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessTracker {
    port: Option<u16>,
    pid: Option<u32>,
    announced: bool,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update; returns true exactly once, when both values are known
    pub fn observe(&mut self, update: HandshakeUpdate) -> bool {
        if self.port.is_none() && update.port.is_some() {
            self.port = update.port;
            debug!("Backend announced port {:?}", self.port);
        }
        if self.pid.is_none() && update.pid.is_some() {
            self.pid = update.pid;
            debug!("Backend announced pid {:?}", self.pid);
        }

        if !self.announced && self.port.is_some() && self.pid.is_some() {
            self.announced = true;
            return true;
        }
        false
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}
