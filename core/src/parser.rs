//! Parsing of the status command's text output.
//!
//! The first non-empty line carries the tunnel state, every following
//! `key: value` line becomes a detail entry. Unknown keys are kept so new
//! fields reported by the VPN client show up without a parser change.

use std::fmt;

use log::debug;

use crate::error::PollError;

/// Older clients print the state behind this label.
const STATE_PREFIX: &str = "Tunnel status:";

const RELAY: &str = "Relay";

/// States that mean the tunnel is not up.
const NOT_CONNECTED_STATES: &[&str] = &[
    "disconnected",
    "connecting",
    "disconnecting",
    "reconnecting",
    "blocked",
    "error",
];

/// A labelled value reported by the status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailEntry {
    pub name: String,
    /// `None` when the command printed the label without a value.
    pub text: Option<String>,
}

impl DetailEntry {
    pub fn new(name: impl Into<String>, text: Option<&str>) -> Self {
        Self {
            name: name.into(),
            text: text.map(str::to_string),
        }
    }
}

impl fmt::Display for DetailEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.name, text),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VpnStatus {
    pub connected: bool,
    pub detailed_status: Vec<DetailEntry>,
}

impl VpnStatus {
    /// Details worth showing to a user; entries without a value are skipped.
    pub fn visible_details(&self) -> impl Iterator<Item = &DetailEntry> {
        self.detailed_status
            .iter()
            .filter(|entry| entry.text.as_deref().is_some_and(|t| !t.is_empty()))
    }
}

/// Parse raw status output into a `VpnStatus`.
pub fn parse(raw: &str) -> Result<VpnStatus, PollError> {
    let mut lines = raw.lines().map(str::trim).filter(|line| !line.is_empty());

    let Some(state_line) = lines.next() else {
        return Ok(VpnStatus::default());
    };

    let mut status = parse_state_line(state_line)?;
    let relay_from_state_line = !status.detailed_status.is_empty();

    for line in lines {
        match parse_detail_line(line) {
            Some(entry) => status.detailed_status.push(entry),
            None => debug!("Skipping unparseable status line: {line:?}"),
        }
    }

    // An explicit `Relay:` line wins over the one taken from the state line.
    if relay_from_state_line
        && status.detailed_status[1..]
            .iter()
            .any(|entry| entry.name == RELAY && entry.text.is_some())
    {
        status.detailed_status.remove(0);
    }

    Ok(status)
}

fn parse_state_line(line: &str) -> Result<VpnStatus, PollError> {
    let line = line.strip_prefix(STATE_PREFIX).unwrap_or(line).trim();

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let state = word
        .trim_end_matches(['.', ':', '…'])
        .to_ascii_lowercase();

    if state == "connected" {
        let mut status = VpnStatus {
            connected: true,
            detailed_status: Vec::new(),
        };
        if let Some(relay) = rest.strip_prefix("to ").map(str::trim)
            && !relay.is_empty()
        {
            status
                .detailed_status
                .push(DetailEntry::new(RELAY, Some(relay)));
        }
        Ok(status)
    } else if NOT_CONNECTED_STATES.contains(&state.as_str()) {
        Ok(VpnStatus::default())
    } else {
        Err(PollError::Parse(line.to_string()))
    }
}

fn parse_detail_line(line: &str) -> Option<DetailEntry> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if !key.starts_with(|c: char| c.is_alphabetic()) {
        return None;
    }

    let value = value.trim();
    let text = (!value.is_empty()).then_some(value);
    Some(DetailEntry::new(key, text))
}
