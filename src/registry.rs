// src/registry.rs
//
// Venue selection and internal ticker allocation. A session trades one
// venue at a time; which one comes from the configured exchange sections.

use std::fmt;

use anyhow::{bail, Result};

use crate::config::SessionConfig;
use crate::types::TickerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueKind {
    Octane,
    Kestrel,
}

impl VenueKind {
    pub fn parse(s: &str) -> Option<VenueKind> {
        match s.to_ascii_uppercase().as_str() {
            "OCTANE" => Some(VenueKind::Octane),
            "KESTREL" => Some(VenueKind::Kestrel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VenueKind::Octane => "OCTANE",
            VenueKind::Kestrel => "KESTREL",
        }
    }
}

impl fmt::Display for VenueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic allocator for process-local ticker ids.
#[derive(Debug)]
pub struct TickerAllocator {
    next: TickerId,
}

impl TickerAllocator {
    pub fn starting_at(next: TickerId) -> Self {
        Self { next: next.max(1) }
    }

    pub fn alloc(&mut self) -> TickerId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Pick the active venue from the config: exactly one recognized exchange
/// section must be present.
pub fn select_venue(cfg: &SessionConfig) -> Result<VenueKind> {
    let mut venues: Vec<VenueKind> = cfg
        .exchanges
        .keys()
        .filter_map(|name| VenueKind::parse(name))
        .collect();
    venues.sort_by_key(|v| v.as_str());
    venues.dedup();
    match venues.as_slice() {
        [venue] => Ok(*venue),
        [] => bail!("no recognized exchange section in config"),
        _ => bail!("multiple venues configured; sessions run one venue at a time"),
    }
}
