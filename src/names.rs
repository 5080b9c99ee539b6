//! Firmware naming variants.
//!
//! Camera firmware revisions disagree on a few node names. Each camera checks
//! the candidates once when it is opened and keeps the outcome for its
//! lifetime; later property accesses go through the resolved [`NameMap`].

use std::collections::HashMap;
use std::fmt;

/// `(canonical, alternates)` in lookup order.
pub const NAME_ALTERNATES: &[(&str, &[&str])] = &[
    ("AcquisitionFrameRateEnable", &["AcquisitionFrameRateEnabled"]),
    ("GammaEnable", &["GammaEnabled"]),
];

/// Node that turns chunk data on for the whole device.
pub const CHUNK_MODE_ACTIVE: &str = "ChunkModeActive";
/// Enumeration node selecting which chunk `ChunkEnable` applies to.
pub const CHUNK_SELECTOR: &str = "ChunkSelector";
/// Boolean node enabling the selected chunk.
pub const CHUNK_ENABLE: &str = "ChunkEnable";

/// Per-frame metadata chunks the acquisition path relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    /// Frame counter.
    FrameId,
    /// Exposure of the frame.
    ExposureTime,
    /// Device timestamp.
    Timestamp,
}

impl ChunkKind {
    /// Every kind, in activation order.
    pub const ALL: [ChunkKind; 3] = [
        ChunkKind::FrameId,
        ChunkKind::ExposureTime,
        ChunkKind::Timestamp,
    ];

    /// Selector entries to try, most common first.
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            ChunkKind::FrameId => &["FrameID", "FrameCounter"],
            ChunkKind::ExposureTime => &["ExposureTime"],
            ChunkKind::Timestamp => &["Timestamp", "TimeStamp"],
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkKind::FrameId => "frame id",
            ChunkKind::ExposureTime => "exposure time",
            ChunkKind::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// Logical node name -> name this device actually answers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMap {
    remapped: HashMap<&'static str, &'static str>,
}

impl NameMap {
    /// Check every canonical name with `readable`.
    ///
    /// A canonical name that cannot be read is replaced by the first alternate
    /// that can. If no alternate reads either, the first alternate is used.
    pub fn resolve(mut readable: impl FnMut(&str) -> bool) -> Self {
        let mut remapped = HashMap::new();
        for (canonical, alternates) in NAME_ALTERNATES {
            if readable(canonical) {
                continue;
            }
            let Some(first) = alternates.first() else {
                continue;
            };
            let chosen = alternates
                .iter()
                .copied()
                .find(|alt| readable(alt))
                .unwrap_or(*first);
            tracing::debug!(canonical, alternate = chosen, "Remapping firmware node name");
            remapped.insert(*canonical, chosen);
        }
        Self { remapped }
    }

    /// Name to use on this device for logical `name`.
    pub fn get<'a>(&self, name: &'a str) -> &'a str {
        self.remapped.get(name).copied().unwrap_or(name)
    }

    /// Whether this device spells `name` differently.
    pub fn is_remapped(&self, name: &str) -> bool {
        self.remapped.contains_key(name)
    }
}

/// Selector entry that was enabled for each chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkNames {
    active: Vec<(ChunkKind, &'static str)>,
}

impl ChunkNames {
    /// Enable every chunk kind, trying its candidates in order.
    ///
    /// `enable` selects and enables one selector entry, returning whether the
    /// device accepted it. Kinds with no accepted candidate are logged at warn.
    pub fn activate(mut enable: impl FnMut(&'static str) -> bool) -> Self {
        let mut active = Vec::with_capacity(ChunkKind::ALL.len());
        for kind in ChunkKind::ALL {
            match kind.candidates().iter().copied().find(|name| enable(*name)) {
                Some(name) => active.push((kind, name)),
                None => tracing::warn!(
                    chunk = %kind,
                    candidates = ?kind.candidates(),
                    "Unable to enable chunk data, metadata will be missing"
                ),
            }
        }
        Self { active }
    }

    /// Selector entry enabled for `kind`, if any.
    pub fn selector(&self, kind: ChunkKind) -> Option<&'static str> {
        self.active
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, name)| *name)
    }

    /// Whether frames carry `kind`.
    pub fn is_active(&self, kind: ChunkKind) -> bool {
        self.selector(kind).is_some()
    }

    /// Kinds the device refused.
    pub fn missing(&self) -> Vec<ChunkKind> {
        ChunkKind::ALL
            .into_iter()
            .filter(|kind| !self.is_active(*kind))
            .collect()
    }
}
