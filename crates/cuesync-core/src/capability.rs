//! Capability descriptors
//!
//! Nodes announce a mapping from capability name to flag or parameter at
//! registration. The core resolves it into the typed `Capabilities` it
//! schedules against: supported cue kinds, time-authority eligibility and
//! declared latency budget.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::{CapabilityError, CapabilityResult};

/// Descriptor key marking a node eligible to serve as time authority
pub const TIME_AUTHORITY_KEY: &str = "time_authority";

/// Descriptor key for the declared latency budget (microseconds)
pub const LATENCY_BUDGET_KEY: &str = "latency_budget_us";

/// Prefix of descriptor keys declaring cue kind support, e.g. `cue.lighting`
pub const CUE_KIND_PREFIX: &str = "cue.";

/// Enumerated cue kinds a node may execute
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CueKind {
    Lighting = 0x01,
    Video = 0x02,
    Audio = 0x03,
    Laser = 0x04,
    Motion = 0x05,
    Haptic = 0x06,
    Trigger = 0x07,
}

impl CueKind {
    pub const ALL: [CueKind; 7] = [
        CueKind::Lighting,
        CueKind::Video,
        CueKind::Audio,
        CueKind::Laser,
        CueKind::Motion,
        CueKind::Haptic,
        CueKind::Trigger,
    ];

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(CueKind::Lighting),
            0x02 => Some(CueKind::Video),
            0x03 => Some(CueKind::Audio),
            0x04 => Some(CueKind::Laser),
            0x05 => Some(CueKind::Motion),
            0x06 => Some(CueKind::Haptic),
            0x07 => Some(CueKind::Trigger),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CueKind::Lighting => "lighting",
            CueKind::Video => "video",
            CueKind::Audio => "audio",
            CueKind::Laser => "laser",
            CueKind::Motion => "motion",
            CueKind::Haptic => "haptic",
            CueKind::Trigger => "trigger",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        CueKind::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for CueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compact set of cue kinds
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CueKindSet(u16);

impl CueKindSet {
    pub const EMPTY: CueKindSet = CueKindSet(0);

    pub fn all() -> Self {
        CueKind::ALL.into_iter().collect()
    }

    #[inline]
    pub fn insert(&mut self, kind: CueKind) {
        self.0 |= 1 << kind.to_byte();
    }

    #[inline]
    pub fn contains(self, kind: CueKind) -> bool {
        self.0 & (1 << kind.to_byte()) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = CueKind> {
        CueKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<CueKind> for CueKindSet {
    fn from_iter<I: IntoIterator<Item = CueKind>>(iter: I) -> Self {
        let mut set = CueKindSet::EMPTY;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl fmt::Debug for CueKindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A single descriptor value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityValue {
    Flag(bool),
    Number(i64),
    Text(String),
}

/// Raw capability descriptor as announced by a node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    entries: BTreeMap<String, CapabilityValue>,
}

impl CapabilityDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: bool) -> Self {
        self.entries.insert(name.into(), CapabilityValue::Flag(value));
        self
    }

    pub fn with_number(mut self, name: impl Into<String>, value: i64) -> Self {
        self.entries.insert(name.into(), CapabilityValue::Number(value));
        self
    }

    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries
            .insert(name.into(), CapabilityValue::Text(value.into()));
        self
    }

    /// Declare support for a cue kind
    pub fn with_cue_kind(self, kind: CueKind) -> Self {
        self.with_flag(format!("{CUE_KIND_PREFIX}{}", kind.name()), true)
    }

    pub fn with_time_authority(self, eligible: bool) -> Self {
        self.with_flag(TIME_AUTHORITY_KEY, eligible)
    }

    pub fn with_latency_budget(self, budget: Duration) -> Self {
        let micros = i64::try_from(budget.as_micros()).unwrap_or(i64::MAX);
        self.with_number(LATENCY_BUDGET_KEY, micros)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: CapabilityValue) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityValue> {
        self.entries.get(name)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.entries.get(name)? {
            CapabilityValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<i64> {
        match self.entries.get(name)? {
            CapabilityValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CapabilityValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved, typed view of a node's capabilities
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub cue_kinds: CueKindSet,
    pub time_authority: bool,
    pub latency_budget: Duration,
    pub descriptor: CapabilityDescriptor,
}

impl Capabilities {
    /// Resolve a raw descriptor. Unknown keys are kept in the descriptor
    /// for predicate matching; known keys must carry the right value type.
    pub fn from_descriptor(descriptor: CapabilityDescriptor) -> CapabilityResult<Self> {
        let mut cue_kinds = CueKindSet::EMPTY;
        let mut time_authority = false;
        let mut latency_budget = Duration::ZERO;

        for (name, value) in descriptor.iter() {
            if let Some(kind_name) = name.strip_prefix(CUE_KIND_PREFIX) {
                let kind = CueKind::from_name(kind_name)
                    .ok_or_else(|| CapabilityError::UnknownCueKind(kind_name.to_owned()))?;
                match value {
                    CapabilityValue::Flag(true) => cue_kinds.insert(kind),
                    CapabilityValue::Flag(false) => {}
                    _ => return Err(CapabilityError::WrongType(name.to_owned())),
                }
            } else if name == TIME_AUTHORITY_KEY {
                match value {
                    CapabilityValue::Flag(v) => time_authority = *v,
                    _ => return Err(CapabilityError::WrongType(name.to_owned())),
                }
            } else if name == LATENCY_BUDGET_KEY {
                match value {
                    CapabilityValue::Number(v) if *v >= 0 => {
                        latency_budget = Duration::from_micros(*v as u64)
                    }
                    CapabilityValue::Number(v) => {
                        return Err(CapabilityError::OutOfRange(name.to_owned(), *v))
                    }
                    _ => return Err(CapabilityError::WrongType(name.to_owned())),
                }
            }
        }

        Ok(Capabilities {
            cue_kinds,
            time_authority,
            latency_budget,
            descriptor,
        })
    }

    #[inline]
    pub fn supports(&self, kind: CueKind) -> bool {
        self.cue_kinds.contains(kind)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            cue_kinds: CueKindSet::EMPTY,
            time_authority: false,
            latency_budget: Duration::ZERO,
            descriptor: CapabilityDescriptor::default(),
        }
    }
}

/// Predicate over capabilities, used by capability-based cue selectors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CapabilityPredicate {
    /// Node supports the given cue kind
    Supports(CueKind),
    /// Descriptor flag is present and true
    Flag(String),
    /// Descriptor number is present and at least the given value
    AtLeast(String, i64),
    /// Descriptor text equals the given value
    Equals(String, String),
    All(Vec<CapabilityPredicate>),
    Any(Vec<CapabilityPredicate>),
    Not(Box<CapabilityPredicate>),
}

impl CapabilityPredicate {
    pub fn matches(&self, caps: &Capabilities) -> bool {
        match self {
            CapabilityPredicate::Supports(kind) => caps.supports(*kind),
            CapabilityPredicate::Flag(name) => caps.descriptor.flag(name).unwrap_or(false),
            CapabilityPredicate::AtLeast(name, min) => caps
                .descriptor
                .number(name)
                .map(|v| v >= *min)
                .unwrap_or(false),
            CapabilityPredicate::Equals(name, expected) => matches!(
                caps.descriptor.get(name),
                Some(CapabilityValue::Text(v)) if v == expected
            ),
            CapabilityPredicate::All(preds) => preds.iter().all(|p| p.matches(caps)),
            CapabilityPredicate::Any(preds) => preds.iter().any(|p| p.matches(caps)),
            CapabilityPredicate::Not(pred) => !pred.matches(caps),
        }
    }
}
