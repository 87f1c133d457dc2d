//! Phase registry: the fixed, totally ordered stages a message passes through.
//!
//! Each direction (in, out, in-fault, out-fault) owns its own [`PhaseSet`].
//! Sets are validated once at construction and never change afterwards; the
//! chain resolves an interceptor's declared phase name to a position in the
//! set when the interceptor is added.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PhaseError;

/// Standard phase names.
pub mod names {
    pub const RECEIVE: &str = "receive";
    pub const READ: &str = "read";
    pub const PRE_PROTOCOL: &str = "pre-protocol";
    pub const PRE_PROTOCOL_FRONTEND: &str = "pre-protocol-frontend";
    pub const USER_PROTOCOL: &str = "user-protocol";
    pub const POST_PROTOCOL: &str = "post-protocol";
    pub const UNMARSHAL: &str = "unmarshal";
    pub const PRE_LOGICAL: &str = "pre-logical";
    pub const USER_LOGICAL: &str = "user-logical";
    pub const POST_LOGICAL: &str = "post-logical";
    pub const PRE_INVOKE: &str = "pre-invoke";
    pub const INVOKE: &str = "invoke";
    pub const POST_INVOKE: &str = "post-invoke";

    pub const SETUP: &str = "setup";
    pub const PREPARE_SEND: &str = "prepare-send";
    pub const PRE_STREAM: &str = "pre-stream";
    pub const USER_STREAM: &str = "user-stream";
    pub const POST_STREAM: &str = "post-stream";
    pub const WRITE: &str = "write";
    pub const MARSHAL: &str = "marshal";
    pub const SEND: &str = "send";

    pub const SETUP_ENDING: &str = "setup-ending";
    pub const PRE_LOGICAL_ENDING: &str = "pre-logical-ending";
    pub const USER_LOGICAL_ENDING: &str = "user-logical-ending";
    pub const POST_LOGICAL_ENDING: &str = "post-logical-ending";
    pub const PREPARE_SEND_ENDING: &str = "prepare-send-ending";
    pub const PRE_STREAM_ENDING: &str = "pre-stream-ending";
    pub const PRE_PROTOCOL_ENDING: &str = "pre-protocol-ending";
    pub const PRE_PROTOCOL_FRONTEND_ENDING: &str = "pre-protocol-frontend-ending";
    pub const WRITE_ENDING: &str = "write-ending";
    pub const MARSHAL_ENDING: &str = "marshal-ending";
    pub const USER_PROTOCOL_ENDING: &str = "user-protocol-ending";
    pub const POST_PROTOCOL_ENDING: &str = "post-protocol-ending";
    pub const USER_STREAM_ENDING: &str = "user-stream-ending";
    pub const POST_STREAM_ENDING: &str = "post-stream-ending";
    pub const SEND_ENDING: &str = "send-ending";
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// The four processing directions, each with its own phase list and
/// interceptor list per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
    InFault,
    OutFault,
}

impl Direction {
    /// Returns true for the two fault directions.
    #[must_use]
    pub const fn is_fault(self) -> bool {
        matches!(self, Self::InFault | Self::OutFault)
    }

    /// Returns true for directions that process an outbound message.
    #[must_use]
    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::Out | Self::OutFault)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::InFault => "in-fault",
            Self::OutFault => "out-fault",
        }
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// A named stage with a priority that defines its position within a direction.
///
/// Ordering is priority first, then name, so two phases only compare equal
/// when both fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub priority: i32,
}

impl Phase {
    #[must_use]
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

impl Ord for Phase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for Phase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.priority)
    }
}

// ---------------------------------------------------------------------------
// PhaseSet
// ---------------------------------------------------------------------------

/// Priority given to the phase at `position` by [`PhaseSet::from_names`].
fn priority_at(position: usize) -> Option<i32> {
    i32::try_from(position)
        .ok()
        .and_then(|rank| rank.checked_add(1))
        .and_then(|rank| rank.checked_mul(1000))
}

/// Immutable, validated, totally ordered list of phases for one direction.
///
/// Cheap to clone: the phase list and name index are shared.
#[derive(Debug, Clone)]
pub struct PhaseSet {
    phases: Arc<[Phase]>,
    index: Arc<HashMap<String, usize>>,
}

impl PhaseSet {
    /// Builds a set from phases in any order.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError`] if two phases share a name or a priority.
    pub fn new(phases: impl IntoIterator<Item = Phase>) -> Result<Self, PhaseError> {
        let mut phases: Vec<Phase> = phases.into_iter().collect();
        phases.sort();

        for pair in phases.windows(2) {
            if pair[0].priority == pair[1].priority {
                return Err(PhaseError::DuplicatePriority {
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                    priority: pair[0].priority,
                });
            }
        }

        let mut index = HashMap::with_capacity(phases.len());
        for (position, phase) in phases.iter().enumerate() {
            if index.insert(phase.name.clone(), position).is_some() {
                return Err(PhaseError::DuplicateName {
                    name: phase.name.clone(),
                });
            }
        }

        Ok(Self {
            phases: phases.into(),
            index: Arc::new(index),
        })
    }

    /// Builds a set from names, assigning priorities by position.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::DuplicateName`] if a name repeats, and
    /// [`PhaseError::PriorityOverflow`] if the list is too long for its
    /// priorities to fit in an `i32`.
    pub fn from_names<I, S>(names: I) -> Result<Self, PhaseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let phases = names
            .into_iter()
            .enumerate()
            .map(|(position, name)| {
                let name = name.into();
                match priority_at(position) {
                    Some(priority) => Ok(Phase::new(name, priority)),
                    None => Err(PhaseError::PriorityOverflow { name, position }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(phases)
    }

    /// Position of the named phase within this set.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Phase> {
        self.index_of(name).map(|position| &self.phases[position])
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Phase> {
        self.phases.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Phase] {
        &self.phases
    }

    /// Returns true if both handles share the same underlying list.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.phases, &other.phases)
    }
}

impl<'a> IntoIterator for &'a PhaseSet {
    type Item = &'a Phase;
    type IntoIter = std::slice::Iter<'a, Phase>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ---------------------------------------------------------------------------
// PhaseManager
// ---------------------------------------------------------------------------

/// Supplies the phase registry for every direction.
///
/// Used as `Arc<dyn PhaseManager>`; looked up once per chain build.
pub trait PhaseManager: Send + Sync {
    fn in_phases(&self) -> &PhaseSet;

    fn out_phases(&self) -> &PhaseSet;

    fn in_fault_phases(&self) -> &PhaseSet;

    fn out_fault_phases(&self) -> &PhaseSet;

    fn phases(&self, direction: Direction) -> &PhaseSet {
        match direction {
            Direction::In => self.in_phases(),
            Direction::Out => self.out_phases(),
            Direction::InFault => self.in_fault_phases(),
            Direction::OutFault => self.out_fault_phases(),
        }
    }
}

/// Inbound phase names in execution order.
pub const DEFAULT_IN_PHASES: &[&str] = &[
    names::RECEIVE,
    names::PRE_STREAM,
    names::USER_STREAM,
    names::POST_STREAM,
    names::READ,
    names::PRE_PROTOCOL,
    names::PRE_PROTOCOL_FRONTEND,
    names::USER_PROTOCOL,
    names::POST_PROTOCOL,
    names::UNMARSHAL,
    names::PRE_LOGICAL,
    names::USER_LOGICAL,
    names::POST_LOGICAL,
    names::PRE_INVOKE,
    names::INVOKE,
    names::POST_INVOKE,
];

/// Outbound phase names in execution order, including the `-ending` mirror
/// phases used by interceptors that register cleanup for themselves.
pub const DEFAULT_OUT_PHASES: &[&str] = &[
    names::SETUP,
    names::PRE_LOGICAL,
    names::USER_LOGICAL,
    names::POST_LOGICAL,
    names::PREPARE_SEND,
    names::PRE_STREAM,
    names::PRE_PROTOCOL,
    names::PRE_PROTOCOL_FRONTEND,
    names::WRITE,
    names::MARSHAL,
    names::USER_PROTOCOL,
    names::POST_PROTOCOL,
    names::USER_STREAM,
    names::POST_STREAM,
    names::SEND,
    names::SEND_ENDING,
    names::POST_STREAM_ENDING,
    names::USER_STREAM_ENDING,
    names::POST_PROTOCOL_ENDING,
    names::USER_PROTOCOL_ENDING,
    names::MARSHAL_ENDING,
    names::WRITE_ENDING,
    names::PRE_PROTOCOL_FRONTEND_ENDING,
    names::PRE_PROTOCOL_ENDING,
    names::PRE_STREAM_ENDING,
    names::PREPARE_SEND_ENDING,
    names::POST_LOGICAL_ENDING,
    names::USER_LOGICAL_ENDING,
    names::PRE_LOGICAL_ENDING,
    names::SETUP_ENDING,
];

/// Phase manager holding four fixed phase sets.
#[derive(Debug, Clone)]
pub struct DefaultPhaseManager {
    in_phases: PhaseSet,
    out_phases: PhaseSet,
    in_fault_phases: PhaseSet,
    out_fault_phases: PhaseSet,
}

impl DefaultPhaseManager {
    /// Standard registry: in-fault reuses the inbound list and out-fault the
    /// outbound list.
    ///
    /// # Panics
    ///
    /// Never in practice: the built-in name lists contain no duplicates
    /// (covered by tests).
    #[must_use]
    pub fn new() -> Self {
        #[allow(clippy::expect_used)]
        let in_phases = PhaseSet::from_names(DEFAULT_IN_PHASES.iter().copied())
            .expect("built-in inbound phases are unique");
        #[allow(clippy::expect_used)]
        let out_phases = PhaseSet::from_names(DEFAULT_OUT_PHASES.iter().copied())
            .expect("built-in outbound phases are unique");
        Self {
            in_fault_phases: in_phases.clone(),
            out_fault_phases: out_phases.clone(),
            in_phases,
            out_phases,
        }
    }

    /// Registry with caller-supplied sets for each direction.
    #[must_use]
    pub fn with_phases(
        in_phases: PhaseSet,
        out_phases: PhaseSet,
        in_fault_phases: PhaseSet,
        out_fault_phases: PhaseSet,
    ) -> Self {
        Self {
            in_phases,
            out_phases,
            in_fault_phases,
            out_fault_phases,
        }
    }
}

impl Default for DefaultPhaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseManager for DefaultPhaseManager {
    fn in_phases(&self) -> &PhaseSet {
        &self.in_phases
    }

    fn out_phases(&self) -> &PhaseSet {
        &self.out_phases
    }

    fn in_fault_phases(&self) -> &PhaseSet {
        &self.in_fault_phases
    }

    fn out_fault_phases(&self) -> &PhaseSet {
        &self.out_fault_phases
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_ordering_priority_first() {
        let a = Phase::new("zzz", 1);
        let b = Phase::new("aaa", 2);
        assert!(a < b);
    }

    #[test]
    fn phase_set_sorts_by_priority() {
        let set = PhaseSet::new(vec![
            Phase::new("phase3", 3),
            Phase::new("phase1", 1),
            Phase::new("phase2", 2),
        ])
        .unwrap();
        let names: Vec<&str> = set.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["phase1", "phase2", "phase3"]);
        assert_eq!(set.index_of("phase2"), Some(1));
        assert_eq!(set.index_of("missing"), None);
    }

    #[test]
    fn duplicate_priority_rejected() {
        let err = PhaseSet::new(vec![Phase::new("a", 1), Phase::new("b", 1)]).unwrap_err();
        assert!(matches!(err, PhaseError::DuplicatePriority { priority: 1, .. }));
    }

    #[test]
    fn duplicate_name_rejected() {
        let err = PhaseSet::new(vec![Phase::new("a", 1), Phase::new("a", 2)]).unwrap_err();
        assert_eq!(err, PhaseError::DuplicateName { name: "a".to_string() });
    }

    #[test]
    fn from_names_keeps_declaration_order() {
        let set = PhaseSet::from_names(["receive", "unmarshal", "invoke"]).unwrap();
        assert_eq!(set.index_of("receive"), Some(0));
        assert_eq!(set.index_of("invoke"), Some(2));
        assert!(set.get("unmarshal").unwrap().priority < set.get("invoke").unwrap().priority);
    }

    #[test]
    fn default_manager_lists_are_valid() {
        let manager = DefaultPhaseManager::new();
        assert_eq!(manager.in_phases().len(), DEFAULT_IN_PHASES.len());
        assert_eq!(manager.out_phases().len(), DEFAULT_OUT_PHASES.len());
        assert!(manager.in_phases().index_of(names::UNMARSHAL).unwrap()
            < manager.in_phases().index_of(names::INVOKE).unwrap());
        assert!(manager.out_phases().index_of(names::SEND).unwrap()
            < manager.out_phases().index_of(names::SEND_ENDING).unwrap());
    }

    #[test]
    fn fault_directions_default_to_main_lists() {
        let manager = DefaultPhaseManager::new();
        assert_eq!(
            manager.phases(Direction::InFault).as_slice(),
            manager.phases(Direction::In).as_slice()
        );
        assert_eq!(
            manager.phases(Direction::OutFault).as_slice(),
            manager.phases(Direction::Out).as_slice()
        );
    }

    #[test]
    fn custom_fault_phases_are_independent() {
        let main = PhaseSet::from_names(["receive", "invoke"]).unwrap();
        let fault = PhaseSet::from_names(["marshal", "send"]).unwrap();
        let manager =
            DefaultPhaseManager::with_phases(main.clone(), main, fault.clone(), fault);
        assert!(manager.in_fault_phases().contains("marshal"));
        assert!(!manager.in_phases().contains("marshal"));
    }

    #[test]
    fn name_priorities_stop_at_i32_range() {
        assert_eq!(priority_at(0), Some(1000));
        assert_eq!(priority_at(2_147_482), Some(2_147_483_000));
        assert_eq!(priority_at(2_147_483), None);
        assert_eq!(priority_at(usize::MAX), None);
    }

    #[test]
    fn phase_deserializes_from_json() {
        let phase: Phase = serde_json::from_str(r#"{"name":"receive","priority":1000}"#).unwrap();
        assert_eq!(phase, Phase::new("receive", 1000));
    }
}
