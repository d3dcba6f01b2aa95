//! Event subscription boundary with the host VM.
//!
//! The host owns event dispatch. A tracer claims a tool identity, tells the host
//! which events it wants globally (call-level events) and per code unit
//! (fine-grained line/branch/jump events), and the host calls
//! [`Tracer::dispatch`](crate::Tracer::dispatch) synchronously when they fire.

use crate::code::CodeId;
use crate::error::TraceResult;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Tool identity slot claimed from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToolId(pub u8);

/// Slot reserved for coverage tools
pub const COVERAGE_ID: ToolId = ToolId(1);

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of monitoring events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventSet(u32);

impl EventSet {
    /// No events
    pub const NONE: EventSet = EventSet(0);
    /// A function or module body starts executing
    pub const UNIT_START: EventSet = EventSet(1 << 0);
    /// A suspended body resumes
    pub const UNIT_RESUME: EventSet = EventSet(1 << 1);
    /// A body returns normally
    pub const UNIT_RETURN: EventSet = EventSet(1 << 2);
    /// A body suspends without finishing
    pub const UNIT_YIELD: EventSet = EventSet(1 << 3);
    /// A new source line starts executing
    pub const LINE: EventSet = EventSet(1 << 4);
    /// A conditional branch is taken
    pub const BRANCH: EventSet = EventSet(1 << 5);
    /// An unconditional jump is taken
    pub const JUMP: EventSet = EventSet(1 << 6);

    /// Call-level events subscribed globally while running
    pub const CALL_LEVEL: EventSet = EventSet(
        Self::UNIT_START.0 | Self::UNIT_RESUME.0 | Self::UNIT_RETURN.0 | Self::UNIT_YIELD.0,
    );

    /// Fine-grained events, requested only for traced code units
    pub const FINE_GRAINED: EventSet =
        EventSet(Self::LINE.0 | Self::BRANCH.0 | Self::JUMP.0);

    /// Raw bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every event in `other` is in `self`
    pub fn contains(&self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

/// Host VM monitoring API used by the tracer.
pub trait Monitor: Send + Sync {
    /// Claim `tool` under `name`. Fails if the slot is taken.
    fn use_tool_id(&self, tool: ToolId, name: &str) -> TraceResult<()>;

    /// Release `tool`. The host drops every subscription made under it,
    /// including per-unit ones.
    fn free_tool_id(&self, tool: ToolId);

    /// Replace the globally delivered events for `tool`
    fn set_events(&self, tool: ToolId, events: EventSet);

    /// Replace the events delivered for one code unit
    fn set_local_events(&self, tool: ToolId, code: CodeId, events: EventSet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_groups() {
        assert!(EventSet::CALL_LEVEL.contains(EventSet::UNIT_START));
        assert!(EventSet::CALL_LEVEL.contains(EventSet::UNIT_YIELD));
        assert!(!EventSet::CALL_LEVEL.contains(EventSet::LINE));
        assert_eq!(
            EventSet::FINE_GRAINED,
            EventSet::LINE | EventSet::BRANCH | EventSet::JUMP
        );
        assert!(EventSet::NONE.is_empty());
    }

    #[test]
    fn test_bitor_assign() {
        let mut events = EventSet::NONE;
        events |= EventSet::LINE;
        events |= EventSet::JUMP;
        assert_eq!(events.bits(), (1 << 4) | (1 << 6));
    }
}
