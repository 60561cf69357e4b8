use std::fmt;

/// PipeWire's numeric id for a node. Ids churn when devices reconnect, so
/// they are only trusted for the tick that resolved them (or until a probe
/// against a cached one fails).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Active,
    Inactive,
}

impl DeviceStatus {
    /// Whether this status counts as "in a meeting".
    pub fn meeting_found(self) -> bool {
        matches!(self, DeviceStatus::Active)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Probing,
    Transitioning,
    Draining,
}

/// What a single tick ended up doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    DeviceNotFound,
    Unchanged,
    Transitioned {
        meeting_found: bool,
        published: bool,
        toggled: bool,
    },
}
