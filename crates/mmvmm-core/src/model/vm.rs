use super::{Hardware, HardwareDescription};
use serde::{Deserialize, Serialize};

/// Status state machine from spec.md §3. Exactly one transition at a time,
/// driven by the owning supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    New,
    Configuring,
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl Status {
    /// Allowed transitions, enforced by the supervisor (spec.md §3, testable
    /// property 6). Kept here rather than inline in the supervisor so the
    /// rule can be unit tested in isolation.
    /// Whether a VM in this status still owns live resources (QEMU child,
    /// QMP monitor, TAPs) that a shutdown drain must wait out before the
    /// supervisor's event loop can be safely stopped (spec.md §4.5 "Close"
    /// step 2: "Status ∉ {STOPPED, NEW}"). `Starting` counts: QEMU may
    /// already be spawned and mid QMP-handshake even though the VM never
    /// reached `Running`.
    pub fn needs_drain(self) -> bool {
        !matches!(self, Status::New | Status::Stopped)
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (New, Stopped)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
                // Configuring is reserved for hot-modify operations that hold
                // the status row mid-update; transitions back to Stopped.
                | (Stopped, Configuring)
                | (Configuring, Stopped)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::New => "NEW",
            Status::Configuring => "CONFIGURING",
            Status::Stopped => "STOPPED",
            Status::Starting => "STARTING",
            Status::Running => "RUNNING",
            Status::Stopping => "STOPPING",
        };
        write!(f, "{s}")
    }
}

/// In-memory view of a VM row plus its owned Hardware, as read from the
/// persistent store adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: i64,
    pub name: String,
    pub status: Status,
    pub since: i64,
    pub pid: Option<i32>,
    pub autostart: bool,
    pub hardware: Hardware,
}

/// Client-submitted description of a new or updated VM (spec.md §6 `new`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescription {
    pub name: String,
    pub hardware: HardwareDescription,
    #[serde(default)]
    pub autostart: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions_match_spec() {
        assert!(Status::New.can_transition_to(Status::Stopped));
        assert!(Status::Stopped.can_transition_to(Status::Starting));
        assert!(Status::Starting.can_transition_to(Status::Running));
        assert!(Status::Starting.can_transition_to(Status::Stopped));
        assert!(Status::Running.can_transition_to(Status::Stopping));
        assert!(Status::Stopping.can_transition_to(Status::Stopped));
        assert!(Status::Running.can_transition_to(Status::Stopped));
    }

    #[test]
    fn disallowed_transitions_rejected() {
        assert!(!Status::New.can_transition_to(Status::Running));
        assert!(!Status::Running.can_transition_to(Status::Starting));
        assert!(!Status::Stopped.can_transition_to(Status::Running));
        assert!(!Status::Stopping.can_transition_to(Status::Running));
    }

    #[test]
    fn display_matches_spec_enum_names() {
        assert_eq!(Status::New.to_string(), "NEW");
        assert_eq!(Status::Running.to_string(), "RUNNING");
    }

    #[test]
    fn needs_drain_covers_every_status_but_new_and_stopped() {
        assert!(!Status::New.needs_drain());
        assert!(!Status::Stopped.needs_drain());
        assert!(Status::Starting.needs_drain());
        assert!(Status::Running.needs_drain());
        assert!(Status::Stopping.needs_drain());
        assert!(Status::Configuring.needs_drain());
    }
}
