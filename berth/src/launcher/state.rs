//! Container lifecycle status and state machine.
//!
//! ```text
//! Created → Starting → Running → Stopping → Exited
//!              │                     ↑
//!              └──── (startup fail) ─┴──→ Exited
//! ```
//!
//! Containers are never persisted, so the status lives in memory only.

use std::sync::Arc;

use berth_shared::errors::{BerthError, BerthResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Id allocated, nothing on disk yet.
    Created,
    /// Rootfs, entry point and lifespan startup in progress.
    Starting,
    /// Listener bound and accepting connections.
    Running,
    /// Listener closed, draining connections.
    Stopping,
    Exited,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Exited)
    }

    pub fn can_transition_to(&self, target: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, target),
            (Created, Starting)
                | (Created, Exited)
                | (Starting, Running)
                | (Starting, Exited)
                | (Running, Stopping)
                | (Stopping, Exited)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Starting => "starting",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopping => "stopping",
            ContainerStatus::Exited => "exited",
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ContainerStatus::Created),
            "starting" => Ok(ContainerStatus::Starting),
            "running" => Ok(ContainerStatus::Running),
            "stopping" => Ok(ContainerStatus::Stopping),
            "exited" => Ok(ContainerStatus::Exited),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, validated status of one container.
#[derive(Debug, Clone)]
pub struct StatusCell {
    container_id: Arc<str>,
    status: Arc<Mutex<ContainerStatus>>,
}

impl StatusCell {
    pub fn new(container_id: &str) -> Self {
        Self {
            container_id: Arc::from(container_id),
            status: Arc::new(Mutex::new(ContainerStatus::Created)),
        }
    }

    pub fn get(&self) -> ContainerStatus {
        *self.status.lock()
    }

    /// Move to `target`, rejecting transitions the state machine forbids.
    pub fn transition(&self, target: ContainerStatus) -> BerthResult<()> {
        let mut status = self.status.lock();
        if !status.can_transition_to(target) {
            return Err(BerthError::InvalidState(format!(
                "container {} cannot go from {} to {}",
                self.container_id, *status, target
            )));
        }
        tracing::debug!(container_id = %self.container_id, from = %*status, to = %target, "Container status changed");
        *status = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let cell = StatusCell::new("c1");
        for next in [
            ContainerStatus::Starting,
            ContainerStatus::Running,
            ContainerStatus::Stopping,
            ContainerStatus::Exited,
        ] {
            cell.transition(next).unwrap();
        }
        assert!(cell.get().is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let cell = StatusCell::new("c1");
        assert!(cell.transition(ContainerStatus::Running).is_err());
        cell.transition(ContainerStatus::Starting).unwrap();
        cell.transition(ContainerStatus::Exited).unwrap();
        assert!(cell.transition(ContainerStatus::Starting).is_err());
        assert_eq!(cell.get(), ContainerStatus::Exited);
    }

    #[test]
    fn test_status_strings() {
        for status in [ContainerStatus::Created, ContainerStatus::Stopping] {
            assert_eq!(status.as_str().parse::<ContainerStatus>(), Ok(status));
        }
        assert!("paused".parse::<ContainerStatus>().is_err());
    }
}
