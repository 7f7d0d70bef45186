//! Container state types.
//!
//! This module defines the identifiers and lifecycle state shared by
//! the engine and its collaborators:
//! - `ContainerId`: tree-structured container identifier
//! - `LifecycleState`: the lifecycle state machine's states
//! - `ContainerTermination`: the record handed to `wait` observers
//! - `ContainerLimitation`: an isolator-originated kill signal

use serde::{Deserialize, Serialize};

// =============================================================================
// Container ID
// =============================================================================

/// Identifier for a container.
///
/// Identifiers form a tree: a nested container's id carries its
/// parent's id. Equality and hashing are structural, so the same
/// `(name, ancestry)` pair always names the same container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    name: String,
    parent: Option<Box<ContainerId>>,
}

impl ContainerId {
    /// Creates a root container id.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    /// Creates a nested container id under `parent`.
    #[must_use]
    pub fn nested(parent: &ContainerId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(Box::new(parent.clone())),
        }
    }

    /// Returns the final path segment of this id.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if this id has a parent.
    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns the parent id, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&ContainerId> {
        self.parent.as_deref()
    }

    /// Returns the root of this id's tree, obtained by walking parents.
    #[must_use]
    pub fn root_id(&self) -> &ContainerId {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Returns the chain of ids from the root down to (and including)
    /// this id.
    #[must_use]
    pub fn ancestry(&self) -> Vec<&ContainerId> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(id) = current {
            chain.push(id);
            current = id.parent();
        }
        chain.reverse();
        chain
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{parent}.{}", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

// =============================================================================
// Lifecycle State
// =============================================================================

/// Lifecycle state of a container.
///
/// States advance monotonically:
///
/// ```text
/// Provisioning ──▶ Preparing ──▶ Isolating ──▶ Fetching ──▶ Running
///       │              │             │             │           │
///       └──────────────┴─────────────┴─────────────┴───────────┴──▶ Destroying
/// ```
///
/// `Destroying` is terminal; the container is removed from the registry
/// once its termination settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Root filesystem image is being provisioned.
    Provisioning,
    /// Isolators are running `prepare` serially.
    Preparing,
    /// Init forked; isolators are running `isolate` in parallel.
    Isolating,
    /// Task assets are being fetched into the sandbox.
    Fetching,
    /// Init has been signalled to exec; the container is live.
    Running,
    /// Teardown is in progress.
    Destroying,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Preparing => write!(f, "preparing"),
            Self::Isolating => write!(f, "isolating"),
            Self::Fetching => write!(f, "fetching"),
            Self::Running => write!(f, "running"),
            Self::Destroying => write!(f, "destroying"),
        }
    }
}

// =============================================================================
// Limitations
// =============================================================================

/// Reason attached to a resource limitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitationReason {
    /// Memory limit breached.
    MemLimit,
    /// CPU limit breached.
    CpuLimit,
    /// Disk limit breached.
    DiskLimit,
}

/// A resource-policy breach reported by an isolator.
///
/// Resolution of an isolator's `watch` with one of these initiates the
/// container's destruction; the record is folded into the termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLimitation {
    /// The resource that was breached (e.g. "mem", "cpus").
    pub resource: Option<String>,
    /// Human-readable description of the breach.
    pub message: String,
    /// Machine-readable reason, if known.
    pub reason: Option<LimitationReason>,
}

// =============================================================================
// Termination
// =============================================================================

/// Task state reported in a termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// The task finished on its own.
    TaskFinished,
    /// The task failed (e.g. killed by a limitation).
    TaskFailed,
    /// The task was killed on request.
    TaskKilled,
}

/// Final record of a destroyed container.
///
/// Returned to every `wait` observer and, for nested containers,
/// checkpointed into the runtime directory so late waiters still get an
/// answer after the container is gone from the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTermination {
    /// Raw wait status of the container init, if it was reaped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    /// Task state override; set to `TaskFailed` when limitations were
    /// recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    /// Concatenated limitation messages, joined by `"; "`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reasons gathered from limitations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<LimitationReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_root_walks_parents() {
        let a = ContainerId::root("a");
        let b = ContainerId::nested(&a, "b");
        let c = ContainerId::nested(&b, "c");

        assert!(!a.has_parent());
        assert!(c.has_parent());
        assert_eq!(c.parent(), Some(&b));
        assert_eq!(c.root_id(), &a);
        assert_eq!(c.to_string(), "a.b.c");
    }

    #[test]
    fn id_equality_is_structural() {
        let a1 = ContainerId::nested(&ContainerId::root("a"), "b");
        let a2 = ContainerId::nested(&ContainerId::root("a"), "b");
        assert_eq!(a1, a2);
    }

    #[test]
    fn ancestry_is_root_first() {
        let a = ContainerId::root("a");
        let b = ContainerId::nested(&a, "b");
        let names: Vec<_> = b.ancestry().iter().map(|id| id.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn termination_round_trips_through_json() {
        let termination = ContainerTermination {
            status: Some(0),
            state: Some(TaskState::TaskFailed),
            message: Some("mem oom".to_string()),
            reasons: vec![LimitationReason::MemLimit],
        };

        let json = serde_json::to_string(&termination).unwrap();
        let back: ContainerTermination = serde_json::from_str(&json).unwrap();
        assert_eq!(back, termination);
    }
}
