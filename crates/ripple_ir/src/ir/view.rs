//! View lifecycle and deterministic leader ordering.

use std::time::Instant;

use crate::ir::types::{Membership, ReplicaId, ViewId};

/// Protocol state a replica's current view can be in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewState {
    Normal,
    Changing {
        from: ViewId,
        to: ViewId,
        proposed_members: Membership,
    },
    Recovery {
        from: ViewId,
        to: ViewId,
    },
}

impl ViewState {
    pub fn label(&self) -> &'static str {
        match self {
            ViewState::Normal => "NORMAL",
            ViewState::Changing { .. } => "VIEW-CHANGING",
            ViewState::Recovery { .. } => "RECOVERY",
        }
    }
}

/// A period of stable membership and leadership. The view object is replaced
/// atomically under the engine's state lock; readers get value snapshots.
#[derive(Clone, Debug)]
pub struct View {
    pub view_id: ViewId,
    pub leader: ReplicaId,
    pub members: Membership,
    pub state: ViewState,
    pub since: Instant,
}

impl View {
    /// The view a replica boots into: id 0, configured members, no leader.
    pub fn initial(members: Membership) -> Self {
        Self {
            view_id: 0,
            leader: ReplicaId::new(),
            members,
            state: ViewState::Normal,
            since: Instant::now(),
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self.state, ViewState::Normal)
    }

    /// Move this view into VIEW-CHANGING toward `to`, proposing `proposed`
    /// as the next membership. `to` must be greater than the current id.
    pub fn begin_change(&self, to: ViewId, proposed: Membership) -> Self {
        debug_assert!(to > self.view_id, "view ids only move forward");
        Self {
            view_id: to,
            leader: ReplicaId::new(),
            members: self.members.clone(),
            state: ViewState::Changing {
                from: self.view_id,
                to,
                proposed_members: proposed,
            },
            since: Instant::now(),
        }
    }

    /// Install a NORMAL view, typically after a master record was applied.
    pub fn installed(view_id: ViewId, leader: ReplicaId, members: Membership) -> Self {
        Self {
            view_id,
            leader,
            members,
            state: ViewState::Normal,
            since: Instant::now(),
        }
    }
}

/// Deterministic, stateless leader choice: the lexicographically smallest id
/// among `self_id` and the currently reachable members. Replicas that agree
/// on reachability agree on the leader without voting.
pub fn next_leader<'a>(
    self_id: &'a str,
    reachable_members: impl IntoIterator<Item = &'a str>,
) -> &'a str {
    let mut leader = self_id;
    for candidate in reachable_members {
        if candidate < leader {
            leader = candidate;
        }
    }
    leader
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> Membership {
        Membership::new(ids.iter().map(|id| id.to_string()).collect())
    }

    #[test]
    fn initial_view_is_normal_at_zero() {
        let view = View::initial(members(&["a:1", "b:1"]));
        assert_eq!(view.view_id, 0);
        assert!(view.is_normal());
        assert!(view.leader.is_empty());
    }

    #[test]
    fn begin_change_advances_the_view_id() {
        let view = View::initial(members(&["a:1", "b:1", "c:1"]));
        let changing = view.begin_change(1, members(&["a:1", "b:1"]));
        assert_eq!(changing.view_id, 1);
        assert_eq!(changing.state.label(), "VIEW-CHANGING");
        match changing.state {
            ViewState::Changing { from, to, .. } => {
                assert_eq!(from, 0);
                assert_eq!(to, 1);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn leader_choice_is_smallest_reachable_id() {
        let reachable = ["127.0.0.1:7003", "127.0.0.1:7001"];
        assert_eq!(
            next_leader("127.0.0.1:7002", reachable.iter().copied()),
            "127.0.0.1:7001"
        );
        // Every replica that sees the same reachable set picks the same leader.
        assert_eq!(
            next_leader("127.0.0.1:7001", ["127.0.0.1:7002", "127.0.0.1:7003"]),
            "127.0.0.1:7001"
        );
        // A replica that cannot see anyone elects itself.
        assert_eq!(next_leader("127.0.0.1:7005", []), "127.0.0.1:7005");
    }
}
