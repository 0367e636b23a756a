//! Property tests for the version/tombstone resolver.

use proptest::prelude::*;
use tidesync_protocol::{resolve, SyncAction, VersionState, DEFAULT_UNDELETE_DELTA};

const DELTA: u64 = DEFAULT_UNDELETE_DELTA;

proptest! {
    #[test]
    fn equal_live_states_skip(v in any::<u64>()) {
        prop_assert_eq!(resolve(v, false, v, false, DELTA), SyncAction::Skip);
    }

    #[test]
    fn resolve_is_deterministic(
        lv in any::<u64>(), ld in any::<bool>(),
        rv in any::<u64>(), rd in any::<bool>(),
        delta in 1u64..5000,
    ) {
        prop_assert_eq!(resolve(lv, ld, rv, rd, delta), resolve(lv, ld, rv, rd, delta));
    }

    #[test]
    fn tombstone_is_never_pulled_or_pushed_below_delta(
        rv in 0u64..(u64::MAX / 2),
        offset in 0u64..DELTA,
        below in any::<bool>(),
    ) {
        // Any local version strictly below rv + delta.
        let lv = if below { rv.saturating_sub(offset) } else { rv + offset };
        prop_assume!(lv < rv + DELTA);
        prop_assert_eq!(resolve(lv, false, rv, true, DELTA), SyncAction::AdoptTombstone);
    }

    #[test]
    fn undelete_boundary(rv in 0u64..(u64::MAX / 2)) {
        prop_assert_eq!(resolve(rv + DELTA, false, rv, true, DELTA), SyncAction::Push);
        prop_assert_eq!(resolve(rv + DELTA - 1, false, rv, true, DELTA), SyncAction::AdoptTombstone);
    }

    #[test]
    fn local_tombstone_always_pushes_against_live_remote(
        lv in any::<u64>(), rv in any::<u64>(),
    ) {
        prop_assert_eq!(resolve(lv, true, rv, false, DELTA), SyncAction::Push);
    }

    #[test]
    fn same_deletion_state_is_antisymmetric(
        a in any::<u64>(), b in any::<u64>(), deleted in any::<bool>(),
    ) {
        let forward = resolve(a, deleted, b, deleted, DELTA);
        let backward = resolve(b, deleted, a, deleted, DELTA);
        let flipped = match forward {
            SyncAction::Pull => SyncAction::Push,
            SyncAction::Push => SyncAction::Pull,
            other => other,
        };
        prop_assert_eq!(backward, flipped);
    }
}

#[test]
fn concurrent_writers_converge_on_tombstone() {
    // Device A deletes at v6, device B edits to v9 without seeing the delete.
    let remote = VersionState::new(6, true);
    let local = VersionState::new(9, false);
    assert_eq!(local.resolve_against(&remote, DELTA), SyncAction::AdoptTombstone);
}
