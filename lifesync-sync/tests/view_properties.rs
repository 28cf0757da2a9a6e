//! Property-based tests for the local view.
//!
//! Whatever order events, confirmations and rollbacks arrive in:
//! - Ids stay unique
//! - Inserts and deletes are idempotent
//! - A write confirmation and its own echo converge to the same view
//! - Rolling back an optimistic change restores the prior view exactly

use lifesync_model::Record;
use lifesync_sync::{LocalView, ViewOrder};
use lifesync_types::{ChangeEvent, EntityId};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn id_strategy() -> impl Strategy<Value = String> {
    (0u8..6).prop_map(|n| n.to_string())
}

fn record_strategy() -> impl Strategy<Value = Record> {
    (id_strategy(), 0i64..100).prop_map(|(id, v)| Record::new(id, json!({ "v": v })))
}

fn event_strategy() -> impl Strategy<Value = ChangeEvent<Record>> {
    prop_oneof![
        record_strategy().prop_map(ChangeEvent::Inserted),
        record_strategy().prop_map(ChangeEvent::Updated),
        id_strategy().prop_map(|id| ChangeEvent::Deleted(EntityId::from(id))),
    ]
}

fn order_strategy() -> impl Strategy<Value = ViewOrder<Record>> {
    prop_oneof![
        Just(ViewOrder::Arrival),
        Just(ViewOrder::NewestFirst),
        Just(ViewOrder::by_key(|r: &Record| r.get("v").and_then(|v| v.as_i64()))),
    ]
}

fn view_with(order: ViewOrder<Record>, baseline: Vec<Record>) -> LocalView<Record> {
    let mut view = LocalView::new(order);
    view.replace_all(baseline);
    view
}

proptest! {
    /// No sequence of events can produce two entities with the same id.
    #[test]
    fn ids_stay_unique(
        order in order_strategy(),
        baseline in prop::collection::vec(record_strategy(), 0..8),
        events in prop::collection::vec(event_strategy(), 0..32),
    ) {
        let mut view = view_with(order, baseline);
        for event in events {
            view.apply(event);
        }
        let ids = view.ids();
        let unique: HashSet<_> = ids.iter().collect();
        prop_assert_eq!(unique.len(), ids.len());
    }

    /// Applying an insert twice is the same as applying it once.
    #[test]
    fn insert_is_idempotent(
        baseline in prop::collection::vec(record_strategy(), 0..8),
        record in record_strategy(),
    ) {
        let mut once = view_with(ViewOrder::Arrival, baseline.clone());
        once.apply(ChangeEvent::Inserted(record.clone()));

        let mut twice = view_with(ViewOrder::Arrival, baseline);
        twice.apply(ChangeEvent::Inserted(record.clone()));
        twice.apply(ChangeEvent::Inserted(record));

        prop_assert_eq!(once.as_slice(), twice.as_slice());
    }

    /// Deleting twice is the same as deleting once, and the id stays gone.
    #[test]
    fn delete_is_idempotent(
        baseline in prop::collection::vec(record_strategy(), 0..8),
        id in id_strategy(),
        late in record_strategy(),
    ) {
        let id = EntityId::from(id);
        let mut once = view_with(ViewOrder::Arrival, baseline.clone());
        once.apply(ChangeEvent::Deleted(id.clone()));

        let mut twice = view_with(ViewOrder::Arrival, baseline);
        twice.apply(ChangeEvent::Deleted(id.clone()));
        twice.apply(ChangeEvent::Deleted(id.clone()));

        prop_assert_eq!(once.as_slice(), twice.as_slice());

        let late = Record::new(id.clone(), serde_json::Value::Object(late.data));
        twice.apply(ChangeEvent::Inserted(late));
        prop_assert!(!twice.contains(&id));
    }

    /// The write confirmation and the insert echo for the same row converge
    /// whichever arrives first.
    #[test]
    fn confirmation_and_echo_converge(
        order in order_strategy(),
        baseline in prop::collection::vec(record_strategy(), 0..8),
        v in 0i64..100,
    ) {
        let provisional = Record::new(EntityId::temporary(), json!({ "v": v }));
        let confirmed = Record::new("confirmed", json!({ "v": v }));

        let mut echo_first = view_with(order.clone(), baseline.clone());
        echo_first.insert(provisional.clone());
        echo_first.apply(ChangeEvent::Inserted(confirmed.clone()));
        echo_first.confirm(&provisional.id, confirmed.clone());

        let mut confirm_first = view_with(order, baseline);
        confirm_first.insert(provisional.clone());
        confirm_first.confirm(&provisional.id, confirmed.clone());
        confirm_first.apply(ChangeEvent::Inserted(confirmed.clone()));

        prop_assert_eq!(echo_first.as_slice(), confirm_first.as_slice());
        prop_assert_eq!(
            echo_first.iter().filter(|r| r.id == confirmed.id).count(),
            1
        );
        prop_assert!(!echo_first.contains(&provisional.id));
    }

    /// Optimistic insert followed by rollback restores the view.
    #[test]
    fn insert_rollback_restores(
        order in order_strategy(),
        baseline in prop::collection::vec(record_strategy(), 0..8),
        v in 0i64..100,
    ) {
        let mut view = view_with(order, baseline);
        let before = view.to_vec();

        let provisional = Record::new(EntityId::temporary(), json!({ "v": v }));
        view.insert(provisional.clone());
        view.discard(&provisional.id);

        prop_assert_eq!(view.to_vec(), before);
    }

    /// Optimistic update followed by rollback restores the view.
    #[test]
    fn update_rollback_restores(
        baseline in prop::collection::vec(record_strategy(), 1..8),
        pick in any::<prop::sample::Index>(),
        v in 0i64..100,
    ) {
        let mut view = view_with(ViewOrder::Arrival, baseline);
        let before = view.to_vec();

        let target = before[pick.index(before.len())].id.clone();
        let previous = view.replace(Record::new(target, json!({ "v": v }))).unwrap();
        view.replace(previous);

        prop_assert_eq!(view.to_vec(), before);
    }

    /// Optimistic delete followed by rollback restores the view and lifts the
    /// tombstone.
    #[test]
    fn delete_rollback_restores(
        order in order_strategy(),
        baseline in prop::collection::vec(record_strategy(), 1..8),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut view = view_with(order, baseline);
        let before = view.to_vec();

        let target = before[pick.index(before.len())].id.clone();
        let (position, removed) = view.remove(&target).unwrap();
        view.restore(position, removed);

        prop_assert_eq!(view.to_vec(), before);
        prop_assert!(!view.is_tombstoned(&target));
    }

    /// A remote delete seen while a local delete is pending survives the
    /// local rollback.
    #[test]
    fn remote_delete_outlives_rollback(
        order in order_strategy(),
        baseline in prop::collection::vec(record_strategy(), 1..8),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut view = view_with(order, baseline);
        let before = view.to_vec();

        let target = before[pick.index(before.len())].id.clone();
        let (position, removed) = view.remove(&target).unwrap();
        view.apply(ChangeEvent::Deleted(target.clone()));
        prop_assert!(!view.restore(position, removed));

        prop_assert!(!view.contains(&target));
        prop_assert_eq!(view.len(), before.len() - 1);
    }
}
