//! Paginated read tests
//!
//! Reads go through the same coordinator that writes, so every scenario
//! starts from indices built by real lifecycle events and then breaks
//! something underneath them.

use activity_streams::{
    Activity, ActivityId, FanoutCoordinator, Identity, InMemoryBackend, PaginatedReader,
    StreamConfig, StreamContext, StreamIndexManager, StreamType,
};
use activity_streams::reader::{apply_repairs, ReadMode, StreamCursor};
use std::sync::Arc;
use std::thread;

const DAY_MS: i64 = 24 * 3600 * 1000;
const T0: i64 = 1_709_251_200_000;

fn setup() -> (
    Arc<InMemoryBackend>,
    Arc<StreamIndexManager>,
    FanoutCoordinator<InMemoryBackend>,
    PaginatedReader<InMemoryBackend>,
) {
    let backend = Arc::new(InMemoryBackend::new());
    let manager = Arc::new(StreamIndexManager::new());
    let coordinator = FanoutCoordinator::new(manager.clone(), backend.clone(), StreamConfig::test());
    let reader = PaginatedReader::new(manager.clone(), backend.clone());
    (backend, manager, coordinator, reader)
}

fn publish(
    backend: &InMemoryBackend,
    coordinator: &FanoutCoordinator<InMemoryBackend>,
    owner: &Identity,
    poster: &Identity,
    id: &str,
    ts: i64,
) -> Activity {
    let activity = Activity {
        id: ActivityId::new(id),
        owner: owner.id.clone(),
        owner_kind: owner.kind,
        stream_owner: owner.remote_id.clone(),
        poster: poster.id.clone(),
        hidden: false,
        posted_at: ts,
        last_updated: None,
        mentioned_ids: Vec::new(),
        commenter_ids: Vec::new(),
    };
    backend.put_activity(activity.clone());
    let mut ctx = StreamContext::new(owner.clone(), activity.clone());
    coordinator.on_create_poster(&mut ctx);
    coordinator.on_create(&mut ctx);
    activity
}

fn ids(page: &[Activity]) -> Vec<&str> {
    page.iter().map(|a| a.id.as_str()).collect()
}

fn index_len(manager: &StreamIndexManager, owner: &Identity, stream: StreamType) -> usize {
    manager
        .read()
        .index(&owner.id, stream)
        .map_or(0, |index| index.len())
}

// =============================================================================
// Pagination
// =============================================================================

#[test]
fn test_pages_walk_newest_first() {
    let (backend, _manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    for i in 0..7 {
        publish(&backend, &coordinator, &alice, &alice, &format!("a{}", i), T0 + i * DAY_MS);
    }

    let first = reader.activities(&alice, StreamType::Feed, 0, 3);
    let second = reader.activities(&alice, StreamType::Feed, 3, 3);
    let third = reader.activities(&alice, StreamType::Feed, 6, 3);
    assert_eq!(ids(&first), vec!["a6", "a5", "a4"]);
    assert_eq!(ids(&second), vec!["a3", "a2", "a1"]);
    assert_eq!(ids(&third), vec!["a0"]);
    assert!(reader.activities(&alice, StreamType::Feed, 7, 3).is_empty());
}

#[test]
fn test_dangling_reference_skipped_and_removed() {
    let (backend, manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    for i in 0..5 {
        publish(&backend, &coordinator, &alice, &alice, &format!("a{}", i), T0 + i * DAY_MS);
    }
    // body deleted without the delete event
    backend.remove_activity(&ActivityId::new("a2"));

    let page = reader.activities(&alice, StreamType::Feed, 0, 4);
    assert_eq!(ids(&page), vec!["a4", "a3", "a1", "a0"]);
    assert_eq!(index_len(&manager, &alice, StreamType::Feed), 4);
    assert_eq!(reader.number_of(&alice, StreamType::Feed), 4);
    assert!(manager.check_invariants().is_ok());
}

#[test]
fn test_zero_count_reconciled_from_walk() {
    let (backend, manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    for i in 0..3 {
        publish(&backend, &coordinator, &alice, &alice, &format!("a{}", i), T0 + i * DAY_MS);
    }
    coordinator.migrate_stream_size(&alice, 0, StreamType::MyActivities);
    assert!(!reader.has_size_of(&alice, StreamType::MyActivities));

    // a partial page leaves the cache alone
    reader.activities(&alice, StreamType::MyActivities, 0, 2);
    assert_eq!(reader.number_of(&alice, StreamType::MyActivities), 0);

    reader.activities(&alice, StreamType::MyActivities, 0, 10);
    assert_eq!(reader.number_of(&alice, StreamType::MyActivities), 3);
    assert!(manager.check_invariants().is_ok());
}

// =============================================================================
// Space membership
// =============================================================================

#[test]
fn test_leaked_space_activity_cleaned_on_read() {
    let (backend, manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    let bob = backend.add_person("u2", "bob");
    let garden = backend.add_space("s1", "garden");
    backend.add_space_member("garden", &alice.remote_id);
    backend.add_space_member("garden", &bob.remote_id);

    publish(&backend, &coordinator, &garden, &alice, "g0", T0);
    publish(&backend, &coordinator, &bob, &bob, "b0", T0 + 1000);
    assert_eq!(index_len(&manager, &bob, StreamType::Feed), 2);

    // membership dropped without the leave event
    backend.remove_space_member("garden", &bob.remote_id);

    // id reads do not check membership
    let listed = reader.activity_ids(&bob, StreamType::Feed, 0, 10);
    assert_eq!(listed, vec![ActivityId::new("b0"), ActivityId::new("g0")]);

    let page = reader.activities(&bob, StreamType::Feed, 0, 10);
    assert_eq!(ids(&page), vec!["b0"]);
    assert_eq!(index_len(&manager, &bob, StreamType::Feed), 1);
    // MySpaces is not membership-checked
    assert_eq!(index_len(&manager, &bob, StreamType::MySpaces), 1);

    // still-members keep it
    assert_eq!(ids(&reader.activities(&alice, StreamType::Feed, 0, 10)), vec!["g0"]);
    assert!(manager.check_invariants().is_ok());
}

#[test]
fn test_leak_repair_dropped_after_rejoin() {
    let (backend, manager, coordinator, _reader) = setup();
    let alice = backend.add_person("u1", "alice");
    let bob = backend.add_person("u2", "bob");
    let garden = backend.add_space("s1", "garden");
    backend.add_space_member("garden", &alice.remote_id);
    backend.add_space_member("garden", &bob.remote_id);
    publish(&backend, &coordinator, &garden, &alice, "g0", T0);
    backend.remove_space_member("garden", &bob.remote_id);

    // a walk that saw bob outside the space
    let repairs = {
        let store = manager.read();
        let index = store.index(&bob.id, StreamType::Feed).unwrap();
        let mut cursor = StreamCursor::new(index, &*backend, &bob, StreamType::Feed, ReadMode::Activities);
        assert_eq!(cursor.by_ref().count(), 0);
        cursor.finish()
    };
    assert_eq!(repairs.len(), 1);

    // bob rejoins before the repair lands
    backend.add_space_member("garden", &bob.remote_id);
    coordinator.on_space_member_added(&mut StreamContext::membership(bob.clone(), garden.clone()));
    apply_repairs(&mut manager.write(), &*backend, &bob, StreamType::Feed, &repairs);

    assert_eq!(index_len(&manager, &bob, StreamType::Feed), 1);
    assert!(manager.read().has_reference(&bob.id, StreamType::Feed, &ActivityId::new("g0"), None));
    assert!(manager.check_invariants().is_ok());
}

// =============================================================================
// Duplicates and visibility
// =============================================================================

#[test]
fn test_duplicate_reference_removed() {
    let (backend, manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    let a0 = publish(&backend, &coordinator, &alice, &alice, "a0", T0);
    publish(&backend, &coordinator, &alice, &alice, "a1", T0 + DAY_MS);

    let mut updated = a0.clone();
    updated.last_updated = Some(T0 + 2 * DAY_MS);
    backend.put_activity(updated.clone());
    coordinator.on_update(&mut StreamContext::new(alice.clone(), updated).with_old_last_updated(T0));

    // a copy left behind in the old day, unknown to the reverse map
    manager
        .write()
        .index_mut(&alice.id, StreamType::Feed)
        .unwrap()
        .get_or_create(&a0, false);
    assert_eq!(index_len(&manager, &alice, StreamType::Feed), 3);
    assert!(manager.check_invariants().is_err());

    let page = reader.activities(&alice, StreamType::Feed, 0, 10);
    assert_eq!(ids(&page), vec!["a0", "a1"]);
    assert_eq!(index_len(&manager, &alice, StreamType::Feed), 2);
    assert_eq!(manager.read().locations_of(&a0.id).len(), 2);
    assert!(manager.check_invariants().is_ok());
}

#[test]
fn test_add_after_comment_keeps_single_reference() {
    let (backend, manager, coordinator, _reader) = setup();
    let alice = backend.add_person("u1", "alice");
    let bob = backend.add_person("u2", "bob");
    let carol = backend.add_person("u3", "carol");
    backend.connect(&alice.id, &bob.id);
    let a0 = publish(&backend, &coordinator, &alice, &alice, "a0", T0);

    // bob comments two days later; no update event follows
    let mut commented = a0.clone();
    commented.last_updated = Some(T0 + 2 * DAY_MS);
    commented.commenter_ids.push(bob.id.clone());
    backend.put_activity(commented.clone());
    coordinator.on_comment_update(
        &mut StreamContext::new(bob.clone(), commented.clone()).with_old_last_updated(T0),
    );

    // alice's connection carol arrives and alice likes her own post
    backend.connect(&alice.id, &carol.id);
    coordinator.on_connect(&alice, &carol);
    coordinator.on_like(&alice, &commented);

    for (who, stream) in [
        (&alice, StreamType::Feed),
        (&alice, StreamType::MyActivities),
        (&bob, StreamType::Feed),
        (&carol, StreamType::Feed),
        (&carol, StreamType::Connection),
    ] {
        assert_eq!(index_len(&manager, who, stream), 1, "{}/{}", who.remote_id, stream);
    }
    let store = manager.read();
    let alice_feed = store.index(&alice.id, StreamType::Feed).unwrap();
    assert_eq!(alice_feed.number(), 1);
    assert_eq!(alice_feed.locate(&a0.id).len(), 1);
    drop(store);
    assert!(manager.check_invariants().is_ok());
}

#[test]
fn test_hidden_activity_not_shown() {
    let (backend, manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    let mut a0 = publish(&backend, &coordinator, &alice, &alice, "a0", T0);
    publish(&backend, &coordinator, &alice, &alice, "a1", T0 + DAY_MS);

    a0.hidden = true;
    backend.put_activity(a0.clone());
    coordinator.on_visibility_change(&mut StreamContext::new(alice.clone(), a0));

    assert_eq!(ids(&reader.activities(&alice, StreamType::Feed, 0, 10)), vec!["a1"]);
    assert_eq!(reader.number_of(&alice, StreamType::Feed), 1);
    assert_eq!(index_len(&manager, &alice, StreamType::Feed), 2);
}

#[test]
fn test_viewer_sees_only_own_stream() {
    let (backend, _manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    let bob = backend.add_person("u2", "bob");
    publish(&backend, &coordinator, &alice, &alice, "mine", T0);
    // alice writes on bob's stream
    publish(&backend, &coordinator, &bob, &alice, "on-bob", T0 + 1000);

    let all = reader.activities(&alice, StreamType::MyActivities, 0, 10);
    assert_eq!(ids(&all), vec!["on-bob", "mine"]);
    let own = reader.viewer_activities(&alice, 0, 10);
    assert_eq!(ids(&own), vec!["mine"]);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_reads_alongside_writes() {
    let (backend, manager, coordinator, reader) = setup();
    let alice = backend.add_person("u1", "alice");
    let bob = backend.add_person("u2", "bob");
    backend.connect(&alice.id, &bob.id);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..50 {
                publish(&backend, &coordinator, &alice, &alice, &format!("a{}", i), T0 + i * 1000);
            }
        });
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let page = reader.activities(&bob, StreamType::Feed, 0, 20);
                    assert!(page.len() <= 20);
                    assert!(page
                        .windows(2)
                        .all(|w| w[0].effective_timestamp() >= w[1].effective_timestamp()));
                }
            });
        }
    });

    assert_eq!(reader.number_of(&bob, StreamType::Feed), 50);
    assert_eq!(reader.activities(&bob, StreamType::Connection, 0, 100).len(), 50);
    assert!(manager.check_invariants().is_ok());
}
