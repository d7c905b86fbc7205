//! Fan-out Deterministic Simulation Tests
//!
//! VOPR-style runs of the coordinator and reader against random lifecycle
//! event sequences. Each seed checks the index invariants after every
//! operation.

use activity_streams::dst::{run_fanout_batch, summarize_batch, FanoutDSTConfig, FanoutDSTHarness};

// =============================================================================
// Standard Configuration Tests - 50 Seeds
// =============================================================================

#[test]
fn test_fanout_dst_50_seeds_standard() {
    let results = run_fanout_batch(0, 50, 300, FanoutDSTConfig::new);
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All 50 seeds should pass with standard config");
}

#[test]
fn test_fanout_dst_50_seeds_crowded() {
    // Tight threshold and frequent graph churn
    let results = run_fanout_batch(1000, 50, 300, FanoutDSTConfig::crowded);
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All 50 seeds should pass with crowded config");
}

#[test]
fn test_fanout_dst_20_seeds_sprawling() {
    // Slow clock: most updates refresh references within the same day
    let results = run_fanout_batch(2000, 20, 300, FanoutDSTConfig::sprawling);
    let summary = summarize_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 20, "All 20 seeds should pass with sprawling config");
}

// =============================================================================
// Stress Tests - High Operation Count
// =============================================================================

#[test]
fn test_fanout_dst_stress_2000_ops() {
    let mut harness = FanoutDSTHarness::with_seed(42);
    harness.run(2000);
    let result = harness.result();
    println!("Stress 2000 ops: {}", result.summary());
    assert!(result.is_success(), "2000 ops should maintain invariants");
    assert!(result.deletes > 0 && result.reads > 0);
}

#[test]
fn test_fanout_dst_comments_without_update_events() {
    // comment events that arrive alone leave older references behind for
    // later likes, connects and joins to run into
    for seed in [7u64, 11, 4242] {
        let mut harness = FanoutDSTHarness::new(FanoutDSTConfig::crowded(seed));
        harness.run(1500);
        let result = harness.result();
        assert!(result.is_success(), "seed {}: {}", seed, result.summary());
        assert!(result.comments > 0);
    }
}

#[test]
fn test_fanout_dst_stress_crowded_1000_ops() {
    let config = FanoutDSTConfig::crowded(99999);
    let mut harness = FanoutDSTHarness::new(config);
    harness.run(1000);
    let result = harness.result();
    println!(
        "Stress crowded 1000 ops: {} (relationship changes: {}, orphans: {})",
        result.summary(),
        result.relationship_changes,
        result.orphans
    );
    assert!(result.is_success(), "Crowded 1000 ops should maintain invariants");
    assert!(harness.backend().commits() > 0);
}

// =============================================================================
// Determinism
// =============================================================================

#[test]
fn test_fanout_dst_same_seed_same_outcome() {
    let run = |seed| {
        let mut harness = FanoutDSTHarness::new(FanoutDSTConfig::crowded(seed));
        harness.run(400);
        (harness.result().summary(), harness.stats(), harness.backend().commits())
    };
    assert_eq!(run(777), run(777));
}
