mod helpers;

use helpers::{remember, test_manager};
use mnemon::memory::manager::AmendParams;
use mnemon::memory::types::FragmentType;

#[test]
fn identical_remember_returns_same_id_without_new_row() {
    let m = test_manager();

    let first = m
        .remember(remember("Node 20 is required.", "stack", FragmentType::Fact))
        .unwrap();
    let second = m
        .remember(remember("Node 20 is required.", "stack", FragmentType::Fact))
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.id, second.id);
    assert_eq!(m.stats().unwrap().total_fragments, 1);
}

#[test]
fn dedup_hit_raises_importance_to_the_greater_value() {
    let m = test_manager();

    let mut low = remember("shared observation", "t", FragmentType::Fact);
    low.importance = Some(0.4);
    let first = m.remember(low).unwrap();

    let mut high = remember("shared observation", "t", FragmentType::Fact);
    high.importance = Some(0.75);
    m.remember(high).unwrap();

    let mut params = helpers::recall_keywords(&["shared", "observation"]);
    params.min_importance = Some(0.7);
    let result = m.recall(params).unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.fragments[0].fragment.id, first.id.unwrap());
    assert!((result.fragments[0].fragment.importance - 0.75).abs() < 1e-9);
}

#[test]
fn redaction_makes_differing_originals_collide() {
    let m = test_manager();

    // Different emails redact to the same content, so the hashes match
    let first = m
        .remember(remember("owner is alice@example.com", "people", FragmentType::Fact))
        .unwrap();
    let second = m
        .remember(remember("owner is bob@example.org", "people", FragmentType::Fact))
        .unwrap();

    assert!(!second.created);
    assert_eq!(first.id, second.id);
}

#[test]
fn amend_collision_merges_without_mutation() {
    let m = test_manager();

    let a = m
        .remember(remember("Node 20 is required.", "stack", FragmentType::Fact))
        .unwrap()
        .id
        .unwrap();
    // Re-storing the identical content dedups back to A
    let again = m
        .remember(remember("Node 20 is required.", "stack", FragmentType::Fact))
        .unwrap();
    assert_eq!(again.id.as_deref(), Some(a.as_str()));

    let b = m
        .remember(remember("Use Node 22 instead.", "stack", FragmentType::Fact))
        .unwrap()
        .id
        .unwrap();

    let outcome = m
        .amend(AmendParams {
            id: a.clone(),
            content: Some("Use Node 22 instead.".into()),
            topic: None,
            keywords: None,
            fragment_type: None,
            importance: None,
            is_anchor: None,
            supersedes: None,
            agent_id: None,
        })
        .unwrap();

    assert!(!outcome.updated);
    assert!(outcome.merged);
    assert_eq!(outcome.existing_id, Some(b));

    // A keeps its content and gains no version row
    let recall = m.recall(helpers::recall_keywords(&["node"])).unwrap();
    let a_row = recall
        .fragments
        .iter()
        .find(|f| f.fragment.id == a)
        .expect("fragment A still present");
    assert_eq!(a_row.fragment.content, "Node 20 is required.");
    assert_eq!(m.stats().unwrap().versions, 0);
}
