use chrono::Utc;
use serde_json::{json, Map};
use uuid::Uuid;

use tokenflow::resourcing::directory::{Participant, StaticDirectory};
use tokenflow::resourcing::{
    exclude_previous_performers, CompletionRecord, DistributionMetrics, DistributionStrategy, FilterSpec,
    ResourceDispatch, ResourcingContext,
};

fn directory() -> StaticDirectory {
    StaticDirectory::new()
        .with(Participant::new("alice").role("clerk").capability("finance"))
        .with(Participant::new("bob").role("clerk"))
        .with(Participant::new("carol").role("manager").capability("finance"))
        .with(Participant::new("dave").role("clerk").unavailable())
}

fn context(data: serde_json::Value) -> ResourcingContext {
    ResourcingContext {
        case_id: Uuid::new_v4(),
        work_item_id: Uuid::new_v4(),
        task_id: "review".to_string(),
        data: data.as_object().cloned().unwrap_or_else(Map::new),
    }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_find_candidates_by_role_and_availability() {
    let dir = directory();
    let clerks = dir.find_candidates(&ids(&["clerk"]), true).await.unwrap();
    assert_eq!(clerks, ids(&["alice", "bob"]));

    let everyone = dir.find_candidates(&ids(&["clerk", "manager"]), false).await.unwrap();
    assert_eq!(everyone, ids(&["alice", "bob", "carol", "dave"]));

    assert!(dir.find_candidates(&ids(&["ghost"]), true).await.unwrap().is_empty());

    dir.set_available("bob", false);
    let clerks = dir.find_candidates(&ids(&["clerk"]), true).await.unwrap();
    assert_eq!(clerks, ids(&["alice"]));
}

#[tokio::test]
async fn test_filters() {
    let dir = directory();
    let ctx = context(json!({ "owner": "bob" }));

    let capability = vec![FilterSpec {
        name: "capability".to_string(),
        params: json!({ "capability": "finance" }),
    }];
    let kept = dir
        .apply_filters(&capability, &ctx, ids(&["alice", "bob", "carol"]))
        .await
        .unwrap();
    assert_eq!(kept, ids(&["alice", "carol"]));

    let owner = vec![FilterSpec {
        name: "data_equals".to_string(),
        params: json!({ "variable": "owner" }),
    }];
    let kept = dir.apply_filters(&owner, &ctx, ids(&["alice", "bob"])).await.unwrap();
    assert_eq!(kept, ids(&["bob"]));

    let available = vec![FilterSpec {
        name: "available".to_string(),
        params: json!(null),
    }];
    let kept = dir.apply_filters(&available, &ctx, ids(&["bob", "dave"])).await.unwrap();
    assert_eq!(kept, ids(&["bob"]));

    // unknown participants never survive a filter; unknown filters are ignored
    let unknown = vec![FilterSpec {
        name: "mystery".to_string(),
        params: json!(null),
    }];
    let kept = dir.apply_filters(&unknown, &ctx, ids(&["bob", "zed"])).await.unwrap();
    assert_eq!(kept, ids(&["bob"]));

    let untouched = dir.apply_filters(&[], &ctx, ids(&["zed"])).await.unwrap();
    assert_eq!(untouched, ids(&["zed"]));
}

#[tokio::test]
async fn test_four_eyes_excludes_previous_performers() {
    let case_id = Uuid::new_v4();
    let history = vec![CompletionRecord {
        task_id: "submit".to_string(),
        work_item_id: Uuid::new_v4(),
        participant: "alice".to_string(),
        completed_at: Utc::now(),
    }];

    let dir = directory();
    let kept = dir
        .apply_four_eyes(ids(&["alice", "bob"]), case_id, &ids(&["submit"]), &history)
        .await
        .unwrap();
    assert_eq!(kept, ids(&["bob"]));

    // other tasks are not affected
    let kept = exclude_previous_performers(ids(&["alice", "bob"]), &ids(&["approve"]), &history);
    assert_eq!(kept, ids(&["alice", "bob"]));
}

#[tokio::test]
async fn test_distribution_strategies() {
    let dir = directory();
    let ctx = context(json!({}));
    let metrics = DistributionMetrics::default();
    let candidates = ids(&["alice", "bob"]);

    let all = dir
        .apply_distribution(candidates.clone(), DistributionStrategy::All, "review", &ctx, &metrics)
        .await
        .unwrap();
    assert_eq!(all, candidates);

    let first = dir
        .apply_distribution(candidates.clone(), DistributionStrategy::First, "review", &ctx, &metrics)
        .await
        .unwrap();
    assert_eq!(first, ids(&["alice"]));

    let random = dir
        .apply_distribution(candidates.clone(), DistributionStrategy::Random, "review", &ctx, &metrics)
        .await
        .unwrap();
    assert_eq!(random.len(), 1);
    assert!(candidates.contains(&random[0]));

    let mut picks = Vec::new();
    for _ in 0..3 {
        let pick = dir
            .apply_distribution(candidates.clone(), DistributionStrategy::RoundRobin, "review", &ctx, &metrics)
            .await
            .unwrap();
        picks.push(pick[0].clone());
    }
    assert_eq!(picks, ids(&["alice", "bob", "alice"]));

    let mut busy = DistributionMetrics::default();
    busy.queue_lengths.insert("alice".to_string(), 3);
    busy.queue_lengths.insert("bob".to_string(), 1);
    let shortest = dir
        .apply_distribution(candidates.clone(), DistributionStrategy::ShortestQueue, "review", &ctx, &busy)
        .await
        .unwrap();
    assert_eq!(shortest, ids(&["bob"]));

    let none = dir
        .apply_distribution(Vec::new(), DistributionStrategy::First, "review", &ctx, &metrics)
        .await
        .unwrap();
    assert!(none.is_empty());
}
