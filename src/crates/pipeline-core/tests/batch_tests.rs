//! Batch splitting, ordering, failure handling and nesting

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{
    build_graph, extract_field, BatchConfig, BatchCoordinator, BatchSlot, BatchUnit, ContentItem,
    ExecutionContext, FnUnit, Graph, PipelineError, RuntimeConfig, UnitError, UnitRef,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio::time::sleep;

fn number(item: &ContentItem, field: &str) -> i64 {
    item.get(field).and_then(Value::as_i64).unwrap_or_default()
}

/// Sleeps `ms` from the item, then doubles `value`; negative values fail
fn doubler() -> Graph {
    let unit = UnitRef::new(
        "double",
        FnUnit::new("double", |item: ContentItem, ctx| async move {
            let wait = Duration::from_millis(number(&item, "ms") as u64);
            tokio::select! {
                _ = sleep(wait) => {}
                _ = ctx.cancellation().cancelled() => return Err(UnitError::permanent("interrupted")),
            }
            let value = number(&item, "value");
            if value < 0 {
                return Err(UnitError::permanent(format!("negative value {value}")));
            }
            Ok(vec![item.with_field("value", json!(value * 2))])
        }),
    );
    build_graph("double", vec![unit], vec![], "double").unwrap()
}

fn parent(elements: Vec<Value>) -> ContentItem {
    ContentItem::from_value(json!({"id": "parent", "items": elements}))
}

fn doubled(result: &pipeline_core::BatchResult) -> Vec<i64> {
    result.outputs().iter().map(|o| number(o, "value")).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn results_keep_input_order(size in 0usize..16, limit in 1usize..6) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        // later items finish first
        let elements: Vec<Value> = (0..size)
            .map(|i| json!({"value": i, "ms": (size - i) * 7}))
            .collect();
        let coordinator = BatchCoordinator::new(doubler(), extract_field("items"))
            .with_config(BatchConfig::default().with_max_concurrent(limit));

        let result = runtime
            .block_on(coordinator.run(&parent(elements), &ExecutionContext::new(RuntimeConfig::default())))
            .unwrap();

        let expected: Vec<i64> = (0..size as i64).map(|i| i * 2).collect();
        prop_assert_eq!(doubled(&result), expected);
        prop_assert_eq!(result.total, size);
        prop_assert_eq!(result.succeeded, size);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_items_keep_their_positions() {
    let elements: Vec<Value> = (0..10)
        .map(|i| {
            let value = if i == 3 || i == 7 { -1 } else { i };
            json!({"value": value, "ms": 10 - i})
        })
        .collect();
    let coordinator = BatchCoordinator::new(doubler(), extract_field("items"))
        .with_config(BatchConfig::default().with_max_concurrent(3).continue_on_error(true));

    let result = coordinator
        .run(&parent(elements), &ExecutionContext::new(RuntimeConfig::default()))
        .await
        .unwrap();

    assert_eq!((result.succeeded, result.failed, result.total), (8, 2, 10));
    for (index, slot) in result.slots.iter().enumerate() {
        assert_eq!(slot.is_failed(), index == 3 || index == 7, "slot {index}");
    }
    assert_eq!(doubled(&result), vec![0, 2, 4, 8, 10, 12, 16, 18]);
    match &result.slots[3] {
        BatchSlot::Failed { error } => assert!(error.contains("negative value -1")),
        other => panic!("unexpected slot {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn first_failure_aborts_the_batch() {
    let elements: Vec<Value> = (0..6)
        .map(|i| json!({"value": if i == 1 { -5 } else { i }, "ms": 20 * i}))
        .collect();
    let coordinator = BatchCoordinator::new(doubler(), extract_field("items"))
        .with_config(BatchConfig::default().with_max_concurrent(2));

    let err = coordinator
        .run(&parent(elements), &ExecutionContext::new(RuntimeConfig::default()))
        .await
        .unwrap_err();

    match err {
        PipelineError::BatchItemFailure { index, cause } => {
            assert_eq!(index, 1);
            assert!(cause.to_string().contains("negative value -5"));
        }
        other => panic!("expected a batch item failure, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn slow_item_times_out_alone() {
    let elements = vec![
        json!({"value": 1, "ms": 10}),
        json!({"value": 2, "ms": 60_000}),
        json!({"value": 3, "ms": 10}),
    ];
    let coordinator = BatchCoordinator::new(doubler(), extract_field("items")).with_config(
        BatchConfig::default()
            .with_item_timeout(Duration::from_millis(100))
            .continue_on_error(true),
    );

    let result = coordinator
        .run(&parent(elements), &ExecutionContext::new(RuntimeConfig::default()))
        .await
        .unwrap();

    assert_eq!((result.succeeded, result.failed), (2, 1));
    assert_eq!(doubled(&result), vec![2, 6]);
    match &result.slots[1] {
        BatchSlot::Failed { error } => assert!(error.contains("timed out after 100ms")),
        other => panic!("unexpected slot {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn capped_unit_stays_capped_across_items() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current, highest) = (in_flight.clone(), peak.clone());
    let unit = UnitRef::new(
        "call_api",
        FnUnit::new("call_api", move |item: ContentItem, _ctx| {
            let current = current.clone();
            let highest = highest.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                highest.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(vec![item])
            }
        }),
    )
    .with_max_concurrency(2);
    let graph = build_graph("api", vec![unit], vec![], "call_api").unwrap();
    let elements: Vec<Value> = (0..6).map(|i| json!({"value": i})).collect();
    let coordinator = BatchCoordinator::new(graph, extract_field("items"))
        .with_config(BatchConfig::default().with_max_concurrent(6));

    let result = coordinator
        .run(&parent(elements), &ExecutionContext::new(RuntimeConfig::default()))
        .await
        .unwrap();

    assert_eq!(result.succeeded, 6);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn batches_nest() {
    let inner = BatchCoordinator::new(doubler(), extract_field("members"))
        .with_config(BatchConfig::default().with_max_concurrent(2));
    let per_group = build_graph(
        "per_group",
        vec![UnitRef::new("members", BatchUnit::new(inner).with_output_field("doubled"))],
        vec![],
        "members",
    )
    .unwrap();
    let outer = BatchCoordinator::new(per_group, extract_field("groups"))
        .with_config(BatchConfig::default().with_max_concurrent(2));

    let root = ContentItem::from_value(json!({
        "groups": [
            {"name": "a", "members": [{"value": 1, "ms": 30}, {"value": 2, "ms": 5}]},
            {"name": "b", "members": [{"value": 10, "ms": 1}]},
        ]
    }));
    let result = outer
        .run(&root, &ExecutionContext::new(RuntimeConfig::default()))
        .await
        .unwrap();

    let groups = result.outputs();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].get("name"), Some(&json!("a")));
    assert_eq!(groups[0].get("batch_summary"), Some(&json!({"succeeded": 2, "failed": 0, "total": 2})));
    let values: Vec<i64> = groups[0]
        .get("doubled")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .map(|slot| slot["outputs"][0]["value"].as_i64().unwrap())
        .collect();
    assert_eq!(values, vec![2, 4]);
    assert_eq!(groups[1].get("doubled").unwrap()[0]["outputs"][0]["value"], json!(20));
}

#[tokio::test]
async fn nesting_depth_is_enforced() {
    let config = RuntimeConfig {
        max_nesting_depth: 1,
        ..Default::default()
    };
    let inner = BatchCoordinator::new(doubler(), extract_field("members"));
    let per_group = build_graph(
        "per_group",
        vec![UnitRef::new("members", BatchUnit::new(inner))],
        vec![],
        "members",
    )
    .unwrap();
    let outer = BatchCoordinator::new(per_group, extract_field("groups"))
        .with_config(BatchConfig::default().continue_on_error(true));

    let root = ContentItem::from_value(json!({"groups": [{"members": [{"value": 1}]}]}));
    let result = outer
        .run(&root, &ExecutionContext::new(RuntimeConfig::default()))
        .await;
    assert!(result.is_ok());

    let result = outer.run(&root, &ExecutionContext::new(config)).await.unwrap();
    assert_eq!(result.failed, 1);
    match &result.slots[0] {
        BatchSlot::Failed { error } => assert!(error.contains("batch failed")),
        other => panic!("unexpected slot {other:?}"),
    }
}

#[tokio::test]
async fn missing_field_is_reported() {
    let coordinator = BatchCoordinator::new(doubler(), extract_field("items"));
    let err = coordinator
        .run(
            &ContentItem::from_value(json!({"other": []})),
            &ExecutionContext::new(RuntimeConfig::default()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("batch field 'items' is missing"));
}
