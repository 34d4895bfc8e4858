//! Side-effect processing: derived transactions, abort re-queueing, and
//! effect isolation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use tessel_world::prelude::*;
use tessel_world::sidefx::DELETES_WITH;

fn id(raw: u64) -> EntityId {
    EntityId::new(raw).unwrap()
}

fn tick(changes: Vec<Change>) -> TickEvent {
    TickEvent {
        changes,
        bootstrapped: false,
        epoch: 1,
    }
}

/// Adds every `hits` update on any entity to the `total` on entity 100.
struct TallyEffect;

#[async_trait]
impl SideEffect for TallyEffect {
    fn name(&self) -> &str {
        "tally"
    }

    async fn post_apply(&mut self, changes: &[Change], set: &mut ChangeSet<'_>) -> anyhow::Result<()> {
        for change in changes {
            let Change::Update { delta, .. } = change else {
                continue;
            };
            let Some(hits) = delta.set.get("hits").and_then(|v| v.as_i64()) else {
                continue;
            };
            set.update(id(100), change, |tally| {
                let total = tally.get("total").and_then(|v| v.as_i64()).unwrap_or(0);
                tally.set("total", json!(total + hits));
            });
        }
        Ok(())
    }
}

struct BrokenEffect;

#[async_trait]
impl SideEffect for BrokenEffect {
    fn name(&self) -> &str {
        "broken"
    }

    async fn post_apply(&mut self, changes: &[Change], set: &mut ChangeSet<'_>) -> anyhow::Result<()> {
        if let Some(first) = changes.first() {
            set.delete(id(100), first);
        }
        anyhow::bail!("effect logic failed")
    }
}

async fn total(world: &InMemoryWorld) -> i64 {
    let (_, tally) = world.get_one(id(100)).await.unwrap().unwrap();
    tally.get("total").and_then(|v| v.as_i64()).unwrap()
}

#[tokio::test]
async fn aborted_side_effect_requeues_only_its_cause() {
    let tally = Entity::new(id(100)).with("total", json!(0));
    let source = Entity::new(id(1)).with("hits", json!(0));
    let world = Arc::new(InMemoryWorld::from_snapshot([(1, tally.clone()), (2, source.clone())]));

    let mut processor = SideEffectProcessor::new(world.clone(), Table::new(), ProcessorConfig::default());
    processor.register(TallyEffect).unwrap();
    processor.enqueue(&tick(vec![Change::create(1, tally), Change::create(2, source)]));
    assert_eq!(processor.tick().await.committed, 0);

    // Another writer moves the tally before the processor hears about it.
    let moved = world
        .apply_one(Transaction::new().update(EntityDelta::new(id(100)).with("total", json!(50))))
        .await
        .unwrap();
    let hit = world
        .apply_one(Transaction::new().update(EntityDelta::new(id(1)).with("hits", json!(3))))
        .await
        .unwrap();

    processor.enqueue(&tick(hit.changes.clone()));
    let report = processor.tick().await;
    assert_eq!((report.aborted, report.requeued), (1, 1));
    assert_eq!(total(&world).await, 50);
    assert_eq!(processor.pending(), 1);

    // Once the missed change lands, the re-queued hit is counted on top of it.
    processor.enqueue(&tick(moved.changes.clone()));
    let report = processor.tick().await;
    assert_eq!((report.retried, report.committed), (1, 1));
    assert_eq!(total(&world).await, 53);
    assert_eq!(processor.pending(), 0);
}

#[tokio::test]
async fn failing_effect_does_not_block_others() {
    let tally = Entity::new(id(100)).with("total", json!(0));
    let world = Arc::new(InMemoryWorld::from_snapshot([(1, tally.clone())]));
    let mut table = Table::new();
    table.apply(&[Change::create(1, tally)]);
    let mut processor = SideEffectProcessor::new(world.clone(), table, ProcessorConfig::default());
    processor.register(BrokenEffect).unwrap();
    processor.register(TallyEffect).unwrap();

    let hit = Change::update(2, EntityDelta::new(id(1)).with("hits", json!(4)));
    processor.enqueue(&tick(vec![hit]));
    let report = processor.tick().await;
    assert_eq!(report.failed_effects, 1);
    assert_eq!(report.committed, 1);
    assert_eq!(report.requeued, 1);
    // The broken effect's partial delete was discarded.
    assert_eq!(total(&world).await, 4);
}

#[tokio::test]
async fn deletes_cascade_through_owned_entities() {
    let world = Arc::new(InMemoryWorld::from_snapshot([
        (1, Entity::new(id(1))),
        (2, Entity::new(id(2)).with(DELETES_WITH, json!(1))),
        (3, Entity::new(id(3)).with(DELETES_WITH, json!(1))),
        (4, Entity::new(id(4)).with(DELETES_WITH, json!(2))),
        (5, Entity::new(id(5))),
    ]));
    let mut replica = Replica::new(world.clone(), Table::new(), ReplicaConfig::default());
    let mut ticks = replica.listen();
    replica.start().await.unwrap();

    let mut processor = SideEffectProcessor::new(world.clone(), Table::new(), ProcessorConfig::default());
    processor.register(DeletesWithEffect::new()).unwrap();

    async fn pump(
        ticks: &mut mpsc::UnboundedReceiver<Arc<TickEvent>>,
        processor: &mut SideEffectProcessor,
    ) -> TickReport {
        let event = tokio::time::timeout(Duration::from_secs(5), ticks.recv())
            .await
            .unwrap()
            .unwrap();
        processor.enqueue(&event);
        while let Ok(event) = ticks.try_recv() {
            processor.enqueue(&event);
        }
        processor.tick().await
    }

    pump(&mut ticks, &mut processor).await;
    assert_eq!(processor.table().len(), 5);

    world.apply_one(Transaction::new().delete(id(1))).await.unwrap();
    assert_eq!(pump(&mut ticks, &mut processor).await.committed, 2);
    assert_eq!(pump(&mut ticks, &mut processor).await.committed, 1);
    assert_eq!(world.entity_count(), 1);
    assert!(world.get_one(id(5)).await.unwrap().is_some());
    replica.stop().await.unwrap();
}

#[tokio::test]
async fn run_loop_coalesces_ticks_until_cancelled() {
    let tally = Entity::new(id(100)).with("total", json!(0));
    let world = Arc::new(InMemoryWorld::from_snapshot([(1, tally.clone())]));
    let mut processor = SideEffectProcessor::new(
        world.clone(),
        Table::new(),
        ProcessorConfig { flush_hz: 50.0 },
    );
    processor.register(TallyEffect).unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let (cancel, signal) = cancel_pair();
    let task = tokio::spawn(async move {
        processor.run(rx, signal).await;
        processor
    });

    tx.send(Arc::new(tick(vec![Change::create(1, tally)]))).unwrap();
    for (version, hits) in [(2, 1), (3, 2)] {
        let hit = Change::update(version, EntityDelta::new(id(7)).with("hits", json!(hits)));
        tx.send(Arc::new(tick(vec![hit]))).unwrap();
    }

    let mut waited = 0;
    while total(&world).await != 3 {
        assert!(waited < 250, "side effects never landed");
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    cancel.cancel();
    let processor = task.await.unwrap();
    assert_eq!(processor.pending(), 0);
}
