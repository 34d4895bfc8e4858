//! Property tests: any subscriber's folded stream equals the store.
//!
//! Random batches of guarded transactions are applied to an in-memory
//! store while one unfiltered and one filtered subscriber listen. Folding
//! each stream into a table must reproduce the store exactly (entities and
//! versions), restricted to the filter for the filtered subscriber.

use proptest::prelude::*;
use serde_json::json;

use tessel_world::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create { slot: u64, hp: i64, tagged: bool },
    SetHp(u64, i64),
    Tag(u64),
    Untag(u64),
    Delete(u64),
}

#[derive(Debug, Clone)]
enum Guard {
    None,
    Exists(u64),
    Absent(u64),
    AtVersion(u64, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..8u64, any::<i64>(), any::<bool>())
            .prop_map(|(slot, hp, tagged)| Op::Create { slot, hp, tagged }),
        (1..8u64, any::<i64>()).prop_map(|(s, hp)| Op::SetHp(s, hp)),
        (1..8u64).prop_map(Op::Tag),
        (1..8u64).prop_map(Op::Untag),
        (1..8u64).prop_map(Op::Delete),
    ]
}

fn guard_strategy() -> impl Strategy<Value = Guard> {
    prop_oneof![
        3 => Just(Guard::None),
        1 => (1..8u64).prop_map(Guard::Exists),
        1 => (1..8u64).prop_map(Guard::Absent),
        1 => (1..8u64, 0..40u64).prop_map(|(s, v)| Guard::AtVersion(s, v)),
    ]
}

fn tx_strategy() -> impl Strategy<Value = (Vec<Op>, Guard)> {
    (proptest::collection::vec(op_strategy(), 0..3), guard_strategy())
}

fn id(raw: u64) -> EntityId {
    EntityId::new(raw).unwrap()
}

fn to_transaction((ops, guard): &(Vec<Op>, Guard)) -> Transaction {
    let mut tx = Transaction::new();
    for op in ops {
        tx = match op {
            Op::Create { slot, hp, tagged } => {
                let mut e = Entity::new(id(*slot)).with("hp", json!(hp));
                if *tagged {
                    e = e.with("tag", json!(true));
                }
                tx.create(e)
            }
            Op::SetHp(s, hp) => tx.update(EntityDelta::new(id(*s)).with("hp", json!(hp))),
            Op::Tag(s) => tx.update(EntityDelta::new(id(*s)).with("tag", json!(true))),
            Op::Untag(s) => tx.update(EntityDelta::new(id(*s)).without("tag")),
            Op::Delete(s) => tx.delete(id(*s)),
        };
    }
    match guard {
        Guard::None => tx,
        Guard::Exists(s) => tx.with_iff(Iff::exists(id(*s))),
        Guard::Absent(s) => tx.with_iff(Iff::absent(id(*s))),
        Guard::AtVersion(s, v) => tx.with_iff(Iff::at_version(id(*s), *v)),
    }
}

async fn fold(mut stream: UpdateStream) -> Table {
    let mut table = Table::new();
    while let Some(Ok(update)) = stream.next().await {
        table.apply(&materialize_batch(&update.changes));
    }
    table
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn folded_streams_match_the_store(
        batches in proptest::collection::vec(proptest::collection::vec(tx_strategy(), 1..4), 1..12),
        subscribe_after in 0..4usize,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let world = InMemoryWorld::new();
            let mut streams = None;
            for (i, batch) in batches.iter().enumerate() {
                if i == subscribe_after.min(batches.len() - 1) {
                    let all = world
                        .subscribe(SubscriptionConfig::default(), CancelSignal::never())
                        .await
                        .unwrap();
                    let tagged = world
                        .subscribe(
                            SubscriptionConfig::filtered(EntityFilter::all_of(["tag"])),
                            CancelSignal::never(),
                        )
                        .await
                        .unwrap();
                    streams = Some((all, tagged));
                }
                let txs = batch.iter().map(to_transaction).collect();
                world.apply(txs).await.unwrap();
            }
            world.disconnect_subscribers();

            let (all, tagged) = streams.unwrap();
            let all = fold(all).await;
            let tagged = fold(tagged).await;

            let ids: Vec<EntityId> = (1..8).map(id).collect();
            let truth = world.get(&ids).await.unwrap();
            for (raw_id, (version, entity)) in ids.iter().zip(truth) {
                let mirrored = all.get_with_version(*raw_id).map(|(v, e)| (v, e.clone()));
                let expected = entity.clone().map(|e| (version, e));
                prop_assert_eq!(&mirrored, &expected);

                let visible = entity.filter(|e| e.has("tag")).map(|e| (version, e));
                let filtered = tagged.get_with_version(*raw_id).map(|(v, e)| (v, e.clone()));
                prop_assert_eq!(filtered, visible);
            }
            Ok(())
        })?;
    }
}
