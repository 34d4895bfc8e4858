//! Property tests for table/index synchronization.
//!
//! Random sequences of committed changes are applied to a table carrying one
//! of each index kind. After every sequence each index must equal a
//! brute-force recomputation from the base mapping.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use serde_json::json;
use tessel_ecs::index::spatial::position_shape;
use tessel_ecs::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Create {
        slot: u64,
        hp: Option<i64>,
        pos: Option<[i32; 3]>,
        team: Option<u8>,
    },
    SetHp(u64, i64),
    RemoveHp(u64),
    Move(u64, [i32; 3]),
    RemovePosition(u64),
    SetTeam(u64, u8),
    Delete(u64),
}

fn pos_strategy() -> impl Strategy<Value = [i32; 3]> {
    proptest::array::uniform3(-100..100i32)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (
            1..12u64,
            proptest::option::of(any::<i64>()),
            proptest::option::of(pos_strategy()),
            proptest::option::of(0..3u8)
        )
            .prop_map(|(slot, hp, pos, team)| Op::Create {
                slot,
                hp,
                pos,
                team
            }),
        (1..12u64, any::<i64>()).prop_map(|(s, v)| Op::SetHp(s, v)),
        (1..12u64).prop_map(Op::RemoveHp),
        (1..12u64, pos_strategy()).prop_map(|(s, p)| Op::Move(s, p)),
        (1..12u64).prop_map(Op::RemovePosition),
        (1..12u64, 0..3u8).prop_map(|(s, t)| Op::SetTeam(s, t)),
        (1..12u64).prop_map(Op::Delete),
    ]
}

fn id(raw: u64) -> EntityId {
    EntityId::new(raw).unwrap()
}

fn to_change(op: &Op, version: u64) -> Change {
    match op {
        Op::Create {
            slot,
            hp,
            pos,
            team,
        } => {
            let mut e = Entity::new(id(*slot));
            if let Some(hp) = hp {
                e = e.with("hp", json!(hp));
            }
            if let Some(p) = pos {
                e = e.with("position", json!({ "v": p }));
            }
            if let Some(t) = team {
                e = e.with("team", json!(format!("team-{t}")));
            }
            Change::create(version, e)
        }
        Op::SetHp(s, v) => Change::update(version, EntityDelta::new(id(*s)).with("hp", json!(v))),
        Op::RemoveHp(s) => Change::update(version, EntityDelta::new(id(*s)).without("hp")),
        Op::Move(s, p) => Change::update(
            version,
            EntityDelta::new(id(*s)).with("position", json!({ "v": p })),
        ),
        Op::RemovePosition(s) => {
            Change::update(version, EntityDelta::new(id(*s)).without("position"))
        }
        Op::SetTeam(s, t) => Change::update(
            version,
            EntityDelta::new(id(*s)).with("team", json!(format!("team-{t}"))),
        ),
        Op::Delete(s) => Change::delete(version, id(*s)),
    }
}

fn team_of(e: &Entity) -> Vec<String> {
    e.get("team")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .into_iter()
        .collect()
}

fn indexed_table() -> Table {
    Table::builder()
        .index("hp", PresenceIndex::new(ComponentMatcher::new(["hp"])))
        .index("team", KeyIndex::new(team_of))
        .index(
            "spatial",
            SpatialIndex::new(SpatialIndexConfig { cell_size: 16.0 }),
        )
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn indices_match_brute_force(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let mut table = indexed_table();
        for (i, op) in ops.iter().enumerate() {
            table.apply(&[to_change(op, i as u64 + 1)]);
        }

        // Presence.
        let expected_hp: BTreeSet<EntityId> = table
            .iter()
            .filter(|(_, e)| e.has("hp"))
            .map(|(id, _)| id)
            .collect();
        let hp = table.index::<PresenceIndex>("hp").unwrap();
        prop_assert_eq!(hp.iter().collect::<BTreeSet<_>>(), expected_hp);

        // Key projection, forward and reverse.
        let mut expected_teams: BTreeMap<String, BTreeSet<EntityId>> = BTreeMap::new();
        for (id, e) in table.iter() {
            for t in team_of(e) {
                expected_teams.entry(t).or_default().insert(id);
            }
        }
        let teams = table.index::<KeyIndex<String>>("team").unwrap();
        prop_assert_eq!(teams.key_count(), expected_teams.len());
        for (team, ids) in &expected_teams {
            prop_assert_eq!(&teams.lookup(team).collect::<BTreeSet<_>>(), ids);
            for id in ids {
                prop_assert!(teams.keys_for(*id).unwrap().contains(team));
            }
        }

        // Spatial: every placed entity is found at its position, nothing else
        // is indexed.
        let spatial = table.index::<SpatialIndex>("spatial").unwrap();
        let mut placed = 0;
        for (id, e) in table.iter() {
            if let Some(Shape::Point(p)) = position_shape(e) {
                placed += 1;
                prop_assert!(spatial.scan_point(p).contains(&id));
            }
        }
        prop_assert_eq!(spatial.len(), placed);
        let everything = spatial.scan_aabb(Aabb::new([-1000.0; 3], [1000.0; 3]));
        prop_assert_eq!(everything.len(), placed);
    }

    #[test]
    fn same_stream_same_hash(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let changes: Vec<Change> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| to_change(op, i as u64 + 1))
            .collect();

        let mut a = indexed_table();
        a.apply(&changes);

        // Replaying the stream (redelivery) must not move the state.
        let mut b = indexed_table();
        b.apply(&changes);
        b.apply(&changes);

        prop_assert_eq!(a.state_hash().unwrap(), b.state_hash().unwrap());
    }

    #[test]
    fn coalesced_stream_reaches_same_state(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let changes: Vec<Change> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| to_change(op, i as u64 + 1))
            .collect();

        let mut direct = Table::new();
        direct.apply(&changes);

        let mut buffer = LazyChangeBuffer::new();
        for c in &changes {
            buffer.push(LazyChange::encode(c).unwrap());
        }
        let mut coalesced = Table::new();
        coalesced.apply(&materialize_batch(&buffer.pop()));

        let mut left: Vec<_> = direct.iter().map(|(id, e)| (id, e.clone())).collect();
        let mut right: Vec<_> = coalesced.iter().map(|(id, e)| (id, e.clone())).collect();
        left.sort_by_key(|(id, _)| *id);
        right.sort_by_key(|(id, _)| *id);
        prop_assert_eq!(left, right);
    }
}
