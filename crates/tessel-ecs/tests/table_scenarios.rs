//! End-to-end table scenarios: committed streams folded into an indexed table
//! and read back through the public index API.

use serde_json::json;
use tessel_ecs::prelude::*;

fn id(raw: u64) -> EntityId {
    EntityId::new(raw).unwrap()
}

fn world_table() -> Table {
    Table::builder()
        .index("spatial", SpatialIndex::new(SpatialIndexConfig::default()))
        .index("npcs", PresenceIndex::new(ComponentMatcher::new(["npc", "position"])))
        .index(
            "by_owner",
            KeyIndex::with_matcher(ComponentMatcher::new(["owner"]), |e: &Entity| {
                e.get("owner").and_then(|v| v.as_u64()).into_iter().collect()
            }),
        )
        .build()
        .unwrap()
}

fn npc(raw: u64, p: [f64; 3]) -> Entity {
    Entity::new(id(raw))
        .with("npc", json!({}))
        .with("position", json!({ "v": p }))
}

#[test]
fn removing_position_hides_entity_from_former_location() {
    let mut table = world_table();
    table.apply(&[Change::create(1, npc(1, [10.0, 0.0, 10.0]))]);

    let spatial = table.index::<SpatialIndex>("spatial").unwrap();
    assert_eq!(spatial.scan_sphere([10.0, 0.0, 10.0], 0.5), vec![id(1)]);

    assert!(table.apply(&[Change::update(2, EntityDelta::new(id(1)).without("position"))]));

    let spatial = table.index::<SpatialIndex>("spatial").unwrap();
    assert!(spatial.scan_sphere([10.0, 0.0, 10.0], 0.5).is_empty());
    assert!(!table.index::<PresenceIndex>("npcs").unwrap().contains(id(1)));
    // Still in the base map.
    assert!(table.get(id(1)).unwrap().has("npc"));
}

#[test]
fn deleted_owner_keys_are_found_through_reverse_map() {
    let mut table = world_table();
    table.apply(&[
        Change::create(1, Entity::new(id(1)).with("owner", json!(100))),
        Change::create(2, Entity::new(id(2)).with("owner", json!(100))),
        Change::create(3, Entity::new(id(3)).with("owner", json!(200))),
    ]);
    table.apply(&[Change::delete(4, id(1))]);

    let by_owner = table.index::<KeyIndex<u64>>("by_owner").unwrap();
    assert_eq!(by_owner.lookup(&100).collect::<Vec<_>>(), vec![id(2)]);
    assert!(by_owner.keys_for(id(1)).is_none());
    assert_eq!(by_owner.first(&200), Some(id(3)));
}

#[test]
fn one_entity_in_many_indices() {
    let mut table = world_table();
    let e = npc(5, [0.0, 0.0, 0.0]).with("owner", json!(1));
    table.apply(&[Change::create(1, e)]);

    assert!(table.index::<SpatialIndex>("spatial").unwrap().contains(id(5)));
    assert!(table.index::<PresenceIndex>("npcs").unwrap().contains(id(5)));
    assert_eq!(table.index::<KeyIndex<u64>>("by_owner").unwrap().first(&1), Some(id(5)));

    table.apply(&[Change::delete(2, id(5))]);
    for name in ["spatial", "npcs", "by_owner"] {
        assert!(table.index_dyn(name).unwrap().is_empty(), "index {name} not emptied");
    }
}

#[test]
fn delete_of_unknown_id_returns_false() {
    let mut table = world_table();
    assert!(!table.apply(&[Change::delete(1, id(42))]));
    assert!(!table.apply(&[Change::delete(2, id(42))]));
}
