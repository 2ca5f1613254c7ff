//! The runtime side of the editor debugger protocol.
//!
//! Messages are loss-tolerant, message-framed JSON dictionaries. A request
//! carries a `message` field naming the operation plus its arguments; the
//! reply mirrors the shapes the editor renders:
//!
//! - `request_worlds` → `worlds { worlds: [{id, name, entity_count}] }`
//! - `request_entities {world_id, offset, count}` →
//!   `entities { world_id, offset, count, entities: [{id, name, component_count}] }`
//! - `request_components {world_id, entity_id}` →
//!   `components { world_id, entity_id, components: [{name, type, data}] }`
//! - `request_profiler_metrics {world_id}` →
//!   `profiler_metrics { world_id, total_time_usec, system_count, systems }`
//!
//! Pair components always reply with empty data (string-only identity);
//! unknown messages and stale ids produce an `error` reply rather than a
//! dropped connection.

use serde_json::{Value, json};

use crate::debug::profiler;
use crate::ecs::entity::Entity;
use crate::ecs::handle::Rid;
use crate::ecs::world::World;
use crate::server::Runtime;

fn error_reply(message: &str) -> Value {
    json!({ "message": "error", "error": message })
}

/// Handle one debugger request against the runtime.
pub fn handle_request(runtime: &Runtime, request: &Value) -> Value {
    let Some(message) = request.get("message").and_then(Value::as_str) else {
        return error_reply("missing message field");
    };
    match message {
        "request_worlds" => worlds_reply(runtime),
        "request_entities" => entities_reply(runtime, request),
        "request_components" => components_reply(runtime, request),
        "request_profiler_metrics" => profiler_reply(runtime, request),
        other => error_reply(&format!("unknown message `{other}`")),
    }
}

fn world_rid(request: &Value) -> Option<Rid> {
    request
        .get("world_id")
        .and_then(Value::as_u64)
        .map(Rid::from_bits)
}

fn worlds_reply(runtime: &Runtime) -> Value {
    let mut worlds = Vec::new();
    runtime.for_each_world(|rid, world| {
        worlds.push(json!({
            "id": rid.to_bits(),
            "name": world.name(),
            "entity_count": world.entities().alive(),
        }));
    });
    json!({ "message": "worlds", "worlds": worlds })
}

fn entities_reply(runtime: &Runtime, request: &Value) -> Value {
    let Some(rid) = world_rid(request) else {
        return error_reply("missing world_id");
    };
    let offset = request.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
    let count = request.get("count").and_then(Value::as_u64).unwrap_or(100) as usize;

    let reply = runtime.with_world(rid, |world| {
        let entities: Vec<Value> = world
            .entities()
            .live_entities()
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|entity| {
                json!({
                    "id": entity.to_bits(),
                    "name": world.get_name(entity).unwrap_or(""),
                    "component_count": component_count(world, entity),
                })
            })
            .collect();
        json!({
            "message": "entities",
            "world_id": rid.to_bits(),
            "offset": offset,
            "count": entities.len(),
            "entities": entities,
        })
    });
    reply.unwrap_or_else(|_| error_reply("unknown world"))
}

fn component_count(world: &World, entity: Entity) -> usize {
    world
        .registry()
        .infos()
        .iter()
        .filter(|info| world.has_id(entity, info.id))
        .count()
}

fn components_reply(runtime: &Runtime, request: &Value) -> Value {
    let Some(rid) = world_rid(request) else {
        return error_reply("missing world_id");
    };
    let Some(entity) = request.get("entity_id").and_then(Value::as_u64) else {
        return error_reply("missing entity_id");
    };
    let entity = Entity::from_bits(entity);

    let reply = runtime.with_world(rid, |world| {
        if !world.is_live(entity) {
            return error_reply("unknown entity");
        }
        let components: Vec<Value> = world
            .registry()
            .infos()
            .iter()
            .filter(|info| world.has_id(entity, info.id))
            .map(|info| {
                // Pairs are identity-only on the wire; values inspect to a
                // dictionary when the type registered an inspect hook.
                let (kind, data) = if info.is_pair {
                    ("pair", Value::Object(serde_json::Map::new()))
                } else {
                    ("component", world.inspect_component(entity, info.id))
                };
                json!({ "name": info.name, "type": kind, "data": data })
            })
            .collect();
        json!({
            "message": "components",
            "world_id": rid.to_bits(),
            "entity_id": entity.to_bits(),
            "components": components,
        })
    });
    reply.unwrap_or_else(|_| error_reply("unknown world"))
}

fn profiler_reply(runtime: &Runtime, request: &Value) -> Value {
    let Some(rid) = world_rid(request) else {
        return error_reply("missing world_id");
    };
    let reply = runtime.with_world(rid, |world| {
        let metrics = profiler::world_metrics(world);
        json!({
            "message": "profiler_metrics",
            "world_id": rid.to_bits(),
            "total_time_usec": metrics.total_time_usec,
            "system_count": metrics.system_count,
            "systems": serde_json::to_value(&metrics.systems).unwrap_or(Value::Null),
        })
    });
    reply.unwrap_or_else(|_| error_reply("unknown world"))
}
