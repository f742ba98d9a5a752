/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Slots every instance answers.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, trace};

use crate::hash::{Hash, HashValue, Timestamp};
use crate::signalslot::instance::{InstanceInner, CLEAR_LOCK_SLOT, RECONFIGURE_SLOT};
use crate::signalslot::slots::{SlotCall, SlotEntry, SlotHandler, SlotReply};

pub(crate) fn register(inner: &InstanceInner) {
    let sync = |f: fn(SlotCall) -> anyhow::Result<SlotReply>| SlotHandler::sync(f);
    let builtins: [(&str, SlotHandler); 20] = [
        ("slotPing", sync(slot_ping)),
        ("slotDiscover", sync(slot_discover)),
        ("slotDiscoverAnswer", sync(slot_discover_answer)),
        ("slotInstanceNew", sync(slot_instance_new)),
        ("slotInstanceGone", sync(slot_instance_gone)),
        ("slotInstanceUpdated", sync(slot_instance_updated)),
        ("slotHeartbeat", sync(slot_heartbeat)),
        ("slotGetSchema", sync(slot_get_schema)),
        ("slotGetConfiguration", sync(slot_get_configuration)),
        ("slotGetConfigurationSlice", sync(slot_get_configuration_slice)),
        (RECONFIGURE_SLOT, SlotHandler::cooperative(slot_reconfigure)),
        ("slotKillDevice", sync(slot_kill_device)),
        (CLEAR_LOCK_SLOT, sync(slot_clear_lock)),
        ("slotGetTime", sync(slot_get_time)),
        ("slotGetSystemInfo", sync(slot_get_system_info)),
        ("slotGetOutputChannelInformation", sync(slot_get_output_channel_information)),
        ("slotGetOutputChannelNames", sync(slot_get_output_channel_names)),
        ("slotHasSlot", sync(slot_has_slot)),
        ("slotChanged", sync(slot_changed)),
        ("slotSchemaUpdated", sync(slot_schema_updated)),
    ];
    for (name, handler) in builtins {
        inner.slots.insert(
            name.to_string(),
            SlotEntry {
                handler,
                lockable: name == RECONFIGURE_SLOT,
            },
        );
    }
}

/// Replies with the instance info unless `rand` is the start-up nonce,
/// which identifies the instance's own uniqueness check.
fn slot_ping(call: SlotCall) -> anyhow::Result<SlotReply> {
    let rand = call.args.iter().find_map(HashValue::as_i64).unwrap_or(0);
    let nonce = i64::from(call.instance.0.nonce());
    if nonce != 0 && rand == nonce {
        trace!("Own uniqueness check, not replying");
        return Ok(SlotReply::Silent);
    }
    Ok(call.instance.info().into())
}

fn slot_discover(call: SlotCall) -> anyhow::Result<SlotReply> {
    let instance = &call.instance;
    if instance.is_running() && call.caller() != instance.instance_id() {
        instance.call_no_wait(
            call.caller(),
            "slotDiscoverAnswer",
            vec![HashValue::from(instance.instance_id()), HashValue::Hash(instance.info())],
        );
    }
    Ok(SlotReply::Silent)
}

fn id_and_info(call: &SlotCall) -> anyhow::Result<(String, Hash)> {
    let id = call.str_arg(0)?.to_string();
    let info = call.arg(1).ok().and_then(HashValue::as_hash).cloned().unwrap_or_default();
    Ok((id, info))
}

fn slot_discover_answer(call: SlotCall) -> anyhow::Result<SlotReply> {
    let (id, info) = id_and_info(&call)?;
    if let Some(tracker) = &call.instance.0.tracker {
        tracker.instance_new(&id, &info);
    }
    Ok(SlotReply::Silent)
}

fn slot_instance_new(call: SlotCall) -> anyhow::Result<SlotReply> {
    let (id, info) = id_and_info(&call)?;
    if id == call.instance.instance_id() {
        return Ok(SlotReply::Silent);
    }
    debug!(id = %id, "Instance new");
    call.instance.notice_instance_new(&id, &info);
    Ok(SlotReply::Silent)
}

fn slot_instance_gone(call: SlotCall) -> anyhow::Result<SlotReply> {
    let (id, info) = id_and_info(&call)?;
    if id == call.instance.instance_id() {
        return Ok(SlotReply::Silent);
    }
    debug!(id = %id, "Instance gone");
    call.instance.notice_instance_gone(&id, &info);
    Ok(SlotReply::Silent)
}

fn slot_instance_updated(call: SlotCall) -> anyhow::Result<SlotReply> {
    let (id, info) = id_and_info(&call)?;
    if let Some(tracker) = &call.instance.0.tracker {
        tracker.instance_updated(&id, &info);
    }
    Ok(SlotReply::Silent)
}

fn slot_heartbeat(call: SlotCall) -> anyhow::Result<SlotReply> {
    let (id, info) = id_and_info(&call)?;
    if let Some(tracker) = &call.instance.0.tracker {
        tracker.beat(&call.instance, &id, &info);
    }
    Ok(SlotReply::Silent)
}

fn slot_get_schema(call: SlotCall) -> anyhow::Result<SlotReply> {
    let instance = &call.instance;
    let schema = if call.bool_arg_or(0, false) {
        let state = instance
            .get("state")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        instance.schema().for_state(&state)
    } else {
        instance.schema()
    };
    Ok(SlotReply::values(vec![
        HashValue::Schema(schema),
        HashValue::from(instance.instance_id()),
    ]))
}

fn slot_get_configuration(call: SlotCall) -> anyhow::Result<SlotReply> {
    Ok(SlotReply::values(vec![
        HashValue::Hash(call.instance.configuration()),
        HashValue::from(call.instance.instance_id()),
    ]))
}

fn slot_get_configuration_slice(call: SlotCall) -> anyhow::Result<SlotReply> {
    let paths = call
        .hash_arg(0)?
        .get("paths")
        .and_then(HashValue::as_vec_string)
        .ok_or_else(|| anyhow!("slotGetConfigurationSlice expects a 'paths' list"))?
        .to_vec();
    Ok(call.instance.configuration().slice(&paths).into())
}

async fn slot_reconfigure(call: SlotCall) -> anyhow::Result<SlotReply> {
    let instance = call.instance.clone();
    let changes = call.hash_arg(0)?.clone();
    instance.schema().validate_reconfiguration(&changes)?;
    instance.0.hooks.on_reconfigure(&instance, &changes).await?;
    let batch = instance.batch();
    instance.set_hash(&changes);
    batch.commit();
    Ok(SlotReply::Empty)
}

fn slot_kill_device(call: SlotCall) -> anyhow::Result<SlotReply> {
    let instance = call.instance.clone();
    let message = Arc::clone(&call.message);
    debug!(caller = %call.caller(), "Kill requested");
    tokio::spawn(async move {
        instance.shutdown_with(Some(message)).await;
    });
    Ok(SlotReply::Silent)
}

fn slot_clear_lock(call: SlotCall) -> anyhow::Result<SlotReply> {
    call.instance.set("lockedBy", "");
    Ok(SlotReply::Empty)
}

fn time_info() -> Hash {
    let now = Timestamp::now();
    let mut info = Hash::new();
    info.set_element("time", true, now.to_attributes());
    info.set_element("reference", true, now.to_attributes());
    info.set("timeServerId", "None");
    info
}

fn slot_get_time(_call: SlotCall) -> anyhow::Result<SlotReply> {
    Ok(time_info().into())
}

fn slot_get_system_info(call: SlotCall) -> anyhow::Result<SlotReply> {
    let broker = call.instance.connector().urls().join(",");
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "karabo".to_string());
    let info = Hash::new()
        .with("timeInfo", time_info())
        .with("broker", broker)
        .with("user", user);
    Ok(info.into())
}

/// Accepts either a Hash with `channelId` or the bare channel name.
fn slot_get_output_channel_information(call: SlotCall) -> anyhow::Result<SlotReply> {
    let channel = match call.arg(0)? {
        HashValue::Hash(info) => info.get_str("channelId").unwrap_or_default().to_string(),
        HashValue::String(name) => name.clone(),
        other => return Err(anyhow!("unexpected channel argument of type {}", other.type_code())),
    };
    let reply = match call.instance.0.outputs.get(&channel) {
        Some(output) => Hash::new()
            .with("success", true)
            .with("info", output.connection_info()),
        None => Hash::new().with("success", false).with("info", Hash::new()),
    };
    Ok(reply.into())
}

fn slot_get_output_channel_names(call: SlotCall) -> anyhow::Result<SlotReply> {
    let mut names: Vec<String> = call
        .instance
        .0
        .outputs
        .iter()
        .map(|e| e.key().clone())
        .collect();
    names.sort();
    Ok(SlotReply::value(names))
}

fn slot_has_slot(call: SlotCall) -> anyhow::Result<SlotReply> {
    Ok(call.instance.has_slot(call.str_arg(0)?).into())
}

/// Change notifications of peers this instance holds proxies for.
fn slot_changed(call: SlotCall) -> anyhow::Result<SlotReply> {
    let changes = call.hash_arg(0)?;
    let id = call
        .arg(1)
        .ok()
        .and_then(HashValue::as_str)
        .unwrap_or_else(|| call.caller());
    call.instance.0.proxies.changed(id, changes);
    Ok(SlotReply::Silent)
}

fn slot_schema_updated(call: SlotCall) -> anyhow::Result<SlotReply> {
    let schema = call.schema_arg(0)?;
    let id = call
        .arg(1)
        .ok()
        .and_then(HashValue::as_str)
        .unwrap_or_else(|| call.caller());
    call.instance.0.proxies.schema_updated(id, schema);
    Ok(SlotReply::Silent)
}
