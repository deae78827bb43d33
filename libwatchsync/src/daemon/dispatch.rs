// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Instant;

use tracing::debug;

use super::{
    events::EventKind,
    origin::OriginRegistry,
    watch::{self, WatchEvent, WatchTable, Watcher},
};

/// Translate one raw watcher event into per-origin enqueues.
///
/// Events for descriptors missing from the table are stale (their
/// directory was deleted after the event was queued) and are dropped.
/// A created directory is immediately watched recursively so its
/// subtree starts producing events.
pub fn on_event<W: Watcher>(
    watcher: &mut W,
    table: &mut WatchTable<W>,
    registry: &mut OriginRegistry,
    ev: &WatchEvent<W::Wd>,
    now: Instant,
) {
    let Some(subs) = table.lookup(ev.wd) else {
        debug!(wd = ?ev.wd, kind = %ev.kind, "event for stale watch descriptor, dropping");
        return;
    };
    // watching a created directory mutates the table, so detach the
    // subscription list first
    let subs: Vec<_> = subs.to_vec();

    for (id, rel) in subs {
        let path = match &ev.name {
            Some(name) => rel.join(name),
            None => rel.clone(),
        };
        let path2 = ev.name2.as_ref().map(|name| rel.join(name));

        registry.get_mut(id).enqueue(ev.kind, now, path.clone(), path2);

        if ev.is_dir && ev.kind == EventKind::Create {
            watch::watch_directory(watcher, table, registry, id, &path, now);
        }
    }
}
