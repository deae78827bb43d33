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

use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use super::{events::EventKind, inlet::Inlet, origin::OriginRegistry};

/// One scheduler pass: for every origin with spare process capacity,
/// fire the due head delays in queue order.
///
/// A whole `Move` delay goes through the origin's move action; it only
/// stays whole when one is configured, since enqueue splits moves
/// otherwise. Everything else runs the generic action.
pub fn tick(registry: &mut OriginRegistry, now: Instant) {
    for (_, origin) in registry.iter_mut() {
        while origin.has_capacity() {
            let due = matches!(origin.delays.head(), Some(d) if d.deadline <= now);
            if !due {
                break;
            }
            let delay = origin.delays.pop_head().expect("a due head was just observed");
            let inlet = Inlet::new(&origin.source, &origin.target, &delay);
            let action = match delay.kind {
                EventKind::Move => origin
                    .config
                    .move_action
                    .as_mut()
                    .unwrap_or(&mut origin.config.action),
                _ => &mut origin.config.action,
            };
            match action.invoke(&inlet) {
                Some(pid) => {
                    info!(
                        pid = %pid, kind = %delay.kind, path = %delay.path.display(),
                        target = %origin.target,
                        "action started"
                    );
                    origin.processes.insert(pid, delay);
                }
                None => {
                    warn!(
                        kind = %delay.kind, path = %delay.path.display(),
                        "action spawned no child, slot stays free"
                    );
                }
            }
        }
    }
}

/// The next moment the scheduler has something to do: the minimum
/// head deadline over all origins that could actually run an action.
/// A saturated origin does not contribute, so the host may sleep
/// through its backlog until a child exits.
pub fn earliest_alarm(registry: &OriginRegistry) -> Option<Instant> {
    registry
        .iter()
        .filter(|(_, origin)| origin.has_capacity())
        .filter_map(|(_, origin)| origin.delays.head().map(|d| d.deadline))
        .min()
}

/// Record the exit of an action child and free its slot. Failures are
/// reported but not retried; recovery is the sync command's business.
pub fn collect_process(registry: &mut OriginRegistry, pid: Pid, status: i32) {
    for (_, origin) in registry.iter_mut() {
        if let Some(delay) = origin.processes.remove(&pid) {
            if status == 0 {
                info!(pid = %pid, path = %delay.path.display(), "sync finished");
            } else {
                error!(
                    pid = %pid, path = %delay.path.display(), status,
                    "sync command failed, not retrying"
                );
            }
            return;
        }
    }
    debug!(pid = %pid, status, "exit of a child no origin owns, ignoring");
}
