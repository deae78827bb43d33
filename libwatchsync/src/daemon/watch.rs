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

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt, fs, hash,
    path::{Path, PathBuf},
    time::Instant,
};

use tracing::{debug, error, warn};

use super::{
    events::EventKind,
    origin::{OriginId, OriginRegistry},
};

/// The kernel-side watch mechanism, abstracted so the pipeline can be
/// driven by a scripted watcher in tests.
pub trait Watcher {
    /// Opaque watch descriptor naming one watched directory.
    type Wd: Copy + Eq + hash::Hash + fmt::Debug;

    /// Register a watch on `path`. Watching the same directory twice
    /// returns the same descriptor.
    fn add_watch(&mut self, path: &Path) -> anyhow::Result<Self::Wd>;
}

/// One translated filesystem event as produced by a [`Watcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent<Wd> {
    pub wd: Wd,
    pub kind: EventKind,
    pub is_dir: bool,
    /// Name of the affected entry within the watched directory; absent
    /// for events about the directory itself.
    pub name: Option<OsString>,
    /// Destination name for paired move events.
    pub name2: Option<OsString>,
}

/// Mapping from watch descriptor to the (origin, relative path) pairs
/// subscribed to it. Several origins may share one descriptor when
/// their trees overlap, and one origin appears at many descriptors.
///
/// Entries are never removed: when a watched directory is deleted the
/// kernel invalidates the descriptor and later events on it no longer
/// resolve here.
pub struct WatchTable<W: Watcher> {
    map: HashMap<W::Wd, Vec<(OriginId, PathBuf)>>,
}

impl<W: Watcher> WatchTable<W> {
    pub fn new() -> WatchTable<W> {
        WatchTable { map: HashMap::new() }
    }

    pub fn lookup(&self, wd: W::Wd) -> Option<&[(OriginId, PathBuf)]> {
        self.map.get(&wd).map(|subs| subs.as_slice())
    }

    pub fn subscribe(&mut self, wd: W::Wd, origin: OriginId, rel: PathBuf) {
        let subs = self.map.entry(wd).or_default();
        if subs.iter().any(|(o, r)| *o == origin && *r == rel) {
            debug!(?wd, rel = %rel.display(), "already subscribed, skipping");
            return;
        }
        subs.push((origin, rel));
    }

    /// Number of watched directories.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl<W: Watcher> Default for WatchTable<W> {
    fn default() -> Self {
        WatchTable::new()
    }
}

/// Watch `origin.source + rel` and all its current subdirectories.
///
/// A directory that cannot be watched is logged and skipped together
/// with its subtree; the rest of the tree stays live. In warmstart
/// mode (no startup action) every directory also gets a synthetic
/// Create so the first scheduled sync reconciles changes that happened
/// while the daemon was down.
pub fn watch_directory<W: Watcher>(
    watcher: &mut W,
    table: &mut WatchTable<W>,
    registry: &mut OriginRegistry,
    id: OriginId,
    rel: &Path,
    now: Instant,
) {
    let abs = registry.get(id).source.join(rel);
    let wd = match watcher.add_watch(&abs) {
        Ok(wd) => wd,
        Err(err) => {
            error!(
                path = %abs.display(),
                "cannot watch directory, skipping its subtree: {err:#}"
            );
            return;
        }
    };
    debug!(?wd, path = %abs.display(), "watching directory");
    table.subscribe(wd, id, rel.to_path_buf());

    if registry.get(id).config.startup.is_none() {
        registry.get_mut(id).enqueue(EventKind::Create, now, rel.to_path_buf(), None);
    }

    for name in sub_dirs(&abs) {
        watch_directory(watcher, table, registry, id, &rel.join(name), now);
    }
}

// Names of the direct subdirectories of `path`. Symlinks are not
// followed.
fn sub_dirs(path: &Path) -> Vec<OsString> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %path.display(), "cannot list directory: {err}");
            return Vec::new();
        }
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %path.display(), "error listing directory: {err}");
                continue;
            }
        };
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => dirs.push(entry.file_name()),
            Ok(_) => {}
            Err(err) => {
                warn!(path = %entry.path().display(), "cannot stat entry: {err}");
            }
        }
    }
    dirs
}
