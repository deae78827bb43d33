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
    ffi::OsString,
    fmt, hash,
    os::fd::{AsFd, BorrowedFd},
    path::Path,
};

use anyhow::Context;
use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor},
};
use tracing::debug;

use super::{
    events::EventKind,
    watch::{WatchEvent, Watcher},
};

/// The production watcher: one inotify instance covering every
/// watched directory of every origin, read in non-blocking batches
/// from the host loop.
pub struct InotifyWatcher {
    inotify: Inotify,
    overflowed: bool,
}

impl InotifyWatcher {
    pub fn new() -> anyhow::Result<InotifyWatcher> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .context("initializing inotify")?;
        Ok(InotifyWatcher { inotify, overflowed: false })
    }

    /// Read and translate everything the kernel has queued.
    pub fn drain(&mut self) -> anyhow::Result<Vec<WatchEvent<WatchDescriptor>>> {
        let mut raw = Vec::new();
        loop {
            match self.inotify.read_events() {
                Ok(events) => {
                    if events.is_empty() {
                        break;
                    }
                    raw.extend(events.into_iter().map(RawEvent::from));
                }
                Err(Errno::EAGAIN) => break,
                Err(err) => return Err(err).context("reading inotify events"),
            }
        }
        let (events, overflow) = translate(raw);
        if overflow {
            self.overflowed = true;
        }
        Ok(events)
    }

    /// True once the kernel reported a queue overflow. Events have
    /// been lost and the mirror can no longer be trusted to be
    /// incremental; the host is expected to terminate.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl Watcher for InotifyWatcher {
    type Wd = WatchDescriptor;

    fn add_watch(&mut self, path: &Path) -> anyhow::Result<WatchDescriptor> {
        self.inotify
            .add_watch(path, watch_mask())
            .with_context(|| format!("adding inotify watch on {}", path.display()))
    }
}

impl AsFd for InotifyWatcher {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inotify.as_fd()
    }
}

// Close-write rather than modify keeps half-written files out of the
// pipeline. Only-dir and dont-follow keep watches off files and
// symlink targets.
fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DONT_FOLLOW
        | AddWatchFlags::IN_ONLYDIR
}

// What translate works on; generic over the descriptor type so the
// pairing logic is testable without a live inotify instance.
struct RawEvent<Wd> {
    wd: Wd,
    mask: AddWatchFlags,
    cookie: u32,
    name: Option<OsString>,
}

impl From<InotifyEvent> for RawEvent<WatchDescriptor> {
    fn from(ev: InotifyEvent) -> Self {
        RawEvent { wd: ev.wd, mask: ev.mask, cookie: ev.cookie, name: ev.name }
    }
}

/// Translate one batch of raw inotify events into pipeline events,
/// returning them together with whether an overflow was seen.
///
/// The kernel queues the two halves of a rename back to back with a
/// shared cookie; when both land in the batch on the same descriptor
/// they fuse into one `Move`. A pair spanning two descriptors (a move
/// between watched directories) or missing its partner (a move in or
/// out of the tree) surfaces as `MoveFrom`/`MoveTo`.
fn translate<Wd>(raw: Vec<RawEvent<Wd>>) -> (Vec<WatchEvent<Wd>>, bool)
where
    Wd: Copy + Eq + hash::Hash + fmt::Debug,
{
    let mut out = Vec::new();
    let mut overflow = false;
    let mut iter = raw.into_iter().peekable();

    while let Some(ev) = iter.next() {
        if ev.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            overflow = true;
            continue;
        }
        if ev.mask.contains(AddWatchFlags::IN_IGNORED) {
            // the kernel dropped the watch (directory deleted); the
            // table entry goes stale on its own
            debug!(wd = ?ev.wd, "watch expired");
            continue;
        }
        let is_dir = ev.mask.contains(AddWatchFlags::IN_ISDIR);

        if ev.mask.contains(AddWatchFlags::IN_MOVED_FROM) {
            let paired = iter
                .peek()
                .map(|next| {
                    next.mask.contains(AddWatchFlags::IN_MOVED_TO) && next.cookie == ev.cookie
                })
                .unwrap_or(false);
            if paired {
                let next = iter.next().expect("peeked partner event");
                if next.wd == ev.wd {
                    out.push(WatchEvent {
                        wd: ev.wd,
                        kind: EventKind::Move,
                        is_dir,
                        name: ev.name,
                        name2: next.name,
                    });
                } else {
                    // both directories are watched, but a single event
                    // names only one descriptor
                    out.push(WatchEvent {
                        wd: ev.wd,
                        kind: EventKind::MoveFrom,
                        is_dir,
                        name: ev.name,
                        name2: None,
                    });
                    out.push(WatchEvent {
                        wd: next.wd,
                        kind: EventKind::MoveTo,
                        is_dir: next.mask.contains(AddWatchFlags::IN_ISDIR),
                        name: next.name,
                        name2: None,
                    });
                }
            } else {
                out.push(WatchEvent {
                    wd: ev.wd,
                    kind: EventKind::MoveFrom,
                    is_dir,
                    name: ev.name,
                    name2: None,
                });
            }
            continue;
        }
        if ev.mask.contains(AddWatchFlags::IN_MOVED_TO) {
            out.push(WatchEvent {
                wd: ev.wd,
                kind: EventKind::MoveTo,
                is_dir,
                name: ev.name,
                name2: None,
            });
            continue;
        }

        let kind = if ev.mask.contains(AddWatchFlags::IN_ATTRIB) {
            EventKind::Attrib
        } else if ev.mask.contains(AddWatchFlags::IN_CLOSE_WRITE) {
            EventKind::Modify
        } else if ev.mask.contains(AddWatchFlags::IN_CREATE) {
            EventKind::Create
        } else if ev.mask.contains(AddWatchFlags::IN_DELETE) {
            EventKind::Delete
        } else {
            debug!(wd = ?ev.wd, mask = ?ev.mask, "unhandled inotify event, dropping");
            continue;
        };
        out.push(WatchEvent { wd: ev.wd, kind, is_dir, name: ev.name, name2: None });
    }

    (out, overflow)
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;
    use std::fs;

    fn raw(wd: i32, mask: AddWatchFlags, cookie: u32, name: &str) -> RawEvent<i32> {
        RawEvent { wd, mask, cookie, name: Some(OsString::from(name)) }
    }

    #[test]
    fn plain_events_translate() {
        let cases = vec![
            (AddWatchFlags::IN_ATTRIB, EventKind::Attrib),
            (AddWatchFlags::IN_CLOSE_WRITE, EventKind::Modify),
            (AddWatchFlags::IN_CREATE, EventKind::Create),
            (AddWatchFlags::IN_DELETE, EventKind::Delete),
        ];
        for (mask, want) in cases.into_iter() {
            let (events, overflow) = translate(vec![raw(1, mask, 0, "f")]);
            assert!(!overflow);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, want);
            assert_eq!(events[0].name, Some(OsString::from("f")));
            assert!(!events[0].is_dir);
        }
    }

    #[test]
    fn isdir_flag_carries_through() {
        let (events, _) = translate(vec![raw(
            1,
            AddWatchFlags::IN_CREATE | AddWatchFlags::IN_ISDIR,
            0,
            "sub",
        )]);
        assert!(events[0].is_dir);
        assert_eq!(events[0].kind, EventKind::Create);
    }

    #[test]
    fn same_dir_rename_fuses_into_move() {
        let (events, _) = translate(vec![
            raw(1, AddWatchFlags::IN_MOVED_FROM, 7, "old"),
            raw(1, AddWatchFlags::IN_MOVED_TO, 7, "new"),
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Move);
        assert_eq!(events[0].name, Some(OsString::from("old")));
        assert_eq!(events[0].name2, Some(OsString::from("new")));
    }

    #[test]
    fn cross_dir_rename_stays_split() {
        let (events, _) = translate(vec![
            raw(1, AddWatchFlags::IN_MOVED_FROM, 7, "old"),
            raw(2, AddWatchFlags::IN_MOVED_TO, 7, "new"),
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].wd, events[0].kind), (1, EventKind::MoveFrom));
        assert_eq!((events[1].wd, events[1].kind), (2, EventKind::MoveTo));
    }

    #[test]
    fn unpaired_moves_surface_as_halves() {
        let (events, _) = translate(vec![
            raw(1, AddWatchFlags::IN_MOVED_FROM, 7, "gone"),
            raw(1, AddWatchFlags::IN_CREATE, 0, "f"),
            raw(1, AddWatchFlags::IN_MOVED_TO, 9, "arrived"),
        ]);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::MoveFrom, EventKind::Create, EventKind::MoveTo]);
    }

    #[test]
    fn mismatched_cookies_do_not_pair() {
        let (events, _) = translate(vec![
            raw(1, AddWatchFlags::IN_MOVED_FROM, 7, "a"),
            raw(1, AddWatchFlags::IN_MOVED_TO, 8, "b"),
        ]);
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::MoveFrom, EventKind::MoveTo]);
    }

    #[test]
    fn overflow_is_flagged() {
        let (events, overflow) = translate(vec![RawEvent::<i32> {
            wd: -1,
            mask: AddWatchFlags::IN_Q_OVERFLOW,
            cookie: 0,
            name: None,
        }]);
        assert!(overflow);
        assert!(events.is_empty());
    }

    #[test]
    #[timeout(30000)]
    fn live_instance_reports_file_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watcher = InotifyWatcher::new().unwrap();
        let wd = watcher.add_watch(tmp.path()).unwrap();

        fs::write(tmp.path().join("f.txt"), b"hello").unwrap();

        let events = watcher.drain().unwrap();
        let kinds: Vec<(EventKind, Option<OsString>)> =
            events.iter().map(|e| (e.kind, e.name.clone())).collect();
        assert!(
            kinds.contains(&(EventKind::Create, Some(OsString::from("f.txt")))),
            "got {kinds:?}"
        );
        assert!(
            kinds.contains(&(EventKind::Modify, Some(OsString::from("f.txt")))),
            "got {kinds:?}"
        );
        for e in &events {
            assert_eq!(e.wd, wd);
        }
        assert!(!watcher.overflowed());
    }

    #[test]
    #[timeout(30000)]
    fn live_instance_pairs_renames() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("old"), b"x").unwrap();

        let mut watcher = InotifyWatcher::new().unwrap();
        watcher.add_watch(tmp.path()).unwrap();
        fs::rename(tmp.path().join("old"), tmp.path().join("new")).unwrap();

        let events = watcher.drain().unwrap();
        let moves: Vec<_> =
            events.iter().filter(|e| e.kind == EventKind::Move).collect();
        assert_eq!(moves.len(), 1, "got {events:?}");
        assert_eq!(moves[0].name, Some(OsString::from("old")));
        assert_eq!(moves[0].name2, Some(OsString::from("new")));
    }

    #[test]
    #[timeout(30000)]
    fn watching_a_file_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();

        let mut watcher = InotifyWatcher::new().unwrap();
        // IN_ONLYDIR makes the kernel reject non-directories
        assert!(watcher.add_watch(&file).is_err());
    }
}
