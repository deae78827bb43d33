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
    fmt, fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use nix::unistd::Pid;
use tracing::debug;

use crate::{config, consts, duration};

use super::{
    delay::{Delay, DelayQueue},
    events::{CollapseTable, EventKind},
    inlet::{Action, CommandAction},
};

/// Effective per-origin configuration after the three-tier merge
/// (origin entry, then [defaults], then built-ins).
pub struct OriginConfig {
    pub delay: Duration,
    pub max_processes: usize,
    /// Accepted for compatibility; the scheduler does not consult it.
    pub max_actions: usize,
    pub collapse: CollapseTable,
    pub action: Box<dyn Action>,
    pub startup: Option<Box<dyn Action>>,
    pub move_action: Option<Box<dyn Action>>,
}

impl OriginConfig {
    /// Build the effective config for one declared origin.
    pub fn resolve(
        decl: &config::OriginDecl,
        defaults: &config::Defaults,
    ) -> anyhow::Result<OriginConfig> {
        let delay = match decl.delay.as_deref().or(defaults.delay.as_deref()) {
            Some(src) => duration::parse(src)
                .with_context(|| format!("delay for origin {}", decl.source.display()))?,
            None => consts::DEFAULT_DELAY,
        };
        let max_processes = decl
            .max_processes
            .or(defaults.max_processes)
            .unwrap_or(consts::DEFAULT_MAX_PROCESSES);
        if max_processes == 0 {
            bail!("max_processes for origin {} must be at least 1", decl.source.display());
        }
        let max_actions =
            decl.max_actions.or(defaults.max_actions).unwrap_or(consts::DEFAULT_MAX_ACTIONS);

        let action = match &decl.action {
            Some(template) => CommandAction::from_template(template)
                .with_context(|| format!("action for origin {}", decl.source.display()))?,
            None => builtin_template(consts::DEFAULT_ACTION),
        };
        let startup = decl
            .startup
            .as_deref()
            .map(|t| {
                CommandAction::from_template(t)
                    .with_context(|| format!("startup for origin {}", decl.source.display()))
            })
            .transpose()?;
        let move_action = decl
            .move_action
            .as_deref()
            .map(|t| {
                CommandAction::from_template(t)
                    .with_context(|| format!("move for origin {}", decl.source.display()))
            })
            .transpose()?;

        Ok(OriginConfig {
            delay,
            max_processes,
            max_actions,
            collapse: CollapseTable::default(),
            action: Box::new(action),
            startup: startup.map(|a| Box::new(a) as Box<dyn Action>),
            move_action: move_action.map(|a| Box::new(a) as Box<dyn Action>),
        })
    }

    /// Config for an origin added from the command line: built-in
    /// rsync templates with a startup full-tree pass.
    pub fn mirror(defaults: &config::Defaults) -> anyhow::Result<OriginConfig> {
        let delay = match defaults.delay.as_deref() {
            Some(src) => duration::parse(src).context("default delay")?,
            None => consts::DEFAULT_DELAY,
        };
        Ok(OriginConfig {
            delay,
            max_processes: defaults.max_processes.unwrap_or(consts::DEFAULT_MAX_PROCESSES),
            max_actions: defaults.max_actions.unwrap_or(consts::DEFAULT_MAX_ACTIONS),
            collapse: CollapseTable::default(),
            action: Box::new(builtin_template(consts::DEFAULT_ACTION)),
            startup: Some(Box::new(builtin_template(consts::DEFAULT_STARTUP))),
            move_action: None,
        })
    }
}

fn builtin_template(parts: &[&str]) -> CommandAction {
    let parts: Vec<String> = parts.iter().map(|s| String::from(*s)).collect();
    CommandAction::from_template(&parts).expect("built-in templates are well-formed")
}

impl fmt::Debug for OriginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginConfig")
            .field("delay", &self.delay)
            .field("max_processes", &self.max_processes)
            .field("max_actions", &self.max_actions)
            .field("startup", &self.startup.is_some())
            .field("move_action", &self.move_action.is_some())
            .finish_non_exhaustive()
    }
}

/// One configured (source tree, target identifier) binding together
/// with its pending delays and running children.
pub struct Origin {
    /// Canonical absolute path of the watched tree.
    pub source: PathBuf,
    /// Opaque target identifier, passed through to actions.
    pub target: String,
    pub config: OriginConfig,
    pub delays: DelayQueue,
    /// In-flight children, pid -> the delay being synced.
    pub processes: HashMap<Pid, Delay>,
}

impl Origin {
    /// Accept one event for this origin.
    ///
    /// A move on an origin without a move action is split into its
    /// delete and create halves; everything else is debounced into
    /// the delay queue.
    pub fn enqueue(
        &mut self,
        kind: EventKind,
        now: Instant,
        path: PathBuf,
        path2: Option<PathBuf>,
    ) {
        if kind == EventKind::Move && self.config.move_action.is_none() {
            debug!(
                path = %path.display(),
                "no move action configured, splitting move into delete and create"
            );
            let dest = path2.expect("move events carry a destination path");
            self.enqueue(EventKind::Delete, now, path, None);
            self.enqueue(EventKind::Create, now, dest, None);
            return;
        }
        let deadline = now + self.config.delay;
        self.delays.insert(kind, deadline, path, path2, &self.config.collapse);
    }

    pub fn has_capacity(&self) -> bool {
        self.processes.len() < self.config.max_processes
    }

    /// Drop all pending state, keeping the configuration. Used when
    /// watches are (re)installed.
    pub fn reset(&mut self) {
        self.delays.clear();
        self.processes.clear();
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Origin")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("queued", &self.delays.len())
            .field("running", &self.processes.len())
            .finish_non_exhaustive()
    }
}

/// Stable handle to an origin within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginId(pub usize);

/// All configured origins, in configuration order. Append-only while
/// configuration is loaded; membership never changes afterwards.
#[derive(Debug, Default)]
pub struct OriginRegistry {
    origins: Vec<Origin>,
}

impl OriginRegistry {
    pub fn new() -> OriginRegistry {
        OriginRegistry::default()
    }

    /// Add one origin. The source is resolved to a canonical absolute
    /// directory; failure to resolve is a configuration error.
    pub fn add(
        &mut self,
        source: &Path,
        target: &str,
        config: OriginConfig,
    ) -> anyhow::Result<OriginId> {
        let source = fs::canonicalize(source)
            .with_context(|| format!("resolving source directory {}", source.display()))?;
        if !source.is_dir() {
            bail!("source {} is not a directory", source.display());
        }
        self.origins.push(Origin {
            source,
            target: String::from(target),
            config,
            delays: DelayQueue::new(),
            processes: HashMap::new(),
        });
        Ok(OriginId(self.origins.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn get(&self, id: OriginId) -> &Origin {
        &self.origins[id.0]
    }

    pub fn get_mut(&mut self, id: OriginId) -> &mut Origin {
        &mut self.origins[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (OriginId, &Origin)> {
        self.origins.iter().enumerate().map(|(i, o)| (OriginId(i), o))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (OriginId, &mut Origin)> {
        self.origins.iter_mut().enumerate().map(|(i, o)| (OriginId(i), o))
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn test_origin(config: OriginConfig) -> Origin {
        Origin {
            source: PathBuf::from("/src"),
            target: String::from("host:/dst"),
            config,
            delays: DelayQueue::new(),
            processes: HashMap::new(),
        }
    }

    #[test]
    fn move_without_handler_splits() {
        let mut origin = test_origin(testutil::inert_config(Duration::ZERO, 1));
        let now = Instant::now();
        origin.enqueue(
            EventKind::Move,
            now,
            PathBuf::from("a/x"),
            Some(PathBuf::from("a/y")),
        );

        assert_eq!(origin.delays.len(), 2);
        let first = origin.delays.pop_head().unwrap();
        assert_eq!((first.kind, first.path.as_path()), (EventKind::Delete, Path::new("a/x")));
        let second = origin.delays.pop_head().unwrap();
        assert_eq!((second.kind, second.path.as_path()), (EventKind::Create, Path::new("a/y")));
    }

    #[test]
    fn move_split_matches_manual_delete_create() {
        let now = Instant::now();

        let mut via_move = test_origin(testutil::inert_config(Duration::from_secs(1), 1));
        via_move.enqueue(EventKind::Move, now, PathBuf::from("a"), Some(PathBuf::from("b")));

        let mut manual = test_origin(testutil::inert_config(Duration::from_secs(1), 1));
        manual.enqueue(EventKind::Delete, now, PathBuf::from("a"), None);
        manual.enqueue(EventKind::Create, now, PathBuf::from("b"), None);

        loop {
            let (l, r) = (via_move.delays.pop_head(), manual.delays.pop_head());
            match (l, r) {
                (None, None) => break,
                (Some(l), Some(r)) => {
                    assert_eq!(l.kind, r.kind);
                    assert_eq!(l.path, r.path);
                    assert_eq!(l.deadline, r.deadline);
                }
                (l, r) => panic!("queues diverge: {l:?} vs {r:?}"),
            }
        }
    }

    #[test]
    fn move_with_handler_is_kept_whole() {
        let mut config = testutil::inert_config(Duration::ZERO, 1);
        config.move_action =
            Some(Box::new(crate::daemon::inlet::FnAction(|_: &crate::daemon::inlet::Inlet| None::<Pid>)));
        let mut origin = test_origin(config);
        origin.enqueue(
            EventKind::Move,
            Instant::now(),
            PathBuf::from("a/x"),
            Some(PathBuf::from("a/y")),
        );

        assert_eq!(origin.delays.len(), 1);
        let head = origin.delays.pop_head().unwrap();
        assert_eq!(head.kind, EventKind::Move);
        assert_eq!(head.path2, Some(PathBuf::from("a/y")));
    }

    #[test]
    fn enqueue_applies_debounce_delay() {
        let mut origin = test_origin(testutil::inert_config(Duration::from_secs(5), 1));
        let now = Instant::now();
        origin.enqueue(EventKind::Modify, now, PathBuf::from("f"), None);
        let head = origin.delays.head().unwrap();
        assert_eq!(head.deadline, now + Duration::from_secs(5));
    }

    #[test]
    fn capacity_tracks_process_table() {
        let mut origin = test_origin(testutil::inert_config(Duration::ZERO, 2));
        assert!(origin.has_capacity());
        origin.processes.insert(
            Pid::from_raw(100),
            Delay::new(EventKind::Modify, PathBuf::from("f"), None, Instant::now()),
        );
        assert!(origin.has_capacity());
        origin.processes.insert(
            Pid::from_raw(101),
            Delay::new(EventKind::Modify, PathBuf::from("g"), None, Instant::now()),
        );
        assert!(!origin.has_capacity());
    }

    #[test]
    fn registry_preserves_order_and_resolves_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();

        let mut registry = OriginRegistry::new();
        registry.add(&a, "t-a", testutil::inert_config(Duration::ZERO, 1)).unwrap();
        registry.add(&b, "t-b", testutil::inert_config(Duration::ZERO, 1)).unwrap();

        assert_eq!(registry.len(), 2);
        let targets: Vec<&str> =
            registry.iter().map(|(_, o)| o.target.as_str()).collect();
        assert_eq!(targets, vec!["t-a", "t-b"]);
        for (_, origin) in registry.iter() {
            assert!(origin.source.is_absolute());
        }
    }

    #[test]
    fn registry_rejects_missing_source() {
        let mut registry = OriginRegistry::new();
        let res = registry.add(
            Path::new("/nonexistent/watchsync-test-dir"),
            "t",
            testutil::inert_config(Duration::ZERO, 1),
        );
        assert!(res.is_err());
    }

    #[test]
    fn resolve_merges_three_tiers() {
        let decl = config::OriginDecl {
            source: PathBuf::from("/src"),
            target: String::from("t"),
            delay: None,
            max_processes: Some(3),
            max_actions: None,
            action: None,
            startup: None,
            move_action: None,
        };
        let defaults = config::Defaults {
            delay: Some(String::from("2s")),
            max_processes: Some(7),
            max_actions: None,
        };
        let resolved = OriginConfig::resolve(&decl, &defaults).unwrap();
        assert_eq!(resolved.delay, Duration::from_secs(2)); // defaults tier
        assert_eq!(resolved.max_processes, 3); // origin tier
        assert_eq!(resolved.max_actions, consts::DEFAULT_MAX_ACTIONS); // built-in tier
        assert!(resolved.startup.is_none());
    }

    #[test]
    fn resolve_rejects_bad_delay() {
        let decl = config::OriginDecl {
            source: PathBuf::from("/src"),
            target: String::from("t"),
            delay: Some(String::from("soon")),
            max_processes: None,
            max_actions: None,
            action: None,
            startup: None,
            move_action: None,
        };
        assert!(OriginConfig::resolve(&decl, &config::Defaults::default()).is_err());
    }

    #[test]
    fn resolve_rejects_zero_max_processes() {
        let decl = config::OriginDecl {
            source: PathBuf::from("/src"),
            target: String::from("t"),
            delay: None,
            max_processes: Some(0),
            max_actions: None,
            action: None,
            startup: None,
            move_action: None,
        };
        assert!(OriginConfig::resolve(&decl, &config::Defaults::default()).is_err());
    }
}
