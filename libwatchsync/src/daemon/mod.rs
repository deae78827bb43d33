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
    collections::HashSet,
    fs, io,
    os::fd::{AsFd, OwnedFd},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};
use tracing::{error, info, instrument};

use crate::{config, consts, duration};

pub mod delay;
pub mod dispatch;
pub mod events;
pub mod inlet;
pub mod inotify;
pub mod origin;
pub mod sched;
pub mod signals;
pub mod status;
pub mod watch;

use delay::Delay;
use events::EventKind;
use inlet::Inlet;
use inotify::InotifyWatcher;
use origin::{OriginConfig, OriginId, OriginRegistry};
use watch::{WatchEvent, WatchTable, Watcher};

/// The single-threaded event pipeline: origins with their delay
/// queues, the watch table, and the watcher feeding them.
///
/// All mutation happens through the host-facing callbacks
/// ([`Runner::on_event`], [`Runner::on_alarm`],
/// [`Runner::collect_process`]); the host blocks between calls in a
/// sleep bounded by [`Runner::earliest_alarm`].
pub struct Runner<W: Watcher> {
    registry: OriginRegistry,
    watches: WatchTable<W>,
    watcher: W,
}

impl<W: Watcher> Runner<W> {
    pub fn new(watcher: W, registry: OriginRegistry) -> Runner<W> {
        Runner { registry, watches: WatchTable::new(), watcher }
    }

    /// Install watches over every origin tree and fire the configured
    /// startup actions. Returns the startup pids for the host to
    /// await; origins without a startup action warmstart instead.
    #[instrument(skip_all)]
    pub fn initialize(&mut self, now: Instant) -> anyhow::Result<Vec<Pid>> {
        if self.registry.is_empty() {
            bail!("nothing to watch: no origins configured");
        }

        self.watches.clear();
        for i in 0..self.registry.len() {
            let id = OriginId(i);
            // re-resolve in case the tree was replaced since the
            // configuration was loaded
            let source = fs::canonicalize(&self.registry.get(id).source).with_context(|| {
                format!(
                    "re-resolving source directory {}",
                    self.registry.get(id).source.display()
                )
            })?;
            let origin = self.registry.get_mut(id);
            origin.source = source;
            origin.reset();
        }

        for i in 0..self.registry.len() {
            let id = OriginId(i);
            watch::watch_directory(
                &mut self.watcher,
                &mut self.watches,
                &mut self.registry,
                id,
                Path::new(""),
                now,
            );
            let origin = self.registry.get(id);
            info!(
                source = %origin.source.display(), target = %origin.target,
                warmstart = origin.config.startup.is_none(),
                "origin is live"
            );
        }

        let mut pids = Vec::new();
        for i in 0..self.registry.len() {
            let origin = self.registry.get_mut(OriginId(i));
            let Some(action) = origin.config.startup.as_mut() else {
                continue;
            };
            let full_tree = Delay::new(EventKind::Create, PathBuf::new(), None, now);
            let inlet = Inlet::new(&origin.source, &origin.target, &full_tree);
            match action.invoke(&inlet) {
                Some(pid) => {
                    info!(pid = %pid, source = %origin.source.display(), "startup sync running");
                    pids.push(pid);
                }
                None => {
                    bail!("startup action for {} failed to spawn", origin.source.display())
                }
            }
        }
        Ok(pids)
    }

    /// Host callback: one raw filesystem event arrived.
    pub fn on_event(&mut self, ev: &WatchEvent<W::Wd>, now: Instant) {
        dispatch::on_event(&mut self.watcher, &mut self.watches, &mut self.registry, ev, now);
    }

    /// Host callback: the alarm returned by [`Self::earliest_alarm`]
    /// expired.
    pub fn on_alarm(&mut self, now: Instant) {
        sched::tick(&mut self.registry, now);
    }

    /// Host callback: a child exited.
    pub fn collect_process(&mut self, pid: Pid, status: i32) {
        sched::collect_process(&mut self.registry, pid, status);
    }

    /// When the host must wake up again, or `None` to sleep until an
    /// event or child exit arrives.
    pub fn earliest_alarm(&self) -> Option<Instant> {
        sched::earliest_alarm(&self.registry)
    }

    /// Host callback: write a human-readable status report.
    pub fn status_report(&self, out: &mut impl io::Write, now: Instant) -> io::Result<()> {
        status::write_report(out, &self.registry, &self.watches, now)
    }

    pub fn status_to_file(&self, path: &Path, now: Instant) -> anyhow::Result<()> {
        status::write_file(path, &self.registry, &self.watches, now)
    }

    pub fn registry(&self) -> &OriginRegistry {
        &self.registry
    }

    pub fn watcher(&self) -> &W {
        &self.watcher
    }

    pub fn watcher_mut(&mut self) -> &mut W {
        &mut self.watcher
    }
}

/// Build the origin registry and run the daemon until termination.
#[instrument(skip_all)]
pub fn run(config: config::Config, mirrors: Vec<String>, no_daemonize: bool) -> anyhow::Result<()> {
    let settings = config.settings.clone();
    let status_interval = match &settings.status_interval {
        Some(src) => duration::parse(src).context("settings.status_interval")?,
        None => consts::DEFAULT_STATUS_INTERVAL,
    };

    let mut registry = OriginRegistry::new();
    for decl in &config.origins {
        let origin_config = OriginConfig::resolve(decl, &config.defaults)?;
        registry.add(&decl.source, &decl.target, origin_config)?;
    }
    for pair in mirrors.chunks_exact(2) {
        let origin_config = OriginConfig::mirror(&config.defaults)?;
        registry.add(Path::new(&pair[0]), &pair[1], origin_config)?;
    }
    if registry.is_empty() {
        bail!("nothing to watch: no origins configured");
    }

    if !(no_daemonize || settings.nodaemon.unwrap_or(false)) {
        let mut daemonize = daemonize::Daemonize::new();
        if let Some(pidfile) = &settings.pidfile {
            daemonize = daemonize.pid_file(pidfile);
        }
        info!("forking into the background");
        daemonize.start().context("daemonizing")?;
    }

    info!("\n\n==================== watchsync daemon starting ====================\n\n");

    // termination handling runs on its own thread
    signals::Handler::new(settings.statusfile.clone(), settings.pidfile.clone()).spawn()?;
    let sigchld_rx = signals::sigchld_pipe()?;

    let watcher = InotifyWatcher::new()?;
    let mut runner = Runner::new(watcher, registry);

    let startup_pids = runner.initialize(Instant::now())?;
    if !startup_pids.is_empty() {
        wait_startup(startup_pids)?;
        info!("all startup syncs finished");
    }

    host_loop(&mut runner, sigchld_rx, settings.statusfile.as_deref(), status_interval)
}

/// Block until every startup child has exited. Any failure aborts
/// the daemon; a partially synced target must not go live.
fn wait_startup(pids: Vec<Pid>) -> anyhow::Result<()> {
    let mut remaining: HashSet<Pid> = pids.into_iter().collect();
    info!("waiting for {} startup sync(s)", remaining.len());
    while !remaining.is_empty() {
        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(pid, 0)) => {
                if remaining.remove(&pid) {
                    info!(pid = %pid, "startup sync finished");
                }
            }
            Ok(WaitStatus::Exited(pid, status)) => {
                if remaining.remove(&pid) {
                    bail!("startup sync (pid {pid}) exited with status {status}");
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                if remaining.remove(&pid) {
                    bail!("startup sync (pid {pid}) was killed by {signal}");
                }
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("waiting for startup syncs"),
        }
    }
    Ok(())
}

/// The cooperative host loop. All pipeline state is mutated here, on
/// this thread, between blocking polls on the inotify fd and the
/// SIGCHLD self-pipe.
fn host_loop(
    runner: &mut Runner<InotifyWatcher>,
    sigchld_rx: OwnedFd,
    statusfile: Option<&Path>,
    status_interval: Duration,
) -> anyhow::Result<()> {
    let mut next_status = statusfile.map(|_| Instant::now() + status_interval);

    loop {
        let now = Instant::now();
        let mut deadline = runner.earliest_alarm();
        if let Some(at) = next_status {
            deadline = Some(deadline.map_or(at, |d| d.min(at)));
        }
        // a deadline further out than the u16 timeout range just means
        // we sleep again after a spurious wakeup
        let timeout = match deadline {
            Some(at) => {
                let millis = at.saturating_duration_since(now).as_millis();
                PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
            }
            None => PollTimeout::NONE,
        };

        {
            let mut fds = [
                PollFd::new(runner.watcher().as_fd(), PollFlags::POLLIN),
                PollFd::new(sigchld_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err).context("polling event sources"),
            }
        }

        let now = Instant::now();
        let events = runner.watcher_mut().drain().context("reading filesystem events")?;
        if runner.watcher().overflowed() {
            error!("inotify event queue overflowed, the mirror can no longer be incremental");
            bail!("inotify event queue overflow");
        }
        for ev in &events {
            runner.on_event(ev, now);
        }

        signals::drain_pipe(&sigchld_rx);
        reap_children(runner);

        let now = Instant::now();
        if runner.earliest_alarm().is_some_and(|at| at <= now) {
            runner.on_alarm(now);
        }

        if let (Some(path), Some(due)) = (statusfile, next_status) {
            if due <= now {
                if let Err(err) = runner.status_to_file(path, now) {
                    error!("failed to write status file: {err:#}");
                }
                next_status = Some(now + status_interval);
            }
        }
    }
}

// Collect every child that has exited so far without blocking.
fn reap_children(runner: &mut Runner<InotifyWatcher>) {
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, status)) => runner.collect_process(pid, status),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                runner.collect_process(pid, 128 + signal as i32)
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!("error collecting children: {}", err);
                break;
            }
        }
    }
}
