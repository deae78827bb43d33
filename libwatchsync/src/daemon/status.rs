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

use std::{fs, io, io::Write as _, path::Path, time::Instant};

use anyhow::Context;

use super::{
    origin::OriginRegistry,
    watch::{WatchTable, Watcher},
};

/// Write a human-readable snapshot of every origin's queue and
/// process table.
pub fn write_report<W: Watcher>(
    out: &mut impl io::Write,
    registry: &OriginRegistry,
    watches: &WatchTable<W>,
    now: Instant,
) -> io::Result<()> {
    writeln!(
        out,
        "watchsync status at {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(
        out,
        "{} origin(s), {} watched directories",
        registry.len(),
        watches.len()
    )?;

    for (_, origin) in registry.iter() {
        writeln!(out)?;
        writeln!(out, "origin {} -> {}", origin.source.display(), origin.target)?;
        writeln!(
            out,
            "  {} delayed, {}/{} running",
            origin.delays.len(),
            origin.processes.len(),
            origin.config.max_processes
        )?;
        for delay in origin.delays.iter() {
            let due = delay.deadline.saturating_duration_since(now);
            writeln!(
                out,
                "  delayed {:<8} {} (due in {:.1}s)",
                delay.kind.name(),
                delay.path.display(),
                due.as_secs_f64()
            )?;
        }
        for (pid, delay) in origin.processes.iter() {
            writeln!(
                out,
                "  running pid {} {:<8} {}",
                pid,
                delay.kind.name(),
                delay.path.display()
            )?;
        }
    }
    Ok(())
}

/// Rewrite the status file in place.
pub fn write_file<W: Watcher>(
    path: &Path,
    registry: &OriginRegistry,
    watches: &WatchTable<W>,
    now: Instant,
) -> anyhow::Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("creating status file {}", path.display()))?;
    write_report(&mut file, registry, watches, now).context("writing status report")?;
    file.flush().context("flushing status report")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::daemon::{
        events::EventKind,
        origin::testutil::inert_config,
        watch::{self, testutil::FakeWatcher},
    };
    use std::{path::PathBuf, time::Duration};

    #[test]
    fn report_lists_origins_and_delays() {
        let tmp = tempfile::tempdir().unwrap();
        let mut registry = OriginRegistry::new();
        let id = registry
            .add(tmp.path(), "backup:/dst", inert_config(Duration::from_secs(5), 2))
            .unwrap();
        let mut watcher = FakeWatcher::new();
        let mut table = WatchTable::new();
        let now = Instant::now();
        watch::watch_directory(
            &mut watcher,
            &mut table,
            &mut registry,
            id,
            Path::new(""),
            now,
        );
        registry.get_mut(id).enqueue(EventKind::Modify, now, PathBuf::from("a/x"), None);

        let mut buf = Vec::new();
        write_report(&mut buf, &registry, &table, now).unwrap();
        let report = String::from_utf8(buf).unwrap();

        assert!(report.contains("backup:/dst"), "{report}");
        assert!(report.contains("1 origin(s), 1 watched directories"), "{report}");
        assert!(report.contains("Modify"), "{report}");
        assert!(report.contains("a/x"), "{report}");
        assert!(report.contains("0/2 running"), "{report}");
    }

    #[test]
    fn file_is_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let status_path = tmp.path().join("status");
        let registry = OriginRegistry::new();
        let table: WatchTable<FakeWatcher> = WatchTable::new();

        write_file(&status_path, &registry, &table, Instant::now()).unwrap();
        let first = fs::read_to_string(&status_path).unwrap();
        assert!(first.contains("0 origin(s)"));

        write_file(&status_path, &registry, &table, Instant::now()).unwrap();
        assert!(fs::read_to_string(&status_path).unwrap().contains("watchsync status"));
    }
}
