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

use std::time;

/// Debounce applied to every event unless the origin overrides it.
pub const DEFAULT_DELAY: time::Duration = time::Duration::from_secs(1);

/// Per-origin cap on concurrently running sync commands.
pub const DEFAULT_MAX_PROCESSES: usize = 1;

/// Accepted alongside max_processes for configuration compatibility.
pub const DEFAULT_MAX_ACTIONS: usize = 1;

/// How often the status file is rewritten when one is configured.
pub const DEFAULT_STATUS_INTERVAL: time::Duration = time::Duration::from_secs(10);

/// Sync command used when an origin does not configure one. `-lts`
/// keeps it cheap per event; the startup template adds `-r` for the
/// initial full-tree pass.
pub const DEFAULT_ACTION: &[&str] = &["rsync", "-lts", "--delete", "{source}", "{target}"];
pub const DEFAULT_STARTUP: &[&str] = &["rsync", "-ltsr", "--delete", "{source}/", "{target}/"];
