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

/*! A parser for the duration format used by the `delay` and
  `status_interval` configuration options.
*/

use anyhow::{anyhow, bail, Context};
use std::time;

/// Parses a duration string: a bare number of seconds ("5"), or a
/// number with a trailing unit ("250ms", "5s", "2m", "1h", "3d").
pub fn parse(src: &str) -> anyhow::Result<time::Duration> {
    let src = src.trim();
    if src.is_empty() {
        bail!("empty duration");
    }
    if src.chars().all(|c| c.is_ascii_digit()) {
        let secs = src.parse::<u64>().context("parsing duration as seconds")?;
        return Ok(time::Duration::from_secs(secs));
    }

    let split = src.find(|c: char| !c.is_ascii_digit()).unwrap_or(src.len());
    let (num, unit) = src.split_at(split);
    if num.is_empty() {
        bail!("duration '{}' has no numeric part", src);
    }
    let n = num.parse::<u64>().context("parsing numeric part of duration")?;
    make_unit_duration(n, unit).ok_or(anyhow!("unknown time unit '{}'", unit))
}

fn make_unit_duration(n: u64, unit: &str) -> Option<time::Duration> {
    match unit {
        "ms" => Some(time::Duration::from_millis(n)),
        "s" => Some(time::Duration::from_secs(n)),
        "m" => Some(time::Duration::from_secs(n * 60)),
        "h" => Some(time::Duration::from_secs(n * 60 * 60)),
        "d" => Some(time::Duration::from_secs(n * 60 * 60 * 24)),
        _ => None,
    }
}
