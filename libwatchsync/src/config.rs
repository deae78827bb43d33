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

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::info;

pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("reading config toml ({config_path})"))?;
        config = toml::from_str(&config_str).context("parsing config file")?;
        info!("parsed explicitly passed in config ({})", config_path);
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("watchsync");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(&config_path).context("reading config toml")?;
            config = toml::from_str(&config_str).context("parsing config file")?;
            info!("parsed user config ({})", config_path.display());
        }
    }

    Ok(config)
}

/// The on-disk configuration. Unknown keys anywhere in the file are
/// a hard error; value validation happens when origins are resolved
/// against the defaults tier.
#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub defaults: Defaults,

    /// The watched trees. Each entry binds one source directory to
    /// one target identifier.
    #[serde(rename = "origin", default)]
    pub origins: Vec<OriginDecl>,
}

/// Process-wide settings.
#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Base verbosity of the daemon's log output. `-v` flags on the
    /// command line raise it further.
    pub loglevel: Option<LogLevel>,

    /// When set, a human-readable report of queues and running
    /// children is periodically written here.
    pub statusfile: Option<PathBuf>,

    /// How often to rewrite the status file. Only meaningful together
    /// with statusfile. By default, 10 seconds.
    pub status_interval: Option<String>,

    /// Where to record the daemon pid after forking into the
    /// background.
    pub pidfile: Option<PathBuf>,

    /// Stay in the foreground instead of daemonizing.
    pub nodaemon: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl LogLevel {
    /// Map the configured level onto a tracing level, with each `-v`
    /// on the command line raising it one step.
    pub fn tracing_level(self, verbose: u8) -> tracing::Level {
        let base = match self {
            LogLevel::Error => 0u8,
            LogLevel::Normal => 1,
            LogLevel::Verbose => 2,
            LogLevel::Debug => 3,
        };
        match base.saturating_add(verbose) {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

/// Fallbacks for per-origin fields, between the origin's own entry
/// and the built-in defaults.
#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Debounce window applied to incoming events ("500ms", "5s", ...).
    pub delay: Option<String>,

    /// How many sync commands may run concurrently per origin.
    pub max_processes: Option<usize>,

    /// Accepted for compatibility; currently unused.
    pub max_actions: Option<usize>,
}

/// One watched tree.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct OriginDecl {
    /// The local directory to watch. Resolved to a canonical absolute
    /// path at startup; failure to resolve is fatal.
    pub source: PathBuf,

    /// Opaque target identifier handed to actions, typically
    /// `host:/dir`. The event's relative path is appended to it.
    pub target: String,

    pub delay: Option<String>,

    pub max_processes: Option<usize>,

    pub max_actions: Option<usize>,

    /// Command template invoked per coalesced event. Placeholders:
    /// `{source}`, `{target}`, `{source2}`, `{target2}`, `{kind}`.
    /// Defaults to a built-in rsync invocation.
    pub action: Option<Vec<String>>,

    /// Command template run once at startup for the initial full-tree
    /// sync. When absent the origin starts in warmstart mode instead:
    /// synthetic Create events reconcile anything that changed while
    /// the daemon was down.
    pub startup: Option<Vec<String>>,

    /// Command template for moves. When absent, a move is split into
    /// a delete and a create.
    #[serde(rename = "move")]
    pub move_action: Option<Vec<String>>,
}
