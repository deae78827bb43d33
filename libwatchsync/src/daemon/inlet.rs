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
    path::{Path, PathBuf},
    process,
};

use anyhow::bail;
use nix::unistd::Pid;
use tracing::{debug, error};

use super::{delay::Delay, events::EventKind};

/// The narrow view of one pending event handed to an action.
///
/// Exposes only the event kind and the resolved source/target paths;
/// the borrow ties it to the invocation, so an action cannot retain
/// it past its return.
pub struct Inlet<'a> {
    source_root: &'a Path,
    target_root: &'a str,
    delay: &'a Delay,
}

impl<'a> Inlet<'a> {
    pub fn new(source_root: &'a Path, target_root: &'a str, delay: &'a Delay) -> Inlet<'a> {
        Inlet { source_root, target_root, delay }
    }

    pub fn kind(&self) -> EventKind {
        self.delay.kind
    }

    /// Absolute path of the event within the source tree.
    pub fn source_path(&self) -> PathBuf {
        self.source_root.join(&self.delay.path)
    }

    /// The opaque target identifier with the event's relative path
    /// appended.
    pub fn target_path(&self) -> String {
        join_target(self.target_root, &self.delay.path)
    }

    /// Move destination within the source tree, when present.
    pub fn source_path2(&self) -> Option<PathBuf> {
        self.delay.path2.as_ref().map(|p| self.source_root.join(p))
    }

    /// Move destination on the target side, when present.
    pub fn target_path2(&self) -> Option<String> {
        self.delay.path2.as_ref().map(|p| join_target(self.target_root, p))
    }
}

// The target identifier is opaque (it is often `host:/dir`), so path
// joining is plain string concatenation.
fn join_target(target: &str, rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        return String::from(target);
    }
    if target.ends_with('/') {
        format!("{}{}", target, rel.display())
    } else {
        format!("{}/{}", target, rel.display())
    }
}

/// A user-supplied synchronization command. Invoked with one pending
/// event; returns the pid of the spawned child, or `None` when
/// nothing was spawned (the scheduler slot stays free).
pub trait Action {
    fn invoke(&mut self, inlet: &Inlet) -> Option<Pid>;
}

/// Adapter so a closure can serve as an [`Action`], mainly for
/// embedding and for tests.
pub struct FnAction<F>(pub F);

impl<F> Action for FnAction<F>
where
    F: FnMut(&Inlet) -> Option<Pid>,
{
    fn invoke(&mut self, inlet: &Inlet) -> Option<Pid> {
        (self.0)(inlet)
    }
}

/// The production action: an argv template whose `{source}`,
/// `{target}`, `{source2}`, `{target2}` and `{kind}` placeholders are
/// substituted per event before the command is spawned.
#[derive(Debug, Clone)]
pub struct CommandAction {
    prog: String,
    args: Vec<String>,
}

impl CommandAction {
    pub fn from_template(parts: &[String]) -> anyhow::Result<CommandAction> {
        let Some((prog, args)) = parts.split_first() else {
            bail!("action command template is empty");
        };
        if prog.contains('{') {
            bail!("placeholders are not allowed in the program name ({prog})");
        }
        Ok(CommandAction { prog: prog.clone(), args: args.to_vec() })
    }

    fn substitute(arg: &str, inlet: &Inlet) -> String {
        if !arg.contains('{') {
            return String::from(arg);
        }
        arg.replace("{source2}", &inlet.source_path2().unwrap_or_default().display().to_string())
            .replace("{target2}", &inlet.target_path2().unwrap_or_default())
            .replace("{source}", &inlet.source_path().display().to_string())
            .replace("{target}", &inlet.target_path())
            .replace("{kind}", inlet.kind().name())
    }

    fn build(&self, inlet: &Inlet) -> process::Command {
        let mut cmd = process::Command::new(&self.prog);
        cmd.args(self.args.iter().map(|a| Self::substitute(a, inlet)));
        cmd
    }
}

impl Action for CommandAction {
    fn invoke(&mut self, inlet: &Inlet) -> Option<Pid> {
        match self.build(inlet).spawn() {
            Ok(child) => {
                let pid = Pid::from_raw(child.id() as i32);
                debug!(
                    prog = %self.prog, pid = %pid, kind = %inlet.kind(),
                    source = %inlet.source_path().display(),
                    "spawned action"
                );
                // the child is reaped through waitpid, not through the
                // std handle
                drop(child);
                Some(pid)
            }
            Err(err) => {
                error!(prog = %self.prog, "failed to spawn action: {err}");
                None
            }
        }
    }
}
