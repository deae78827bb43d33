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
    os::fd::{AsFd, IntoRawFd, OwnedFd},
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use anyhow::Context;
use nix::{errno::Errno, fcntl::OFlag, unistd};
use signal_hook::{consts::SIGCHLD, consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{error, info};

/// Termination handling: on the first TERM signal clean up the
/// droppings and exit gracefully, on the second exit immediately.
pub struct Handler {
    statusfile: Option<PathBuf>,
    pidfile: Option<PathBuf>,
}

impl Handler {
    pub fn new(statusfile: Option<PathBuf>, pidfile: Option<PathBuf>) -> Self {
        Handler { statusfile, pidfile }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        // Two-stage shutdown: the first TERM signal runs the cleanup
        // below, a repeat kills the process on the spot. A stuck
        // cleanup therefore cannot swallow a second ^C.
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            // The conditional shutdown stays inert while term_now is
            // false; only the flag registration right after it arms it.
            // Registered the other way around, the very first signal
            // would arm and terminate in one round.
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            // The loop only blocks for the first delivery; every path
            // through the body exits the process, which is why clippy's
            // never_loop lint has to be silenced.
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(TERM_SIGNALS.contains(&signal));

                for file in [&self.statusfile, &self.pidfile].into_iter().flatten() {
                    info!("term sig handler: removing {}", file.display());
                    if let Err(e) = std::fs::remove_file(file) {
                        error!("error removing {}: {}", file.display(), e);
                    }
                }

                info!("term sig handler: exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}

/// Route SIGCHLD into the host's poll loop through a self-pipe.
/// Returns the read end; the write end is owned by the signal handler
/// for the rest of the process lifetime.
pub fn sigchld_pipe() -> anyhow::Result<OwnedFd> {
    let (read_fd, write_fd) =
        unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("creating sigchld pipe")?;
    signal_hook::low_level::pipe::register_raw(SIGCHLD, write_fd.into_raw_fd())
        .context("registering SIGCHLD handler")?;
    Ok(read_fd)
}

/// Swallow whatever bytes have accumulated in the self-pipe so the
/// next poll blocks again.
pub fn drain_pipe(fd: &OwnedFd) {
    let mut buf = [0u8; 64];
    loop {
        match unistd::read(fd.as_fd(), &mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(Errno::EAGAIN) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!("error draining sigchld pipe: {}", err);
                break;
            }
        }
    }
}
