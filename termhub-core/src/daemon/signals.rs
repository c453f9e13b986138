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

//! Graceful shutdown on `SIGINT`/`SIGTERM` (spec §12): the binary's
//! only signal-handling concern is to call the Session Manager's
//! `shutdown()` before the process exits, so every session's child
//! gets a chance to exit cleanly instead of being orphaned.

use std::{
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::info;

use crate::daemon::manager::SessionManager;

/// Install a background thread that calls `manager.shutdown()` on the
/// first `SIGINT`/`SIGTERM` and exits the process on the second, so a
/// user mashing ^C during a slow shutdown isn't stuck waiting.
pub fn install_shutdown_handler(manager: Arc<SessionManager>) -> anyhow::Result<()> {
    info!("spawning signal handler thread");

    let term_now = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
        flag::register(*sig, Arc::clone(&term_now))?;
    }

    let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
    thread::Builder::new().name("signal-handler".to_string()).spawn(move || {
        #[allow(clippy::never_loop)]
        for signal in &mut signals {
            assert!(TERM_SIGNALS.contains(&signal));

            info!("term signal received, shutting down");
            manager.shutdown();
            std::process::exit(0);
        }
    })?;

    Ok(())
}
