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

//! The interactive terminal-multiplexing core: a local service that
//! spawns pseudo-terminal child processes on behalf of many clients,
//! fans their byte streams out to multiple concurrent WebSocket
//! viewers with per-viewer backpressure, replays scrollback on
//! reattach, and exposes a synchronous "run-to-completion" mode for
//! scraping an exit code out of an otherwise raw TTY stream.
//!
//! The public surface is deliberately small: [`config::Config`] and
//! [`config::read_config`] for startup, [`daemon::manager::SessionManager`]
//! as the one long-lived entry point, and [`daemon::endpoint::serve_connection`]
//! for wiring an accepted WebSocket up to it. Everything else is
//! implementation detail a caller of this crate shouldn't need to name.

pub mod config;
pub mod consts;
pub mod daemon;
pub mod error;
pub mod ids;
pub mod pty;
pub mod scrollback;
pub mod tty;
pub mod user;

pub use config::{read_config, Config};
pub use daemon::{
    compat::{run_compatibility_command, CompatibilityOutcome, CompatibilityRequest},
    endpoint::serve_connection,
    manager::{CreateSessionOptions, SessionManager, WaitForOutcome},
    signals::install_shutdown_handler,
};
pub use error::{Error, Result};
