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

//! Terminal-grid size, clamped to the bounds spec §3.1 requires, and
//! the ioctl plumbing to apply it to a real pty on Unix.

use serde_derive::{Deserialize, Serialize};

pub const MIN_COLS: u16 = 10;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 5;
pub const MAX_ROWS: u16 = 300;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub cols: u16,
    pub rows: u16,
}

impl Size {
    /// Clamp an arbitrary requested size into the valid grid range, as
    /// spec §8 requires on `resize` (as opposed to `createSession`,
    /// which rejects out-of-range values outright).
    pub fn clamped(cols: u16, rows: u16) -> Size {
        Size { cols: cols.clamp(MIN_COLS, MAX_COLS), rows: rows.clamp(MIN_ROWS, MAX_ROWS) }
    }

    pub fn in_range(cols: u16, rows: u16) -> bool {
        (MIN_COLS..=MAX_COLS).contains(&cols) && (MIN_ROWS..=MAX_ROWS).contains(&rows)
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::os::unix::io::RawFd;

    use anyhow::Context;
    use nix::sys::termios::{self, LocalFlags, SetArg};

    use super::Size;

    // see `man ioctl_tty` for info on these ioctl commands
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

    impl Size {
        /// Apply this size to the pty identified by `fd`.
        pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
            let term_size =
                libc::winsize { ws_row: self.rows, ws_col: self.cols, ws_xpixel: 0, ws_ypixel: 0 };
            unsafe {
                // Safety: term_size is stack-allocated and lives for
                // the duration of the call; fd is caller-owned.
                tiocswinsz(fd, &term_size).context("setting term size")?;
            }
            Ok(())
        }
    }

    /// Turn off local echo on the pty identified by `fd`. Used for the
    /// ephemeral sessions `runCompatibilityCommand` drives itself,
    /// where the caller wants the command's own output back, not a
    /// transcript of what was typed at it.
    pub fn disable_echo(fd: RawFd) -> anyhow::Result<()> {
        let mut term = termios::tcgetattr(fd).context("grabbing term flags")?;
        term.local_flags &= !LocalFlags::ECHO;
        termios::tcsetattr(fd, SetArg::TCSANOW, &term).context("disabling echo")?;
        Ok(())
    }
}

#[cfg(unix)]
pub use unix_impl::disable_echo;
