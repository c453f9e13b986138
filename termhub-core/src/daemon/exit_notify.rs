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
    sync::{Condvar, Mutex},
    time::Duration,
};

/// A child's terminal exit status: either a numeric exit code (normal
/// exit) or the signal that killed it, never both, matching the
/// `WIFEXITED`/`WIFSIGNALED` distinction `waitpid` reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        ExitStatus { code: Some(code), signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        ExitStatus { code: None, signal: Some(signal) }
    }
}

/// A condvar-backed single-shot notification of a child's exit status,
/// published by the reaper thread and observed by any number of
/// waiters without either side needing to poll a shared flag.
#[derive(Debug)]
pub struct ExitNotifier {
    slot: Mutex<Option<ExitStatus>>,
    cond: Condvar,
}

impl ExitNotifier {
    pub fn new() -> Self {
        ExitNotifier { slot: Mutex::new(None), cond: Condvar::new() }
    }

    pub fn notify_exit(&self, status: ExitStatus) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(status);
        self.cond.notify_all();
    }

    pub fn has_exited(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Wait for the exit notification, with an optional timeout to let
    /// the caller wake up periodically and re-check other conditions.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<ExitStatus> {
        let slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return *slot;
        }

        match timeout {
            Some(t) => {
                let (exit_status, wait_res) =
                    self.cond.wait_timeout_while(slot, t, |status| status.is_none()).unwrap();
                if wait_res.timed_out() {
                    None
                } else {
                    *exit_status
                }
            }
            None => *self.cond.wait_while(slot, |status| status.is_none()).unwrap(),
        }
    }
}

impl Default for ExitNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn wait_returns_immediately_if_already_exited() {
        let n = ExitNotifier::new();
        n.notify_exit(ExitStatus::exited(7));
        assert_eq!(n.wait(Some(Duration::from_millis(10))), Some(ExitStatus::exited(7)));
    }

    #[test]
    fn wait_times_out_when_no_notification_arrives() {
        let n = ExitNotifier::new();
        assert_eq!(n.wait(Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn wait_wakes_up_on_notification_from_another_thread() {
        let n = Arc::new(ExitNotifier::new());
        let n2 = Arc::clone(&n);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            n2.notify_exit(ExitStatus::signaled(9));
        });
        assert_eq!(n.wait(Some(Duration::from_secs(5))), Some(ExitStatus::signaled(9)));
        handle.join().unwrap();
    }
}
