//! Test doubles shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::alerts::{AlertError, SilenceId, SilenceManager, SilenceRequest};
use crate::confirm::{ConfirmError, Confirmer};
use crate::poll::PollSchedule;
use crate::reboot::{HostRebooter, RebootError};
use crate::remote::{RemoteCommand, RemoteError, RemoteExecutor};

#[derive(Debug, Clone)]
enum Scripted {
    Output(String),
    Failure { exit_code: i32, stderr: String },
}

struct Rule {
    pattern: String,
    responses: VecDeque<Scripted>,
}

/// Executor answering commands from a script.
///
/// A command is answered by the rule with the longest pattern contained in
/// its command line. Each rule replays its responses in order and keeps
/// repeating the last one. Unmatched commands return empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, response: Scripted) -> &Self {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.responses.push_back(response),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                responses: VecDeque::from([response]),
            }),
        }
        self
    }

    pub fn on(&self, pattern: &str, output: &str) -> &Self {
        self.push(pattern, Scripted::Output(output.to_string()))
    }

    pub fn fail(&self, pattern: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push(
            pattern,
            Scripted::Failure {
                exit_code,
                stderr: stderr.to_string(),
            },
        )
    }

    /// Every executed command as `host: command line`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    fn next_response(&self, line: &str) -> Option<Scripted> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .filter(|r| line.contains(&r.pattern))
            .max_by_key(|r| r.pattern.len())?;
        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, host: &str, command: &RemoteCommand) -> Result<String, RemoteError> {
        let line = command.command_line();
        self.calls.lock().unwrap().push(format!("{}: {}", host, line));

        match self.next_response(&line) {
            None => Ok(String::new()),
            Some(Scripted::Output(raw)) => Ok(command.postprocess(&raw)),
            Some(Scripted::Failure { exit_code, stderr }) => {
                if command.capture_errors {
                    return Ok(command.postprocess(&stderr));
                }
                Err(RemoteError::Failed {
                    host: host.to_string(),
                    command: line,
                    exit_code,
                    stderr,
                })
            }
        }
    }
}

/// In-memory silence store.
#[derive(Default)]
pub struct FakeSilences {
    created: Mutex<Vec<(SilenceId, SilenceRequest)>>,
    active: Mutex<HashSet<SilenceId>>,
    fail_after: Option<usize>,
}

impl FakeSilences {
    /// Accepts `n` silences, then fails every creation.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    pub fn created(&self) -> Vec<(SilenceId, SilenceRequest)> {
        self.created.lock().unwrap().clone()
    }

    pub fn is_active(&self, id: &SilenceId) -> bool {
        self.active.lock().unwrap().contains(id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[async_trait]
impl SilenceManager for FakeSilences {
    async fn create_silence(&self, request: &SilenceRequest) -> Result<SilenceId, AlertError> {
        let mut created = self.created.lock().unwrap();
        if self.fail_after.is_some_and(|n| created.len() >= n) {
            return Err(AlertError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let id = SilenceId::new(format!("silence-{}", created.len() + 1));
        created.push((id.clone(), request.clone()));
        self.active.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn remove_silence(&self, id: &SilenceId) -> Result<(), AlertError> {
        self.active.lock().unwrap().remove(id);
        Ok(())
    }
}

/// Records reboots; waits succeed unless `failing_waits` is set.
#[derive(Default)]
pub struct FakeRebooter {
    reboots: Mutex<Vec<String>>,
    failing_waits: Mutex<usize>,
}

impl FakeRebooter {
    pub fn failing_waits(n: usize) -> Self {
        Self {
            failing_waits: Mutex::new(n),
            ..Self::default()
        }
    }

    pub fn reboots(&self) -> Vec<String> {
        self.reboots.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostRebooter for FakeRebooter {
    async fn reboot(&self, host: &str) -> Result<DateTime<Utc>, RebootError> {
        self.reboots.lock().unwrap().push(host.to_string());
        Ok(Utc::now())
    }

    async fn wait_reboot_since(
        &self,
        host: &str,
        _since: DateTime<Utc>,
        schedule: PollSchedule,
    ) -> Result<(), RebootError> {
        let mut failing = self.failing_waits.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(RebootError::Timeout {
                host: host.to_string(),
                waited: schedule.timeout,
            });
        }
        Ok(())
    }
}

/// Rejects every confirmation.
pub struct RejectAll;

#[async_trait]
impl Confirmer for RejectAll {
    async fn confirm(&self, message: &str) -> Result<(), ConfirmError> {
        Err(ConfirmError::Aborted(message.to_string()))
    }
}
