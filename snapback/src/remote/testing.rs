//! In-memory stand-in for a remote host, for pipeline tests.
//!
//! Interprets the handful of commands the pipeline issues (`mkdir -p`,
//! `rm -fR`, `find … -printf`, `mv`) plus the rsync invocation, against a
//! map of directory paths to ctimes.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use super::process::{CommandOutput, CommandRunner};
use crate::utils::errors::CommandError;

/// Position of the first remote word in an ssh argv built by `RemoteExecutor`.
const SSH_COMMAND_START: usize = 8;

struct Failure {
    needle: String,
    /// Matching calls to let through before failing.
    skip: usize,
    code: i32,
    stderr: String,
}

#[derive(Default)]
struct FakeState {
    dirs: BTreeMap<String, DateTime<Utc>>,
    now: Option<DateTime<Utc>>,
    calls: Vec<Vec<String>>,
    failures: Vec<Failure>,
    link_dests: Vec<Option<String>>,
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<FakeState>,
}

fn unquote(word: &str) -> String {
    match word.strip_prefix('\'').and_then(|w| w.strip_suffix('\'')) {
        Some(inner) => inner.replace("'\\''", "'"),
        None => word.to_string(),
    }
}

impl FakeRemote {
    pub fn new(now: DateTime<Utc>) -> Self {
        let remote = Self::default();
        remote.state.lock().unwrap().now = Some(now);
        remote
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state.lock().unwrap().now = Some(now);
    }

    pub fn add_dir(&self, path: &str, changed: DateTime<Utc>) {
        self.state.lock().unwrap().dirs.insert(path.to_string(), changed);
    }

    /// Fail any command whose remote words (or rsync argv) contain `needle`.
    pub fn fail_when(&self, needle: &str, code: i32, stderr: &str) {
        self.fail_after(needle, 0, code, stderr);
    }

    /// Like [`fail_when`](Self::fail_when), but the first `skip` matching calls succeed.
    pub fn fail_after(&self, needle: &str, skip: usize, code: i32, stderr: &str) {
        self.state.lock().unwrap().failures.push(Failure {
            needle: needle.to_string(),
            skip,
            code,
            stderr: stderr.to_string(),
        });
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains_key(path)
    }

    /// Names of the immediate children of `base`, sorted.
    pub fn children(&self, base: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        children_of(&state.dirs, base)
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// `--link-dest` argument of every rsync call, in order.
    pub fn link_dests(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().link_dests.clone()
    }
}

fn children_of(dirs: &BTreeMap<String, DateTime<Utc>>, base: &str) -> Vec<(String, DateTime<Utc>)> {
    let prefix = format!("{base}/");
    dirs.iter()
        .filter_map(|(path, changed)| {
            let rest = path.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| (rest.to_string(), *changed))
        })
        .collect()
}

fn remove_tree(dirs: &mut BTreeMap<String, DateTime<Utc>>, path: &str) {
    let prefix = format!("{path}/");
    dirs.retain(|p, _| p != path && !p.starts_with(&prefix));
}

impl FakeState {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn apply_remote(&mut self, words: &[String]) -> Result<String, (i32, String)> {
        let now = self.now();
        match words.first().map(String::as_str) {
            Some("mkdir") => {
                let path = words.last().cloned().unwrap_or_default();
                self.dirs.entry(path).or_insert(now);
                Ok(String::new())
            }
            Some("rm") => {
                for path in words.iter().skip(2) {
                    remove_tree(&mut self.dirs, path);
                }
                Ok(String::new())
            }
            Some("find") => {
                let base = &words[1];
                if !self.dirs.contains_key(base) {
                    return Err((1, format!("find: '{base}': No such file or directory")));
                }
                let mut out = String::new();
                for (name, changed) in children_of(&self.dirs, base) {
                    out.push_str(&format!(
                        "{}\t{}.{:09}\n",
                        name,
                        changed.timestamp(),
                        changed.timestamp_subsec_nanos()
                    ));
                }
                Ok(out)
            }
            Some("mv") => {
                let (from, to) = (&words[1], &words[2]);
                if !self.dirs.contains_key(from) {
                    return Err((1, format!("mv: cannot stat '{from}'")));
                }
                if self.dirs.contains_key(to) {
                    return Err((1, format!("mv: refusing to move into existing '{to}'")));
                }
                let prefix = format!("{from}/");
                let moved: Vec<(String, DateTime<Utc>)> = self
                    .dirs
                    .iter()
                    .filter(|(p, _)| p.starts_with(&prefix))
                    .map(|(p, c)| (format!("{to}/{}", &p[prefix.len()..]), *c))
                    .collect();
                remove_tree(&mut self.dirs, from);
                self.dirs.insert(to.clone(), now);
                self.dirs.extend(moved);
                Ok(String::new())
            }
            _ => Err((127, "command not found".to_string())),
        }
    }

    fn apply_rsync(&mut self, argv: &[String]) -> Result<String, (i32, String)> {
        let now = self.now();
        let link_dest = argv
            .iter()
            .find_map(|a| a.strip_prefix("--link-dest=").map(str::to_string));
        self.link_dests.push(link_dest);
        let dest = argv.last().cloned().unwrap_or_default();
        let Some((_, staging)) = dest.split_once(':') else {
            return Err((1, "bad destination".to_string()));
        };
        self.dirs.insert(staging.to_string(), now);
        self.dirs.insert(format!("{staging}/data"), now);
        Ok("Number of files: 12 (reg: 10, dir: 2)\nNumber of regular files transferred: 3\nTotal transferred file size: 4,096 bytes\n".to_string())
    }
}

impl CommandRunner for FakeRemote {
    async fn run(
        &self,
        argv: &[String],
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(argv.to_vec());

        let is_rsync = argv.first().map(|p| p.ends_with("rsync")).unwrap_or(false);
        let words: Vec<String> = if is_rsync {
            argv.to_vec()
        } else {
            argv.iter().skip(SSH_COMMAND_START).map(|w| unquote(w)).collect()
        };

        let joined = words.join(" ");
        let injected = state
            .failures
            .iter_mut()
            .find(|f| joined.contains(&f.needle))
            .and_then(|f| {
                if f.skip > 0 {
                    f.skip -= 1;
                    None
                } else {
                    Some((f.code, f.stderr.clone()))
                }
            });
        if let Some((code, stderr)) = injected {
            return Err(CommandError::Failed {
                argv: argv.to_vec(),
                code: Some(code),
                stdout: String::new(),
                stderr,
            });
        }

        let result = if is_rsync {
            state.apply_rsync(argv)
        } else {
            state.apply_remote(&words)
        };

        match result {
            Ok(stdout) => Ok(CommandOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            }),
            Err((code, stderr)) => Err(CommandError::Failed {
                argv: argv.to_vec(),
                code: Some(code),
                stdout: String::new(),
                stderr,
            }),
        }
    }
}

/// `now - days`, handy for seeding snapshot ages.
pub(crate) fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - TimeDelta::days(days)
}
