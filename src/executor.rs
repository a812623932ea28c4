//! Parallel execution of artifact computations.
//!
//! Levels of the artifact graph are executed in order; inside a level, the
//! unit of dispatch is the co-output group: every artifact that decided to
//! run and shares a `cmd` string is satisfied by a single `sh -c` child.
//! Freshness decisions, hashing, and sidecar rewrites all happen on worker
//! threads; the level boundary is the only barrier.

use crate::{
    error::{DvxError, Result},
    freshness::FreshnessCheck,
    graph::{Artifact, Graph},
    hash,
    hash_cache::HashCacheDb,
    scm::Scm,
    sidecar::{self, SidecarContent},
    store::ObjectStore,
    utils,
};
use rayon::prelude::*;
use std::{
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Stderr is truncated to this many characters in result summaries.
const STDERR_SNIPPET_CHARS: usize = 200;

/// How often the wait loop polls a child for exit or cancellation.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Configuration for one executor run.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Worker threads; defaults to available hardware parallelism.
    pub jobs: Option<usize>,
    /// Make all decisions but execute nothing.
    pub dry_run: bool,
    /// Re-run everything regardless of freshness.
    pub force: bool,
    /// Artifacts matching any of these run regardless of freshness.
    pub force_patterns: Vec<glob::Pattern>,
    /// Artifacts matching any of these are skipped even when stale.
    pub cached_patterns: Vec<glob::Pattern>,
    /// Record deps and code_ref in rewritten sidecars.
    pub provenance: bool,
    /// Also ingest produced outputs into the object store.
    pub populate_store: bool,
    /// Working directory for commands and relative paths; defaults to the
    /// process working directory.
    pub work_dir: Option<PathBuf>,
    /// Cooperative cancellation: when raised, no new commands are dispatched
    /// and outstanding children are terminated.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            jobs: None,
            dry_run: false,
            force: false,
            force_patterns: Vec::new(),
            cached_patterns: Vec::new(),
            provenance: true,
            populate_store: false,
            work_dir: None,
            cancel: None,
        }
    }
}

/// Outcome for one artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    /// Command ran and the sidecar was rewritten.
    Executed,
    /// Nothing to do (fresh, cached by pattern, ...).
    Skipped,
    /// Dry-run verdict: the artifact would have run.
    WouldRun,
    Failed,
}

/// Result of executing (or deciding about) one artifact.
#[derive(Clone, Debug)]
pub struct ExecResult {
    pub path: String,
    pub status: ExecStatus,
    pub reason: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.status != ExecStatus::Failed
    }

    fn new(path: &str, status: ExecStatus, reason: impl Into<String>) -> Self {
        Self { path: path.to_string(), status, reason: reason.into(), duration: Duration::ZERO }
    }
}

#[derive(Clone, Debug)]
struct Decision {
    run: bool,
    forced: bool,
    reason: String,
}

/// Drives a resolved graph to completion.
pub struct Executor<'a> {
    store: &'a ObjectStore,
    hash_cache: &'a HashCacheDb,
    scm: Option<&'a dyn Scm>,
    config: ExecConfig,
    work_dir: PathBuf,
    /// Captured once per run so every sidecar written by this run carries the
    /// same provenance commit.
    code_ref: Option<String>,
}

impl<'a> Executor<'a> {
    pub fn new(
        store: &'a ObjectStore,
        hash_cache: &'a HashCacheDb,
        scm: Option<&'a dyn Scm>,
        config: ExecConfig,
    ) -> Self {
        let work_dir = config
            .work_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let code_ref = if config.provenance { scm.and_then(Scm::head_sha) } else { None };
        Self { store, hash_cache, scm, config, work_dir, code_ref }
    }

    /// Executes every computation in the graph, level by level.
    ///
    /// Per-artifact failures land in the results; a failed level finishes
    /// draining and then aborts all following levels. Cycles abort before
    /// anything is dispatched.
    pub fn run(&self, graph: &Graph) -> Result<Vec<ExecResult>> {
        let levels = graph.levels()?;
        if levels.is_empty() {
            debug!("no computations to execute");
            return Ok(Vec::new());
        }

        let total: usize = levels.iter().map(Vec::len).sum();
        debug!(levels = levels.len(), computations = total, "execution plan");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs())
            .build()
            .map_err(|err| DvxError::msg(format!("failed to start worker pool: {err}")))?;

        let mut results = Vec::with_capacity(total);
        for (index, level) in levels.iter().enumerate() {
            trace!(level = index + 1, artifacts = level.len(), "executing level");
            let level_results = self.execute_level(&pool, level);
            let failed = level_results.iter().any(|r| r.status == ExecStatus::Failed);
            results.extend(level_results);
            if failed {
                warn!(level = index + 1, "level failed, aborting remaining levels");
                break;
            }
        }
        Ok(results)
    }

    fn jobs(&self) -> usize {
        self.config.jobs.unwrap_or_else(num_cpus::get).max(1)
    }

    fn freshness(&self) -> FreshnessCheck<'_> {
        FreshnessCheck::new(self.store, self.hash_cache, self.scm, &self.work_dir)
    }

    /// Decision ladder for one artifact: force patterns, cached patterns,
    /// global force, then the freshness engine.
    fn decide(&self, artifact: &Artifact) -> Decision {
        let path = artifact.path.as_str();
        if utils::matches_any(path, &self.config.force_patterns) {
            return Decision { run: true, forced: true, reason: "forced by pattern".into() };
        }
        if utils::matches_any(path, &self.config.cached_patterns) {
            return Decision { run: false, forced: false, reason: "cached by pattern".into() };
        }
        if self.config.force {
            return Decision { run: true, forced: true, reason: "forced".into() };
        }
        let report = self.freshness().check(Path::new(path));
        if report.is_fresh() {
            Decision { run: false, forced: false, reason: report.reason }
        } else {
            Decision { run: true, forced: false, reason: report.reason }
        }
    }

    fn execute_level(&self, pool: &rayon::ThreadPool, level: &[&Artifact]) -> Vec<ExecResult> {
        // hashing for decisions happens off the main thread
        let decisions: Vec<Decision> =
            pool.install(|| level.par_iter().map(|artifact| self.decide(artifact)).collect());

        let mut slots: Vec<Option<ExecResult>> = vec![None; level.len()];
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();

        for (index, (artifact, decision)) in level.iter().zip(&decisions).enumerate() {
            if self.config.dry_run {
                let result = if decision.run {
                    let reason =
                        if decision.forced { "would run (forced)" } else { "would run" };
                    ExecResult::new(&artifact.path, ExecStatus::WouldRun, reason)
                } else {
                    ExecResult::new(&artifact.path, ExecStatus::Skipped, &decision.reason)
                };
                slots[index] = Some(result);
                continue;
            }
            if !decision.run {
                trace!(path = %artifact.path, reason = %decision.reason, "skipping");
                slots[index] =
                    Some(ExecResult::new(&artifact.path, ExecStatus::Skipped, &decision.reason));
                continue;
            }
            match &artifact.computation {
                Some(computation) => groups.entry(computation.cmd.as_str()).or_default().push(index),
                None => {
                    slots[index] =
                        Some(ExecResult::new(&artifact.path, ExecStatus::Skipped, "leaf"));
                }
            }
        }

        if !self.config.dry_run && !groups.is_empty() {
            let groups: Vec<(&str, Vec<usize>)> = groups.into_iter().collect();
            let outcomes: Vec<Vec<(usize, ExecResult)>> = pool.install(|| {
                groups
                    .par_iter()
                    .map(|(cmd, members)| self.execute_group(cmd, members, level))
                    .collect()
            });
            for (index, result) in outcomes.into_iter().flatten() {
                slots[index] = Some(result);
            }
        }

        slots.into_iter().flatten().collect()
    }

    /// Runs one co-output group: a single child process satisfies every
    /// member; the first member is the leader whose result carries the
    /// command failure, the rest fail as co-outputs.
    fn execute_group(
        &self,
        cmd: &str,
        members: &[usize],
        level: &[&Artifact],
    ) -> Vec<(usize, ExecResult)> {
        if self.cancelled() {
            return members
                .iter()
                .map(|&i| (i, ExecResult::new(&level[i].path, ExecStatus::Failed, "cancelled")))
                .collect();
        }

        debug!(cmd, outputs = members.len(), "spawning command");
        let shell = run_shell(cmd, &self.work_dir, self.config.cancel.as_deref());

        let shell = match shell {
            Ok(shell) => shell,
            Err(err) => {
                let reason = format!("command failed: {err}");
                return members
                    .iter()
                    .map(|&i| {
                        (i, ExecResult::new(&level[i].path, ExecStatus::Failed, reason.clone()))
                    })
                    .collect();
            }
        };

        if !shell.success {
            let reason = format!("command failed: {}", stderr_snippet(&shell));
            return members
                .iter()
                .enumerate()
                .map(|(pos, &i)| {
                    let mut result = if pos == 0 {
                        ExecResult::new(&level[i].path, ExecStatus::Failed, reason.clone())
                    } else {
                        ExecResult::new(&level[i].path, ExecStatus::Failed, "co-output build failed")
                    };
                    result.duration = shell.duration;
                    (i, result)
                })
                .collect();
        }

        members
            .iter()
            .map(|&i| {
                let artifact = level[i];
                let mut result = match self.finalize(artifact, cmd) {
                    Ok(result) => result,
                    Err(err) => {
                        ExecResult::new(&artifact.path, ExecStatus::Failed, err.to_string())
                    }
                };
                result.duration = shell.duration;
                (i, result)
            })
            .collect()
    }

    /// After a successful command: verify the output exists, hash it,
    /// optionally ingest it, and rewrite the sidecar.
    fn finalize(&self, artifact: &Artifact, cmd: &str) -> Result<ExecResult> {
        let output = self.resolve(&artifact.path);
        if !output.exists() {
            return Ok(ExecResult::new(&artifact.path, ExecStatus::Failed, "output not produced"));
        }

        let Some(hashed) = self.hash_cache.hash_cached(&output, hash::hash_path)? else {
            return Ok(ExecResult::new(&artifact.path, ExecStatus::Failed, "output not produced"));
        };

        let is_dir = output.is_dir();
        if self.config.populate_store {
            if is_dir {
                self.store.put_dir(&output, false)?;
            } else {
                self.store.put_blob(&output, &hashed.digest, false)?;
            }
        }

        let (code_ref, deps) = if self.config.provenance {
            (self.code_ref.clone(), self.current_dep_hashes(artifact))
        } else {
            (None, BTreeMap::new())
        };

        sidecar::write_sidecar(
            &output,
            &SidecarContent {
                digest: Some(hashed.digest),
                size: Some(hashed.size),
                is_dir: Some(is_dir),
                nfiles: None,
                cmd: Some(cmd.to_string()),
                code_ref,
                deps,
            },
        )?;

        trace!(path = %artifact.path, "completed");
        Ok(ExecResult::new(&artifact.path, ExecStatus::Executed, "completed"))
    }

    /// Current hashes of the artifact's declared deps, for provenance.
    ///
    /// Goes through the mtime cache; dependencies produced by earlier levels
    /// were hashed when their sidecars were rewritten, so this is cheap.
    fn current_dep_hashes(&self, artifact: &Artifact) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();
        let Some(computation) = &artifact.computation else {
            return hashes;
        };
        for dep in &computation.deps {
            let resolved = self.resolve(&dep.path);
            match self.hash_cache.hash_cached(&resolved, hash::hash_path) {
                Ok(Some(hashed)) => {
                    hashes.insert(dep.path.clone(), hashed.digest);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(dep = %dep.path, %err, "failed to hash dependency");
                }
            }
        }
        hashes
    }

    fn cancelled(&self) -> bool {
        self.config.cancel.as_ref().map(|flag| flag.load(Ordering::Relaxed)).unwrap_or(false)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.work_dir.join(p)
        }
    }
}

struct ShellOutput {
    success: bool,
    stderr: String,
    duration: Duration,
}

/// Runs an opaque shell string, capturing stderr to an unlinked temp file so
/// the wait loop can poll for exit and cancellation without pipe-buffer
/// deadlocks.
fn run_shell(cmd: &str, cwd: &Path, cancel: Option<&AtomicBool>) -> Result<ShellOutput> {
    let stderr_file =
        tempfile::tempfile().map_err(|err| DvxError::io(err, PathBuf::from("<stderr capture>")))?;
    let stderr_child = stderr_file
        .try_clone()
        .map_err(|err| DvxError::io(err, PathBuf::from("<stderr capture>")))?;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_child));

    let start = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|err| DvxError::CommandFailed {
            artifact: PathBuf::from(cmd),
            stderr: err.to_string(),
        })?;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if cancel.map(|flag| flag.load(Ordering::Relaxed)).unwrap_or(false) {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(ShellOutput {
                        success: false,
                        stderr: "cancelled".into(),
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(CHILD_POLL_INTERVAL);
            }
            Err(err) => {
                let _ = child.kill();
                return Err(DvxError::CommandFailed {
                    artifact: PathBuf::from(cmd),
                    stderr: err.to_string(),
                });
            }
        }
    };
    let duration = start.elapsed();

    let mut stderr = String::new();
    let mut handle = stderr_file;
    let _ = handle.seek(SeekFrom::Start(0));
    let _ = handle.read_to_string(&mut stderr);

    Ok(ShellOutput { success: status.success(), stderr, duration })
}

fn stderr_snippet(shell: &ShellOutput) -> String {
    let trimmed = shell.stderr.trim();
    if trimmed.is_empty() {
        return "exit status non-zero".into();
    }
    trimmed.chars().take(STDERR_SNIPPET_CHARS).collect()
}
