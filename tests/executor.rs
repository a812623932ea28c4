//! End-to-end tests for graph execution: freshness-driven scheduling,
//! co-output deduplication, cycle handling, and level aborts.

use dvx::{
    graph::{Artifact, Computation, Dep},
    hash, sidecar, DvxError, ExecConfig, ExecStatus, Project,
};
use pretty_assertions::assert_eq;
use std::{fs, path::Path, path::PathBuf, time::Duration};

fn project() -> (tempfile::TempDir, Project) {
    let tmp = tempfile::Builder::new().prefix("dvx-exec").tempdir().unwrap();
    let project = Project::init(tmp.path()).unwrap();
    (tmp, project)
}

fn bump_mtime(path: &Path) {
    let f = fs::OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(std::time::SystemTime::now() + Duration::from_secs(5)).unwrap();
}

/// Declares `output` as produced by `cmd` from `deps`, writing its sidecar
/// (placeholder if the output does not exist yet). Returns the sidecar path
/// relative to the project root, the way targets are passed on.
fn declare(root: &Path, output: &str, cmd: &str, deps: &[&str]) -> PathBuf {
    let artifact = Artifact::computed(
        output,
        Computation::new(cmd).with_deps(deps.iter().map(|d| Dep::new(*d)).collect()),
    );
    artifact.write_sidecar(root, None).unwrap();
    PathBuf::from(format!("{output}.dvc"))
}

#[test]
fn dep_change_invalidates_and_rerun_repairs() {
    let (tmp, project) = project();
    let root = tmp.path();
    fs::write(root.join("in.txt"), "A").unwrap();

    let target = declare(root, "out.txt", "cat in.txt > out.txt", &["in.txt"]);

    // first run materializes the placeholder
    let results = project.run(&[target.clone()], ExecConfig::default()).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecStatus::Executed);
    assert_eq!(fs::read_to_string(root.join("out.txt")).unwrap(), "A");

    let verdicts = project.status(&[target.clone()]).unwrap();
    assert!(verdicts["out.txt"].is_fresh());

    // drift the input the way `echo "B" > in.txt` would
    fs::write(root.join("in.txt"), "B\n").unwrap();
    bump_mtime(&root.join("in.txt"));

    let verdicts = project.status(&[target.clone()]).unwrap();
    let report = &verdicts["out.txt"];
    assert!(!report.is_fresh());
    assert_eq!(report.reason, "dep changed: in.txt");

    // re-run repairs the output and records the new dep hash
    let results = project.run(&[target.clone()], ExecConfig::default()).unwrap();
    assert_eq!(results[0].status, ExecStatus::Executed);
    assert_eq!(fs::read_to_string(root.join("out.txt")).unwrap(), "B\n");

    let info = sidecar::read_sidecar(&root.join("out.txt")).unwrap().unwrap();
    let current_in = hash::hash_path(&root.join("in.txt")).unwrap().digest;
    assert_eq!(info.deps.get("in.txt"), Some(&current_in));
    assert_eq!(
        info.digest.as_deref(),
        Some(hash::hash_path(&root.join("out.txt")).unwrap().digest.as_str())
    );

    let verdicts = project.status(&[target]).unwrap();
    assert!(verdicts["out.txt"].is_fresh());
}

#[test]
fn second_run_is_idempotent() {
    let (tmp, project) = project();
    let root = tmp.path();
    fs::write(root.join("in.txt"), "payload").unwrap();
    let target = declare(root, "out.txt", "cat in.txt > out.txt", &["in.txt"]);

    let first = project.run(&[target.clone()], ExecConfig::default()).unwrap();
    assert_eq!(first[0].status, ExecStatus::Executed);
    let sidecar_bytes = fs::read(root.join("out.txt.dvc")).unwrap();
    let output_bytes = fs::read(root.join("out.txt")).unwrap();

    // nothing changed: every artifact reports up-to-date and the workspace
    // stays byte-identical
    let second = project.run(&[target], ExecConfig::default()).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].status, ExecStatus::Skipped);
    assert_eq!(second[0].reason, "up-to-date");
    assert_eq!(fs::read(root.join("out.txt.dvc")).unwrap(), sidecar_bytes);
    assert_eq!(fs::read(root.join("out.txt")).unwrap(), output_bytes);
}

#[test]
fn co_outputs_share_one_subprocess() {
    let (tmp, project) = project();
    let root = tmp.path();

    fs::write(root.join("counter.txt"), "0").unwrap();
    fs::write(root.join("in1.txt"), "one").unwrap();
    fs::write(root.join("in2.txt"), "two").unwrap();
    fs::write(
        root.join("make-pair.sh"),
        "count=$(cat counter.txt)\n\
         echo $((count + 1)) > counter.txt\n\
         echo out-one > out1.txt\n\
         echo out-two > out2.txt\n",
    )
    .unwrap();

    let cmd = "bash make-pair.sh";
    let t1 = declare(root, "out1.txt", cmd, &["in1.txt"]);
    let t2 = declare(root, "out2.txt", cmd, &["in2.txt"]);

    let scm = dvx::scm::StaticScm::with_head("run-sha");
    let project = project.with_scm(Box::new(scm));

    let results = project
        .run(&[t1, t2], ExecConfig { jobs: Some(4), ..Default::default() })
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ExecStatus::Executed));

    // the shared command ran exactly once
    assert_eq!(fs::read_to_string(root.join("counter.txt")).unwrap().trim(), "1");
    assert_eq!(fs::read_to_string(root.join("out1.txt")).unwrap().trim(), "out-one");
    assert_eq!(fs::read_to_string(root.join("out2.txt")).unwrap().trim(), "out-two");

    // both sidecars carry the run's code_ref but keep their own deps
    let info1 = sidecar::read_sidecar(&root.join("out1.txt")).unwrap().unwrap();
    let info2 = sidecar::read_sidecar(&root.join("out2.txt")).unwrap().unwrap();
    assert_eq!(info1.code_ref.as_deref(), Some("run-sha"));
    assert_eq!(info2.code_ref.as_deref(), Some("run-sha"));
    assert!(info1.deps.contains_key("in1.txt") && !info1.deps.contains_key("in2.txt"));
    assert!(info2.deps.contains_key("in2.txt") && !info2.deps.contains_key("in1.txt"));
}

#[test]
fn co_output_not_produced_fails_only_that_artifact() {
    let (tmp, project) = project();
    let root = tmp.path();
    fs::write(root.join("partial.sh"), "echo only-one > out1.txt\n").unwrap();

    let cmd = "bash partial.sh";
    let t1 = declare(root, "out1.txt", cmd, &[]);
    let t2 = declare(root, "out2.txt", cmd, &[]);

    let mut results = project.run(&[t1, t2], ExecConfig::default()).unwrap();
    results.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, ExecStatus::Executed);
    assert_eq!(results[1].status, ExecStatus::Failed);
    assert_eq!(results[1].reason, "output not produced");
}

#[test]
fn failing_command_fails_all_co_outputs() {
    let (tmp, project) = project();
    let root = tmp.path();

    let cmd = "echo boom >&2; exit 1";
    let t1 = declare(root, "out1.txt", cmd, &[]);
    let t2 = declare(root, "out2.txt", cmd, &[]);

    let mut results = project.run(&[t1, t2], ExecConfig::default()).unwrap();
    results.sort_by(|a, b| a.path.cmp(&b.path));
    assert!(results.iter().all(|r| r.status == ExecStatus::Failed));
    // the leader carries the stderr snippet, the follower fails as co-output
    let reasons: Vec<&str> = results.iter().map(|r| r.reason.as_str()).collect();
    assert!(reasons.iter().any(|r| r.contains("boom")));
    assert!(reasons.iter().any(|r| *r == "co-output build failed"));
}

#[test]
fn cycle_aborts_before_any_subprocess() {
    let (tmp, project) = project();
    let root = tmp.path();

    let mut deps_a = std::collections::BTreeMap::new();
    deps_a.insert("b.txt".to_string(), "00000000000000000000000000000000".to_string());
    sidecar::write_sidecar(
        &root.join("a.txt"),
        &sidecar::SidecarContent {
            cmd: Some("touch marker-a; touch a.txt".into()),
            deps: deps_a,
            ..Default::default()
        },
    )
    .unwrap();
    let mut deps_b = std::collections::BTreeMap::new();
    deps_b.insert("a.txt".to_string(), "00000000000000000000000000000000".to_string());
    sidecar::write_sidecar(
        &root.join("b.txt"),
        &sidecar::SidecarContent {
            cmd: Some("touch marker-b; touch b.txt".into()),
            deps: deps_b,
            ..Default::default()
        },
    )
    .unwrap();

    let err = project
        .run(
            &[PathBuf::from("a.txt.dvc"), PathBuf::from("b.txt.dvc")],
            ExecConfig::default(),
        )
        .unwrap_err();
    match err {
        DvxError::CycleDetected(nodes) => {
            assert_eq!(nodes.len(), 2);
        }
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    // no command was launched
    assert!(!root.join("marker-a").exists());
    assert!(!root.join("marker-b").exists());
}

#[test]
fn failed_level_aborts_following_levels() {
    let (tmp, project) = project();
    let root = tmp.path();

    // first exists but its command fails; second consumes it
    fs::write(root.join("first.txt"), "seed").unwrap();
    declare(root, "first.txt", "exit 7", &[]);
    let downstream =
        declare(root, "second.txt", "cat first.txt > second.txt", &["first.txt"]);

    let results = project
        .run(&[downstream], ExecConfig { force: true, ..Default::default() })
        .unwrap();
    // only the failing level drained; the dependent level never started
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "first.txt");
    assert_eq!(results[0].status, ExecStatus::Failed);
    assert!(!root.join("second.txt").exists());
}

#[test]
fn dry_run_decides_without_executing() {
    let (tmp, project) = project();
    let root = tmp.path();
    fs::write(root.join("in.txt"), "data").unwrap();
    let target = declare(root, "out.txt", "cat in.txt > out.txt", &["in.txt"]);

    let results = project
        .run(&[target.clone()], ExecConfig { dry_run: true, ..Default::default() })
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecStatus::WouldRun);
    assert_eq!(results[0].reason, "would run");
    assert!(!root.join("out.txt").exists());

    // forced dry-run reports the force distinctly
    let results = project
        .run(&[target], ExecConfig { dry_run: true, force: true, ..Default::default() })
        .unwrap();
    assert_eq!(results[0].status, ExecStatus::WouldRun);
    assert_eq!(results[0].reason, "would run (forced)");
}

#[test]
fn provenance_off_omits_deps_and_code_ref() {
    let (tmp, project) = project();
    let root = tmp.path();
    fs::write(root.join("in.txt"), "data").unwrap();
    let target = declare(root, "out.txt", "cat in.txt > out.txt", &["in.txt"]);

    let scm = dvx::scm::StaticScm::with_head("should-not-appear");
    let project = project.with_scm(Box::new(scm));

    let results = project
        .run(&[target], ExecConfig { provenance: false, ..Default::default() })
        .unwrap();
    assert_eq!(results[0].status, ExecStatus::Executed);

    let info = sidecar::read_sidecar(&root.join("out.txt")).unwrap().unwrap();
    // the command stays recorded for readability, provenance does not
    assert_eq!(info.cmd.as_deref(), Some("cat in.txt > out.txt"));
    assert_eq!(info.code_ref, None);
    assert!(info.deps.is_empty());
}

#[test]
fn run_in_add_mode_populates_the_store() {
    let (tmp, project) = project();
    let root = tmp.path();
    let target = declare(root, "out.txt", "printf hello-store > out.txt", &[]);

    let results = project
        .run(&[target], ExecConfig { populate_store: true, ..Default::default() })
        .unwrap();
    assert_eq!(results[0].status, ExecStatus::Executed);

    let digest = hash::hash_path(&root.join("out.txt")).unwrap().digest;
    let blob = project.store().path_for(&digest, false);
    assert_eq!(fs::read(&blob).unwrap(), b"hello-store");
}

#[test]
fn subprocess_count_equals_distinct_commands() {
    let (tmp, project) = project();
    let root = tmp.path();

    // every invocation of any command appends one line
    fs::write(root.join("spawns.log"), "").unwrap();
    let cmd_pair = "echo run >> spawns.log; touch p1.txt p2.txt";
    let cmd_solo = "echo run >> spawns.log; touch solo.txt";

    let t1 = declare(root, "p1.txt", cmd_pair, &[]);
    let t2 = declare(root, "p2.txt", cmd_pair, &[]);
    let t3 = declare(root, "solo.txt", cmd_solo, &[]);

    let results = project
        .run(&[t1, t2, t3], ExecConfig { jobs: Some(4), ..Default::default() })
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == ExecStatus::Executed));

    // three artifacts, two distinct commands, two subprocesses
    let spawns = fs::read_to_string(root.join("spawns.log")).unwrap();
    assert_eq!(spawns.lines().count(), 2);
}
