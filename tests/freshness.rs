//! End-to-end tests for freshness verdicts and the mtime hash cache.

use dvx::{hash, sidecar, AddOptions, Freshness, Project};
use pretty_assertions::assert_eq;
use std::{fs, path::Path, path::PathBuf, time::Duration};

fn project() -> (tempfile::TempDir, Project) {
    let tmp = tempfile::Builder::new().prefix("dvx-fresh").tempdir().unwrap();
    let project = Project::init(tmp.path()).unwrap();
    (tmp, project)
}

fn bump_mtime(path: &Path) {
    let f = fs::OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(std::time::SystemTime::now() + Duration::from_secs(5)).unwrap();
}

#[test]
fn touch_only_stays_fresh_and_hits_the_cache() {
    let (tmp, project) = project();
    let data = tmp.path().join("data.txt");
    fs::write(&data, "hello world").unwrap();
    project.add(&data, &AddOptions::default()).unwrap();

    // touch: mtime bumps, bytes unchanged
    bump_mtime(&data);

    let report = project.freshness().check(&data);
    assert_eq!(report.state, Freshness::Fresh);
    assert_eq!(report.reason, "up-to-date");

    // the check above rehashed (mtime moved); from now on the cache answers
    let again = project.hash_artifact(&data).unwrap().unwrap();
    assert!(again.cached);
    assert_eq!(again.digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
}

#[test]
fn detailed_report_carries_digests_and_changed_deps() {
    let (tmp, project) = project();
    let root = tmp.path();

    let input = root.join("a.csv");
    fs::write(&input, "col\n1\n").unwrap();
    let other = root.join("b.csv");
    fs::write(&other, "col\n2\n").unwrap();

    let out = root.join("merged.csv");
    fs::write(&out, "col\n1\n2\n").unwrap();
    let out_hash = hash::hash_path(&out).unwrap();
    let mut deps = std::collections::BTreeMap::new();
    deps.insert("a.csv".to_string(), hash::hash_path(&input).unwrap().digest);
    deps.insert("b.csv".to_string(), hash::hash_path(&other).unwrap().digest);
    sidecar::write_sidecar(
        &out,
        &sidecar::SidecarContent {
            digest: Some(out_hash.digest.clone()),
            size: Some(out_hash.size),
            cmd: Some("merge a.csv b.csv > merged.csv".into()),
            code_ref: Some("deadbeef".into()),
            deps,
            ..Default::default()
        },
    )
    .unwrap();

    // drift both inputs; the report lists every changed dep
    fs::write(&input, "col\n9\n").unwrap();
    bump_mtime(&input);
    fs::write(&other, "col\n8\n").unwrap();
    bump_mtime(&other);

    let report = project.freshness().check(&out);
    assert_eq!(report.state, Freshness::Stale);
    assert_eq!(report.reason, "dep changed: a.csv");
    assert_eq!(report.changed_deps, vec!["a.csv".to_string(), "b.csv".to_string()]);
    assert_eq!(report.code_ref.as_deref(), Some("deadbeef"));
    assert_eq!(report.expected.as_deref(), Some(out_hash.digest.as_str()));
    // the output itself still matches
    assert_eq!(report.actual, report.expected);
}

#[test]
fn output_mismatch_reports_both_digests() {
    let (tmp, project) = project();
    let data = tmp.path().join("data.txt");
    fs::write(&data, "original").unwrap();
    project.add(&data, &AddOptions::default()).unwrap();
    let recorded = hash::hash_path(&data).unwrap().digest;

    fs::write(&data, "rewritten").unwrap();
    bump_mtime(&data);

    let report = project.freshness().check(&data);
    assert_eq!(report.state, Freshness::Stale);
    assert!(report.reason.starts_with("output hash mismatch"));
    assert_eq!(report.expected.as_deref(), Some(recorded.as_str()));
    assert_eq!(report.actual.as_deref(), Some(hash::hash_path(&data).unwrap().digest.as_str()));
}

#[test]
fn member_of_tracked_directory_is_checked_via_manifest() {
    let (tmp, project) = project();
    let dataset = tmp.path().join("dataset");
    fs::create_dir(&dataset).unwrap();
    fs::write(dataset.join("part-0.csv"), "rows-0").unwrap();
    fs::write(dataset.join("part-1.csv"), "rows-1").unwrap();
    project.add(&dataset, &AddOptions::default()).unwrap();

    // a member file has no sidecar of its own, yet is answerable
    let report = project.freshness().check(&dataset.join("part-0.csv"));
    assert_eq!(report.state, Freshness::Fresh);

    fs::write(dataset.join("part-0.csv"), "drifted").unwrap();
    bump_mtime(&dataset.join("part-0.csv"));
    let report = project.freshness().check(&dataset.join("part-0.csv"));
    assert_eq!(report.state, Freshness::Stale);

    // unknown members are an error, not stale
    fs::write(dataset.join("stray.csv"), "stray").unwrap();
    let report = project.freshness().check(&dataset.join("stray.csv"));
    assert_eq!(report.state, Freshness::Error);
    assert_eq!(report.reason, "not in manifest");
}

#[test]
fn status_reports_whole_graph_with_leaves() {
    let (tmp, project) = project();
    let root = tmp.path();
    fs::write(root.join("raw.txt"), "raw").unwrap();

    let out = root.join("cooked.txt");
    fs::write(&out, "cooked").unwrap();
    let out_hash = hash::hash_path(&out).unwrap();
    let mut deps = std::collections::BTreeMap::new();
    deps.insert("raw.txt".to_string(), hash::hash_path(&root.join("raw.txt")).unwrap().digest);
    sidecar::write_sidecar(
        &out,
        &sidecar::SidecarContent {
            digest: Some(out_hash.digest),
            size: Some(out_hash.size),
            cmd: Some("cook raw.txt > cooked.txt".into()),
            deps,
            ..Default::default()
        },
    )
    .unwrap();

    let verdicts = project.status(&[PathBuf::from("cooked.txt.dvc")]).unwrap();
    assert_eq!(verdicts.len(), 2);
    assert_eq!(verdicts["cooked.txt"].state, Freshness::Fresh);
    assert_eq!(verdicts["raw.txt"].state, Freshness::Fresh);
    assert_eq!(verdicts["raw.txt"].reason, "leaf node (no computation)");
}

#[test]
fn missing_output_is_reported_missing() {
    let (tmp, project) = project();
    let data = tmp.path().join("data.txt");
    fs::write(&data, "bytes").unwrap();
    project.add(&data, &AddOptions::default()).unwrap();
    fs::remove_file(&data).unwrap();

    let report = project.freshness().check(&data);
    assert_eq!(report.state, Freshness::Missing);
    assert_eq!(report.reason, "output missing");
}
