//! End-to-end tests for the add pathway and the object store invariants.

use dvx::{hash, sidecar, AddOptions, DvxError, Project};
use pretty_assertions::assert_eq;
use std::{fs, path::Path, time::Duration};

fn project() -> (tempfile::TempDir, Project) {
    let tmp = tempfile::Builder::new().prefix("dvx-add").tempdir().unwrap();
    let project = Project::init(tmp.path()).unwrap();
    (tmp, project)
}

/// Pushes a path's mtime into the future so the hash cache cannot mistake a
/// same-second rewrite for an unchanged file.
fn bump_mtime(path: &Path) {
    let f = fs::OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(std::time::SystemTime::now() + Duration::from_secs(5)).unwrap();
}

#[test]
fn add_small_file_writes_sidecar_and_store() {
    let (tmp, project) = project();
    let data = tmp.path().join("data.txt");
    fs::write(&data, "hello world").unwrap();

    let outcome = project.add(&data, &AddOptions::default()).unwrap();
    assert_eq!(outcome.digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    assert_eq!(outcome.size, 11);
    assert!(!outcome.is_dir);

    // the sidecar records digest, size, and the hash algorithm
    let info = sidecar::read_sidecar(&data).unwrap().unwrap();
    assert_eq!(info.path, "data.txt");
    assert_eq!(info.digest.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
    assert_eq!(info.size, Some(11));
    assert_eq!(info.hash_name, "md5");

    // the blob landed under the two-level prefix layout with identical bytes
    let blob = project
        .paths
        .cache_root
        .join("files/md5/5e/b63bbbe01eeed093cb22bb8f5acdc3");
    assert_eq!(fs::read(&blob).unwrap(), b"hello world");

    // invariant: reading back the stored blob reproduces the digest
    assert_eq!(hash::hash_path(&blob).unwrap().digest, outcome.digest);
}

#[test]
fn add_directory_is_order_independent() {
    let (tmp, project) = project();

    let first = tmp.path().join("dataset");
    fs::create_dir(&first).unwrap();
    fs::write(first.join("x.txt"), "x-bytes").unwrap();
    fs::write(first.join("y.txt"), "y-bytes").unwrap();
    let first_outcome = project.add(&first, &AddOptions::default()).unwrap();
    assert!(first_outcome.is_dir);

    // same contents created in the opposite order hash identically
    let second = tmp.path().join("mirror");
    fs::create_dir(&second).unwrap();
    fs::write(second.join("y.txt"), "y-bytes").unwrap();
    fs::write(second.join("x.txt"), "x-bytes").unwrap();
    let second_outcome = project.add(&second, &AddOptions::default()).unwrap();
    assert_eq!(first_outcome.digest, second_outcome.digest);

    // a third member changes the digest; deleting it restores the original
    fs::write(first.join("z.txt"), "z-bytes").unwrap();
    let with_extra = project.add(&first, &AddOptions { force: true, ..Default::default() }).unwrap();
    assert_ne!(with_extra.digest, second_outcome.digest);
    fs::remove_file(first.join("z.txt")).unwrap();
    let restored = project.add(&first, &AddOptions { force: true, ..Default::default() }).unwrap();
    assert_eq!(restored.digest, second_outcome.digest);

    // the manifest round-trips through the store, sorted by relpath
    let manifest = project.store().read_manifest(&restored.digest).unwrap();
    let relpaths: Vec<_> = manifest.iter().map(|e| e.relpath.as_str()).collect();
    assert_eq!(relpaths, vec!["x.txt", "y.txt"]);
    for entry in &manifest {
        let member = fs::read(project.store().path_for(&entry.md5, false)).unwrap();
        assert_eq!(hash::hash_bytes(&member), entry.md5);
    }
}

#[test]
fn add_missing_target_fails() {
    let (tmp, project) = project();
    let err = project.add(tmp.path().join("absent.bin"), &AddOptions::default()).unwrap_err();
    assert!(matches!(err, DvxError::NotFound(_)));
}

#[test]
fn add_refuses_stale_deps_without_recursive() {
    let (tmp, project) = project();
    let input = tmp.path().join("in.txt");
    fs::write(&input, "A").unwrap();
    project.add(&input, &AddOptions::default()).unwrap();
    let recorded = hash::hash_path(&input).unwrap().digest;

    let out = tmp.path().join("out.txt");
    fs::write(&out, "A").unwrap();
    let out_hash = hash::hash_path(&out).unwrap();
    let mut deps = std::collections::BTreeMap::new();
    deps.insert("in.txt".to_string(), recorded);
    sidecar::write_sidecar(
        &out,
        &sidecar::SidecarContent {
            digest: Some(out_hash.digest),
            size: Some(out_hash.size),
            cmd: Some("cat in.txt > out.txt".into()),
            deps,
            ..Default::default()
        },
    )
    .unwrap();

    // drift the input
    fs::write(&input, "B").unwrap();
    bump_mtime(&input);

    let err = project.add(&out, &AddOptions::default()).unwrap_err();
    match err {
        DvxError::StaleDeps { output, deps } => {
            assert!(output.ends_with("out.txt"));
            assert_eq!(deps.len(), 1);
            assert_eq!(deps[0].path, "in.txt");
            // hash prefixes of both sides are reported
            assert_eq!(deps[0].recorded.len(), 8);
            assert_eq!(deps[0].current.as_ref().unwrap().len(), 8);
        }
        other => panic!("expected StaleDeps, got {other:?}"),
    }

    // recursive mode re-adds the dependency depth-first and records the new
    // hashes
    let outcome = project.add(&out, &AddOptions { recursive: true, ..Default::default() }).unwrap();
    assert!(outcome.sidecar.exists());

    let refreshed = sidecar::read_sidecar(&out).unwrap().unwrap();
    let expected_dep = hash::hash_path(&input).unwrap().digest;
    assert_eq!(refreshed.deps.get("in.txt"), Some(&expected_dep));
    // the input's own sidecar was rewritten too
    let dep_info = sidecar::read_sidecar(&input).unwrap().unwrap();
    assert_eq!(dep_info.digest.as_deref(), Some(expected_dep.as_str()));
}

#[test]
fn add_many_isolates_failures() {
    let (tmp, project) = project();
    let good = tmp.path().join("good.txt");
    fs::write(&good, "fine").unwrap();
    let results = project.add_many(
        &[good.clone(), tmp.path().join("missing.txt")],
        &AddOptions::default(),
    );

    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(DvxError::NotFound(_))));
    // the sibling's sidecar still exists
    assert!(good.with_file_name("good.txt.dvc").exists());
}

#[test]
fn add_preserves_computation_block() {
    let (tmp, project) = project();
    let out = tmp.path().join("out.txt");
    fs::write(&out, "payload").unwrap();
    sidecar::write_sidecar(
        &out,
        &sidecar::SidecarContent {
            cmd: Some("make out.txt".into()),
            code_ref: Some("cafebabe".into()),
            ..Default::default()
        },
    )
    .unwrap();

    project.add(&out, &AddOptions::default()).unwrap();

    let info = sidecar::read_sidecar(&out).unwrap().unwrap();
    assert_eq!(info.cmd.as_deref(), Some("make out.txt"));
    assert_eq!(info.code_ref.as_deref(), Some("cafebabe"));
    assert_eq!(info.digest.as_deref(), Some(hash::hash_path(&out).unwrap().digest.as_str()));
}
