//! Per-artifact sidecar manifests (`<output>.dvc`).
//!
//! The sidecar is the wire format between sessions and between hosts via
//! source control: a small YAML file holding the output digest plus an
//! optional provenance block under `meta.computation`. A sidecar without
//! `md5`/`size` is a placeholder, meaning "declared but not yet produced" —
//! zero would be a valid hash or size, so absence is the only safe signal.

use crate::{
    error::{DvxError, Result},
    hash::{self, HASH_NAME},
    utils,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Parsed contents of a sidecar.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SidecarInfo {
    /// The `path` field of the first output (the basename of the artifact).
    pub path: String,
    /// Raw output digest without the `.dir` suffix; `None` for placeholders.
    pub digest: Option<String>,
    pub size: Option<u64>,
    pub is_dir: bool,
    pub nfiles: Option<u64>,
    /// The declared hash algorithm; absent fields read as `md5`.
    pub hash_name: String,
    pub cmd: Option<String>,
    pub code_ref: Option<String>,
    /// `dep path -> digest recorded at run time`.
    pub deps: BTreeMap<String, String>,
}

impl SidecarInfo {
    /// Whether the sidecar declares how to produce the artifact.
    pub fn has_computation(&self) -> bool {
        self.cmd.is_some() || !self.deps.is_empty()
    }

    /// A placeholder sidecar declares an artifact that has not been produced.
    pub fn is_placeholder(&self) -> bool {
        self.digest.is_none()
    }

    /// Serialized digest token, if a digest is recorded.
    pub fn digest_token(&self) -> Option<String> {
        self.digest.as_deref().map(|digest| hash::digest_token(digest, self.is_dir))
    }
}

/// Fields to record when (re)writing a sidecar.
///
/// `digest`/`size` of `None` produce a placeholder. `is_dir` of `None` is
/// auto-detected from the output on disk, and `nfiles` is counted for
/// directories when not supplied.
#[derive(Clone, Debug, Default)]
pub struct SidecarContent {
    pub digest: Option<String>,
    pub size: Option<u64>,
    pub is_dir: Option<bool>,
    pub nfiles: Option<u64>,
    pub cmd: Option<String>,
    pub code_ref: Option<String>,
    pub deps: BTreeMap<String, String>,
}

// On-disk schema. Field order inside `outs` entries is part of the format.
#[derive(Serialize)]
struct SidecarDoc {
    outs: Vec<OutEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<MetaBlock>,
}

#[derive(Serialize)]
struct OutEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    hash: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    nfiles: Option<u64>,
    path: String,
}

#[derive(Serialize)]
struct MetaBlock {
    computation: ComputationBlock,
}

#[derive(Serialize)]
struct ComputationBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_ref: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    deps: BTreeMap<String, String>,
}

/// Reads the sidecar for `target`, which may be the output path or the
/// sidecar path itself.
///
/// Returns `Ok(None)` when the sidecar does not exist, cannot be parsed, or
/// carries no outputs; unknown fields are ignored. Legacy layouts are
/// accepted on read: a top-level `computation` block, and the old
/// `meta.{cmd,deps}` form, in that priority order after `meta.computation`.
pub fn read_sidecar(target: &Path) -> Result<Option<SidecarInfo>> {
    let sidecar = if target.extension().map(|ext| ext == utils::SIDECAR_EXT).unwrap_or_default() {
        target.to_path_buf()
    } else {
        utils::sidecar_path(target)
    };
    if !sidecar.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&sidecar).map_err(|err| DvxError::io(err, &sidecar))?;
    let doc: serde_yaml::Value = match serde_yaml::from_str(&text) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(sidecar = %sidecar.display(), %err, "unparseable sidecar");
            return Ok(None);
        }
    };

    let Some(out) = doc.get("outs").and_then(|outs| outs.get(0)) else {
        return Ok(None);
    };

    let (digest, is_dir) = match out.get("md5").and_then(yaml_str) {
        Some(token) => {
            let (digest, is_dir) = hash::split_digest_token(&token);
            (Some(digest.to_string()), is_dir)
        }
        None => (None, false),
    };

    let meta = doc.get("meta");
    // priority: meta.computation, then top-level computation, then legacy meta.{cmd,deps}
    let computation = meta
        .and_then(|m| m.get("computation"))
        .or_else(|| doc.get("computation"))
        .or(meta);

    let mut deps = BTreeMap::new();
    if let Some(mapping) =
        computation.and_then(|c| c.get("deps")).and_then(serde_yaml::Value::as_mapping)
    {
        for (key, value) in mapping {
            if let (Some(path), Some(digest)) = (yaml_str(key), yaml_str(value)) {
                deps.insert(path, digest);
            }
        }
    }

    Ok(Some(SidecarInfo {
        path: out
            .get("path")
            .and_then(yaml_str)
            .unwrap_or_else(|| utils::output_path(&sidecar).display().to_string()),
        digest,
        size: out.get("size").and_then(serde_yaml::Value::as_u64),
        is_dir,
        nfiles: out.get("nfiles").and_then(serde_yaml::Value::as_u64),
        hash_name: out
            .get("hash")
            .and_then(yaml_str)
            .unwrap_or_else(|| HASH_NAME.to_string()),
        cmd: computation.and_then(|c| c.get("cmd")).and_then(yaml_str),
        code_ref: computation.and_then(|c| c.get("code_ref")).and_then(yaml_str),
        deps,
    }))
}

/// Writes the sidecar for `output_path` atomically, returning its path.
///
/// The recorded `path` field is the basename of the output, so the sidecar
/// stays valid when moved together with its neighbor.
pub fn write_sidecar(output_path: &Path, content: &SidecarContent) -> Result<PathBuf> {
    let sidecar = utils::sidecar_path(output_path);

    let is_dir = content
        .is_dir
        .unwrap_or_else(|| output_path.exists() && output_path.is_dir());

    let nfiles = if is_dir {
        match content.nfiles {
            Some(n) => Some(n),
            None if output_path.exists() => {
                Some(hash::walk_dir_files(output_path)?.len() as u64)
            }
            None => None,
        }
    } else {
        None
    };

    let basename = output_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| DvxError::msg(format!("no file name in {}", output_path.display())))?;

    let meta = (content.cmd.is_some() || content.code_ref.is_some() || !content.deps.is_empty())
        .then(|| MetaBlock {
            computation: ComputationBlock {
                cmd: content.cmd.clone(),
                code_ref: content.code_ref.clone(),
                deps: content.deps.clone(),
            },
        });

    let doc = SidecarDoc {
        outs: vec![OutEntry {
            md5: content.digest.as_deref().map(|digest| hash::digest_token(digest, is_dir)),
            size: content.size,
            hash: HASH_NAME,
            nfiles,
            path: basename,
        }],
        meta,
    };

    let yaml = serde_yaml::to_string(&doc)?;
    utils::atomic_write(&sidecar, yaml.as_bytes())?;
    trace!(sidecar = %sidecar.display(), "sidecar written");
    Ok(sidecar)
}

fn yaml_str(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        // tolerate digests or refs that a YAML parser read as numbers
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
