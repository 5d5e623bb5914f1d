//! Task fingerprints: a single hash over a task's command, dependency keys,
//! declared outputs, and input contents.  Two runs that hash the same are
//! interchangeable, which is what makes cached outputs reusable.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::Serialize;

use anyhow::Context;

use crate::graph::Task;
use crate::stamp::StampCache;

type Blake2b256 = Blake2b<U32>;

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize]);
        out.push(HEX[(b & 0xf) as usize]);
    }
    String::from_utf8(out).unwrap()
}

/// BLAKE2b-256 of a byte slice, as lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

/// BLAKE2b-256 of a file's contents, as lowercase hex.
pub fn hash_file(path: &str) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut hasher = Blake2b256::new();
    std::io::copy(&mut file, &mut hasher).with_context(|| format!("read {:?}", path))?;
    Ok(to_hex(&hasher.finalize()))
}

#[derive(Serialize)]
struct KeyInput {
    path: String,
    digest: String,
}

/// Canonical payload hashed into the task key.  Field order and JSON
/// rendering are part of the cache contract: changing either changes every
/// key.
#[derive(Serialize)]
struct KeyPayload<'a> {
    v: u32,
    command: &'a str,
    dependencies: Vec<String>,
    outputs: Vec<String>,
    inputs: Vec<KeyInput>,
}

/// Computes a task's fingerprint: `(key_hex, canonical_bytes)`.
///
/// Dependency keys and output specs are sorted so the key is insensitive to
/// declaration order.  Input digests come from the stamp cache when the
/// file's metadata is unchanged; otherwise the file is hashed and the cache
/// updated.
pub fn compute_task_key(
    task: &Task,
    dep_task_keys: &[String],
    stamps: &StampCache,
) -> anyhow::Result<(String, Vec<u8>)> {
    let mut dep_keys = dep_task_keys.to_vec();
    dep_keys.sort();

    let mut outputs: Vec<String> = task
        .outputs
        .iter()
        .map(|out| out.strip_prefix("./").unwrap_or(out).to_string())
        .collect();
    outputs.sort();

    // Expansion yields a sorted list already.
    let expanded = crate::paths::expand_specs(&task.inputs).context("expand inputs")?;

    let mut inputs = Vec::with_capacity(expanded.len());
    for path in expanded {
        // Fast path: reuse the cached digest when file metadata is unchanged.
        let digest = match stamps.lookup(&path) {
            Some(digest) => digest,
            None => {
                let digest = hash_file(&path).with_context(|| format!("hash input {:?}", path))?;
                stamps.update(&path, digest.clone());
                digest
            }
        };
        inputs.push(KeyInput { path, digest });
    }

    let payload = KeyPayload {
        v: 1,
        command: &task.command,
        dependencies: dep_keys,
        outputs,
        inputs,
    };

    let canonical = serde_json::to_vec(&payload)?;
    Ok((hash_bytes(&canonical), canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Task;

    fn task_in(dir: &std::path::Path, inputs: &[&str]) -> Task {
        Task {
            id: "t".to_string(),
            command: "cat x".to_string(),
            inputs: inputs
                .iter()
                .map(|p| dir.join(p).to_str().unwrap().to_string())
                .collect(),
            outputs: vec!["y".to_string()],
            dependencies: Vec::new(),
            cache: true,
        }
    }

    #[test]
    fn blake2b_256_known_answer() {
        // blake2b-256("abc")
        assert_eq!(
            hash_bytes(b"abc"),
            "bddd813c634239723171ef3fee98579b94964e3bb1cb3e427262c8c068d52319"
        );
    }

    #[test]
    fn canonical_bytes_shape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), b"abc").unwrap();
        let stamps = StampCache::new(dir.path().join("stamps.json"));
        let task = task_in(dir.path(), &["x"]);

        let (key, canonical) = compute_task_key(&task, &[], &stamps).unwrap();
        let text = String::from_utf8(canonical.clone()).unwrap();
        let input_path = dir.path().join("x");
        let expected = format!(
            "{{\"v\":1,\"command\":\"cat x\",\"dependencies\":[],\"outputs\":[\"y\"],\
             \"inputs\":[{{\"path\":{},\"digest\":\
             \"bddd813c634239723171ef3fee98579b94964e3bb1cb3e427262c8c068d52319\"}}]}}",
            serde_json::to_string(input_path.to_str().unwrap()).unwrap(),
        );
        assert_eq!(text, expected);
        assert_eq!(key, hash_bytes(&canonical));
    }

    #[test]
    fn key_stable_across_runs_and_content_reverts() {
        let dir = tempfile::tempdir().unwrap();
        let x = dir.path().join("x");
        std::fs::write(&x, b"abc").unwrap();
        let stamps = StampCache::new(dir.path().join("stamps.json"));
        let task = task_in(dir.path(), &["x"]);

        let (k1, c1) = compute_task_key(&task, &[], &stamps).unwrap();
        let (k1b, c1b) = compute_task_key(&task, &[], &stamps).unwrap();
        assert_eq!(k1, k1b);
        assert_eq!(c1, c1b);

        // The rewrites keep the size, so put them in distinct mtime ticks or
        // the stamp cache could legitimately serve the stale digest.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&x, b"abd").unwrap();
        let (k2, _) = compute_task_key(&task, &[], &stamps).unwrap();
        assert_ne!(k1, k2);

        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&x, b"abc").unwrap();
        let (k3, _) = compute_task_key(&task, &[], &stamps).unwrap();
        assert_eq!(k1, k3);
    }

    #[test]
    fn key_sensitive_to_command_outputs_and_deps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), b"abc").unwrap();
        let stamps = StampCache::new(dir.path().join("stamps.json"));
        let task = task_in(dir.path(), &["x"]);

        let (base, _) = compute_task_key(&task, &[], &stamps).unwrap();

        let mut other = task.clone();
        other.command = "cat x > y".to_string();
        let (k, _) = compute_task_key(&other, &[], &stamps).unwrap();
        assert_ne!(base, k);

        let mut other = task.clone();
        other.outputs = vec!["z".to_string()];
        let (k, _) = compute_task_key(&other, &[], &stamps).unwrap();
        assert_ne!(base, k);

        let (k, _) = compute_task_key(&task, &["d".repeat(64)], &stamps).unwrap();
        assert_ne!(base, k);
    }

    #[test]
    fn dep_key_and_output_order_does_not_matter() {
        let dir = tempfile::tempdir().unwrap();
        let stamps = StampCache::new(dir.path().join("stamps.json"));
        let mut task = task_in(dir.path(), &[]);
        task.outputs = vec!["b".to_string(), "a".to_string()];

        let deps_ab = ["a".repeat(64), "b".repeat(64)];
        let deps_ba = ["b".repeat(64), "a".repeat(64)];
        let (k1, _) = compute_task_key(&task, &deps_ab, &stamps).unwrap();

        task.outputs = vec!["a".to_string(), "./b".to_string()];
        let (k2, _) = compute_task_key(&task, &deps_ba, &stamps).unwrap();
        assert_eq!(k1, k2);
    }
}
