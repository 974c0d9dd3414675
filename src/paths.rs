//! Deterministic on-disk layout for key material.
//!
//! Filenames are pure functions of identifiers so the store rows and the
//! filesystem can always be reconciled without an index file.

use std::path::{Path, PathBuf};

pub fn root_key_path(data_dir: &Path, id: &str) -> PathBuf {
    data_dir.join(format!("ca-{id}-key.pem"))
}

pub fn root_cert_path(data_dir: &Path, id: &str) -> PathBuf {
    data_dir.join(format!("ca-{id}-cert.pem"))
}

pub fn intermediate_key_path(data_dir: &Path, id: &str) -> PathBuf {
    data_dir.join(format!("intermediate-{id}-key.pem"))
}

pub fn intermediate_cert_path(data_dir: &Path, id: &str) -> PathBuf {
    data_dir.join(format!("intermediate-{id}-cert.pem"))
}

pub fn leaf_key_path(data_dir: &Path, id: i64) -> PathBuf {
    data_dir.join(format!("leaf-{id}-key.pem"))
}

/// Derive a slug (`[a-z0-9-]+`) from an operator-facing display name:
/// lowercase, trim, whitespace becomes `-`, everything else outside the
/// slug alphabet is stripped, runs of dashes collapse.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.trim().to_lowercase().chars() {
        if c.is_whitespace() || c == '-' || c == '_' {
            if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        } else if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        }
        // anything else is dropped
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Slug with a base36 epoch-milliseconds suffix, used when the plain slug
/// would collide with an existing id.
pub fn slugify_with_suffix(name: &str, epoch_ms: i64) -> String {
    let base = slugify(name);
    let suffix = to_base36(epoch_ms.max(0) as u64);
    if base.is_empty() {
        suffix
    } else {
        format!("{base}-{suffix}")
    }
}

fn to_base36(mut n: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 alphabet is ascii")
}
