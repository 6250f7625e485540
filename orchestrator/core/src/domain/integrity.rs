// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Integrity Engine
//!
//! Content digests, deterministic identifiers and the Merkle tree that binds
//! a bundle's four artifacts to a single root.
//!
//! The tree convention is fixed and shared by the compiler and the agent:
//!
//! | Aspect | Rule |
//! |--------|------|
//! | Digest | SHA-256 |
//! | Leaves | raw 32-byte artifact digests, in bundle order |
//! | Internal node | `SHA-256(min(a, b) ‖ max(a, b))` (sorted pair) |
//! | Odd level | last node is paired with itself |
//! | Single leaf | the leaf is the root |
//! | Proof | sibling digests, leaf level first |
//!
//! Sorting each pair makes a proof independent of left/right position, so
//! verification only needs the sibling digests.

use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Length in bytes of every digest produced here.
pub const DIGEST_LEN: usize = 32;

/// Hex characters kept from the digest when deriving an identifier.
pub const ID_HEX_LEN: usize = 15;

/// Non-digit prefix so identifiers are valid flow-engine node ids.
pub const ID_PREFIX: char = 'n';

pub type Digest = [u8; DIGEST_LEN];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Merkle tree requires at least one leaf")]
    EmptyTree,

    #[error("Leaf index {index} out of range for {leaves} leaves")]
    LeafOutOfRange { index: usize, leaves: usize },

    #[error("Invalid digest encoding: {0}")]
    InvalidDigest(String),

    #[error("Artifact missing from bundle: {0}")]
    MissingArtifact(String),

    #[error("Unexpected entry in bundle archive: {0}")]
    UnexpectedEntry(String),

    #[error("Hash mismatch for {artifact}: declared {declared}, computed {computed}")]
    HashMismatch {
        artifact: String,
        declared: String,
        computed: String,
    },

    #[error("Size mismatch for {artifact}: declared {declared} bytes, found {actual}")]
    SizeMismatch {
        artifact: String,
        declared: u64,
        actual: u64,
    },

    #[error("Merkle root mismatch: declared {declared}, computed {computed}")]
    RootMismatch { declared: String, computed: String },

    #[error("Merkle proof for {0} does not verify against the declared root")]
    ProofRejected(String),

    #[error("Manifest {field} mismatch: bundle declares '{declared}', command carries '{expected}'")]
    ManifestMismatch {
        field: &'static str,
        declared: String,
        expected: String,
    },

    #[error("Malformed bundle: {0}")]
    Malformed(String),
}

/// SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> Digest {
    Sha256::digest(bytes).into()
}

pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(digest(bytes))
}

/// Decode a hex digest, rejecting anything that is not exactly 32 bytes.
pub fn decode_digest(value: &str) -> Result<Digest, IntegrityError> {
    let bytes = hex::decode(value).map_err(|e| IntegrityError::InvalidDigest(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| IntegrityError::InvalidDigest(format!("expected {DIGEST_LEN} bytes, got {}", b.len())))
}

/// Derive a stable identifier from ordered semantic components.
///
/// `deterministic_id(&["node", stage_id, template_node_id])` always yields
/// the same 16-character id: `n` followed by the first 15 hex characters of
/// `SHA-256("node|<stage>|<template node>")`.
pub fn deterministic_id(components: &[&str]) -> String {
    let joined = components.join("|");
    let hex = digest_hex(joined.as_bytes());
    format!("{ID_PREFIX}{}", &hex[..ID_HEX_LEN])
}

fn combine(a: &Digest, b: &Digest) -> Digest {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// Level 0 holds the leaves; the last level holds only the root.
    levels: Vec<Vec<Digest>>,
    root: Digest,
}

impl MerkleTree {
    pub fn build(leaves: &[Digest]) -> Result<Self, IntegrityError> {
        let Some(first) = leaves.first() else {
            return Err(IntegrityError::EmptyTree);
        };
        let mut root = *first;
        let mut levels = Vec::new();
        let mut current = leaves.to_vec();

        while current.len() > 1 {
            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| combine(&pair[0], &pair[pair.len() - 1]))
                .collect();
            root = next[0];
            levels.push(std::mem::replace(&mut current, next));
        }
        levels.push(current);

        Ok(Self { levels, root })
    }

    pub fn root(&self) -> Digest {
        self.root
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Sibling path for the leaf at `index`, leaf level first.
    pub fn proof(&self, index: usize) -> Result<Vec<Digest>, IntegrityError> {
        if index >= self.leaf_count() {
            return Err(IntegrityError::LeafOutOfRange {
                index,
                leaves: self.leaf_count(),
            });
        }

        let mut proof = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if idx % 2 == 0 {
                level.get(idx + 1).unwrap_or(&level[idx])
            } else {
                &level[idx - 1]
            };
            proof.push(*sibling);
            idx /= 2;
        }
        Ok(proof)
    }

    pub fn proof_hex(&self, index: usize) -> Result<Vec<String>, IntegrityError> {
        Ok(self.proof(index)?.iter().map(hex::encode).collect())
    }
}

/// Recompute the root from `leaf` and `proof` and compare it with `root`.
pub fn verify(leaf: &Digest, root: &Digest, proof: &[Digest]) -> bool {
    let computed = proof.iter().fold(*leaf, |acc, sibling| combine(&acc, sibling));
    &computed == root
}

/// Hex form of [`verify`]. Any decoding problem counts as a failed proof.
pub fn verify_hex(leaf: &str, root: &str, proof: &[String]) -> bool {
    let decoded = (|| -> Result<(Digest, Digest, Vec<Digest>), IntegrityError> {
        let leaf = decode_digest(leaf)?;
        let root = decode_digest(root)?;
        let proof = proof
            .iter()
            .map(|p| decode_digest(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((leaf, root, proof))
    })();

    match decoded {
        Ok((leaf, root, proof)) => verify(&leaf, &root, &proof),
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting undecodable Merkle proof");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(contents: &[&[u8]]) -> Vec<Digest> {
        contents.iter().map(|c| digest(c)).collect()
    }

    #[test]
    fn test_deterministic_id_is_stable() {
        let a = deterministic_id(&["flow", "channel-1"]);
        let b = deterministic_id(&["flow", "channel-1"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 1 + ID_HEX_LEN);
        assert!(a.starts_with(ID_PREFIX));
        assert!(a[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_deterministic_id_known_value() {
        // sha256("flow|abc") truncated to 15 hex chars
        let expected = format!("n{}", &digest_hex(b"flow|abc")[..15]);
        assert_eq!(deterministic_id(&["flow", "abc"]), expected);
    }

    #[test]
    fn test_deterministic_id_distinguishes_channels() {
        let ids: std::collections::HashSet<_> = (0..200)
            .map(|i| deterministic_id(&["flow", &format!("channel-{i}")]))
            .collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_empty_tree_rejected() {
        assert_eq!(MerkleTree::build(&[]), Err(IntegrityError::EmptyTree));
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(&[b"only"]);
        let tree = MerkleTree::build(&l).unwrap();
        assert_eq!(tree.root(), l[0]);
        assert!(tree.proof(0).unwrap().is_empty());
        assert!(verify(&l[0], &tree.root(), &[]));
    }

    #[test]
    fn test_every_leaf_verifies_for_all_sizes() {
        for n in 1..=9usize {
            let contents: Vec<Vec<u8>> = (0..n).map(|i| format!("artifact-{i}").into_bytes()).collect();
            let l: Vec<Digest> = contents.iter().map(|c| digest(c)).collect();
            let tree = MerkleTree::build(&l).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(verify(leaf, &tree.root(), &proof), "leaf {i} of {n}");
            }
        }
    }

    #[test]
    fn test_flipped_byte_changes_root_and_breaks_stale_proof() {
        let original: Vec<Vec<u8>> = vec![
            b"[{\"id\":\"n1\"}]".to_vec(),
            b"module.exports = {}".to_vec(),
            b"{\"version\":\"1\"}".to_vec(),
            b"{}".to_vec(),
        ];
        let l: Vec<Digest> = original.iter().map(|c| digest(c)).collect();
        let tree = MerkleTree::build(&l).unwrap();

        for i in 0..original.len() {
            for pos in 0..original[i].len() {
                let mut tampered = original.clone();
                tampered[i][pos] ^= 0x01;
                let tl: Vec<Digest> = tampered.iter().map(|c| digest(c)).collect();
                let tampered_tree = MerkleTree::build(&tl).unwrap();

                assert_ne!(tampered_tree.root(), tree.root());
                let stale = tree.proof(i).unwrap();
                assert!(!verify(&tl[i], &tree.root(), &stale));
            }
        }
    }

    #[test]
    fn test_proof_out_of_range() {
        let tree = MerkleTree::build(&leaves(&[b"a", b"b"])).unwrap();
        assert_eq!(
            tree.proof(2),
            Err(IntegrityError::LeafOutOfRange { index: 2, leaves: 2 })
        );
    }

    #[test]
    fn test_verify_hex_never_errors() {
        let l = leaves(&[b"a", b"b", b"c"]);
        let tree = MerkleTree::build(&l).unwrap();
        let proof = tree.proof_hex(1).unwrap();

        assert!(verify_hex(&hex::encode(l[1]), &tree.root_hex(), &proof));
        assert!(!verify_hex("not-hex", &tree.root_hex(), &proof));
        assert!(!verify_hex(&hex::encode(l[1]), "abcd", &proof));
        assert!(!verify_hex(&hex::encode(l[1]), &tree.root_hex(), &["zz".to_string()]));
        assert!(!verify_hex(&hex::encode(l[0]), &tree.root_hex(), &proof));
    }

    #[test]
    fn test_decode_digest_rejects_wrong_length() {
        assert!(matches!(decode_digest("abcd"), Err(IntegrityError::InvalidDigest(_))));
        assert!(decode_digest(&digest_hex(b"x")).is_ok());
    }
}
