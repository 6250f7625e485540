// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bundle layout, manifest and integrity hashes.
//!
//! A bundle is four artifacts packed into `bundle.tgz`. [`BundleHashes`] is
//! computed once by the compiler and recomputed by the agent through the
//! same functions, so both sides agree bit for bit.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::integrity::{self, IntegrityError, MerkleTree};

pub const FLOWS_FILE: &str = "flows.json";
pub const SETTINGS_FILE: &str = "settings.js";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CREDENTIALS_MAP_FILE: &str = "credentials.map.json";
pub const ARCHIVE_FILE: &str = "bundle.tgz";

pub const BUNDLE_FORMAT_VERSION: &str = "1";

/// Merkle leaf order. Changing it invalidates every bundle in the field.
pub const ARTIFACT_ORDER: [&str; 4] = [FLOWS_FILE, SETTINGS_FILE, MANIFEST_FILE, CREDENTIALS_MAP_FILE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildMode {
    Test,
    Prod,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Test => write!(f, "TEST"),
            BuildMode::Prod => write!(f, "PROD"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestArtifacts {
    pub flows_json_path: String,
    pub settings_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_map_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub version: String,
    pub channel_id: String,
    pub build_id: String,
    pub mode: BuildMode,
    pub artifacts: ManifestArtifacts,
}

impl BundleManifest {
    pub fn new(channel_id: impl Into<String>, build_id: impl Into<String>, mode: BuildMode) -> Self {
        Self {
            version: BUNDLE_FORMAT_VERSION.to_string(),
            channel_id: channel_id.into(),
            build_id: build_id.into(),
            mode,
            artifacts: ManifestArtifacts {
                flows_json_path: FLOWS_FILE.to_string(),
                settings_path: SETTINGS_FILE.to_string(),
                credentials_map_path: Some(CREDENTIALS_MAP_FILE.to_string()),
            },
        }
    }

    /// Ensure the manifest describes the unit the command asked for.
    pub fn check_identity(&self, channel_id: &str, build_id: &str, mode: BuildMode) -> Result<(), IntegrityError> {
        if self.channel_id != channel_id {
            return Err(IntegrityError::ManifestMismatch {
                field: "channelId",
                declared: self.channel_id.clone(),
                expected: channel_id.to_string(),
            });
        }
        if self.build_id != build_id {
            return Err(IntegrityError::ManifestMismatch {
                field: "buildId",
                declared: self.build_id.clone(),
                expected: build_id.to_string(),
            });
        }
        if self.mode != mode {
            return Err(IntegrityError::ManifestMismatch {
                field: "mode",
                declared: self.mode.to_string(),
                expected: mode.to_string(),
            });
        }
        Ok(())
    }
}

/// The four artifact files, held in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub flows: Vec<u8>,
    pub settings: Vec<u8>,
    pub manifest: Vec<u8>,
    pub credentials_map: Vec<u8>,
}

impl fmt::Debug for ArtifactSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactSet")
            .field("flows", &self.flows.len())
            .field("settings", &self.settings.len())
            .field("manifest", &self.manifest.len())
            .field("credentials_map", &self.credentials_map.len())
            .finish()
    }
}

impl ArtifactSet {
    /// `(filename, contents)` in [`ARTIFACT_ORDER`].
    pub fn entries(&self) -> [(&'static str, &[u8]); 4] {
        [
            (FLOWS_FILE, self.flows.as_slice()),
            (SETTINGS_FILE, self.settings.as_slice()),
            (MANIFEST_FILE, self.manifest.as_slice()),
            (CREDENTIALS_MAP_FILE, self.credentials_map.as_slice()),
        ]
    }

    /// Assemble from named files; every artifact must be present.
    pub fn from_files(mut files: BTreeMap<String, Vec<u8>>) -> Result<Self, IntegrityError> {
        let mut take = |name: &str| {
            files
                .remove(name)
                .ok_or_else(|| IntegrityError::MissingArtifact(name.to_string()))
        };
        Ok(Self {
            flows: take(FLOWS_FILE)?,
            settings: take(SETTINGS_FILE)?,
            manifest: take(MANIFEST_FILE)?,
            credentials_map: take(CREDENTIALS_MAP_FILE)?,
        })
    }

    pub fn manifest(&self) -> Result<BundleManifest, IntegrityError> {
        serde_json::from_slice(&self.manifest).map_err(|e| IntegrityError::Malformed(format!("{MANIFEST_FILE}: {e}")))
    }

    pub fn credentials_map(&self) -> Result<CredentialsMap, IntegrityError> {
        serde_json::from_slice(&self.credentials_map)
            .map_err(|e| IntegrityError::Malformed(format!("{CREDENTIALS_MAP_FILE}: {e}")))
    }
}

/// node id -> credential key -> `${secret:NAME}` placeholder
pub type CredentialsMap = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactHash {
    pub filename: String,
    pub hash: String,
    pub size: u64,
    /// Sibling path from this artifact's leaf to the Merkle root.
    #[serde(default)]
    pub proof: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleHashes {
    pub flows: ArtifactHash,
    pub settings: ArtifactHash,
    pub manifest: ArtifactHash,
    pub credentials_map: ArtifactHash,
    /// Digest of the packaged `bundle.tgz`.
    pub bundle_hash: String,
    pub merkle_root: String,
}

impl BundleHashes {
    pub fn compute(artifacts: &ArtifactSet, archive: &[u8]) -> Result<Self, IntegrityError> {
        let entries = artifacts.entries();
        let leaves: Vec<_> = entries.iter().map(|(_, bytes)| integrity::digest(bytes)).collect();
        let tree = MerkleTree::build(&leaves)?;

        let hash_for = |i: usize| -> Result<ArtifactHash, IntegrityError> {
            let (name, bytes) = entries[i];
            Ok(ArtifactHash {
                filename: name.to_string(),
                hash: hex::encode(leaves[i]),
                size: bytes.len() as u64,
                proof: tree.proof_hex(i)?,
            })
        };

        Ok(Self {
            flows: hash_for(0)?,
            settings: hash_for(1)?,
            manifest: hash_for(2)?,
            credentials_map: hash_for(3)?,
            bundle_hash: integrity::digest_hex(archive),
            merkle_root: tree.root_hex(),
        })
    }

    /// Declared hashes in [`ARTIFACT_ORDER`].
    pub fn artifacts(&self) -> [&ArtifactHash; 4] {
        [&self.flows, &self.settings, &self.manifest, &self.credentials_map]
    }

    pub fn verify_archive(&self, archive: &[u8]) -> Result<(), IntegrityError> {
        let computed = integrity::digest_hex(archive);
        if computed != self.bundle_hash {
            return Err(IntegrityError::HashMismatch {
                artifact: ARCHIVE_FILE.to_string(),
                declared: self.bundle_hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Recompute every artifact digest, the Merkle root and each declared
    /// proof, failing on the first disagreement.
    pub fn verify_artifacts(&self, artifacts: &ArtifactSet) -> Result<(), IntegrityError> {
        let mut leaves = Vec::with_capacity(ARTIFACT_ORDER.len());

        for ((name, bytes), declared) in artifacts.entries().iter().zip(self.artifacts()) {
            if declared.filename != *name {
                return Err(IntegrityError::Malformed(format!(
                    "hash entry '{}' is out of order, expected '{}'",
                    declared.filename, name
                )));
            }
            let actual = bytes.len() as u64;
            if actual != declared.size {
                return Err(IntegrityError::SizeMismatch {
                    artifact: name.to_string(),
                    declared: declared.size,
                    actual,
                });
            }
            let leaf = integrity::digest(bytes);
            let computed = hex::encode(leaf);
            if computed != declared.hash {
                return Err(IntegrityError::HashMismatch {
                    artifact: name.to_string(),
                    declared: declared.hash.clone(),
                    computed,
                });
            }
            leaves.push(leaf);
        }

        let root = MerkleTree::build(&leaves)?.root_hex();
        if root != self.merkle_root {
            return Err(IntegrityError::RootMismatch {
                declared: self.merkle_root.clone(),
                computed: root,
            });
        }

        for declared in self.artifacts() {
            if !integrity::verify_hex(&declared.hash, &self.merkle_root, &declared.proof) {
                return Err(IntegrityError::ProofRejected(declared.filename.clone()));
            }
        }
        Ok(())
    }

    pub fn verify(&self, artifacts: &ArtifactSet, archive: &[u8]) -> Result<(), IntegrityError> {
        self.verify_archive(archive)?;
        self.verify_artifacts(artifacts)
    }
}

/// Bundle as carried by a `deploy` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleContent {
    /// Base64 of `bundle.tgz`.
    pub archive: String,
    pub hashes: BundleHashes,
}

impl BundleContent {
    pub fn archive_bytes(&self) -> Result<Vec<u8>, IntegrityError> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.archive)
            .map_err(|e| IntegrityError::Malformed(format!("archive encoding: {e}")))
    }
}

/// A compiled bundle held by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub manifest: BundleManifest,
    pub artifacts: ArtifactSet,
    pub archive: Vec<u8>,
    pub hashes: BundleHashes,
}

impl Bundle {
    pub fn to_content(&self) -> BundleContent {
        BundleContent {
            archive: base64::engine::general_purpose::STANDARD.encode(&self.archive),
            hashes: self.hashes.clone(),
        }
    }
}
