// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deterministic `bundle.tgz` packing.
//!
//! Entries are written in bundle order with zeroed mtime, uid and gid and a
//! fixed mode, so identical artifacts always produce an identical archive and
//! therefore an identical `bundleHash`.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::domain::bundle::{ArtifactSet, ARTIFACT_ORDER};
use crate::domain::integrity::IntegrityError;

/// Per-entry ceiling when unpacking untrusted archives.
pub const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

const ENTRY_MODE: u32 = 0o644;

pub fn pack(artifacts: &ArtifactSet) -> io::Result<Vec<u8>> {
    let encoder: GzEncoder<Vec<u8>> = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for (name, bytes) in artifacts.entries() {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, bytes)?;
    }

    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()
}

/// Extract the four artifacts. Anything else in the archive (directories,
/// links, unknown names, duplicates) rejects the bundle.
pub fn unpack(archive: &[u8]) -> Result<ArtifactSet, IntegrityError> {
    let malformed = |e: io::Error| IntegrityError::Malformed(format!("archive: {e}"));

    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let mut files = BTreeMap::new();

    for entry in tar.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let path = entry.path().map_err(malformed)?;
        let name = path.to_string_lossy().into_owned();

        if entry.header().entry_type() != tar::EntryType::Regular || !ARTIFACT_ORDER.contains(&name.as_str()) {
            return Err(IntegrityError::UnexpectedEntry(name));
        }
        let size = entry.header().size().map_err(malformed)?;
        if size > MAX_ENTRY_BYTES {
            return Err(IntegrityError::Malformed(format!("{name} exceeds {MAX_ENTRY_BYTES} bytes")));
        }

        let mut bytes = Vec::with_capacity(size as usize);
        entry
            .by_ref()
            .take(MAX_ENTRY_BYTES)
            .read_to_end(&mut bytes)
            .map_err(malformed)?;

        if files.insert(name.clone(), bytes).is_some() {
            return Err(IntegrityError::UnexpectedEntry(format!("duplicate {name}")));
        }
    }

    ArtifactSet::from_files(files)
}
