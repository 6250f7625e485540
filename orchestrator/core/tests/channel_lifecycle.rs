// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Channel manager behavior against real `/bin/sh` engine processes.
//!
//! Covers:
//! - tampered bundles never replace a running build, nor start a stopped
//!   or never-deployed channel
//! - drain windows bound how long a stop may take
//! - unexpected engine exits land the channel in `error`
//! - the way back out of `error`

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use common::{bundle, eventually, manager, SwitchProbe, GRACEFUL, STUBBORN};
use gatejet_core::domain::bundle::{Bundle, BundleContent, BuildMode};
use gatejet_core::domain::channel::{ChannelError, ChannelState};
use gatejet_core::domain::integrity;
use gatejet_core::infrastructure::archive;

/// One byte of the packaged archive flipped, declared hashes untouched.
fn flipped_archive(b: &Bundle) -> BundleContent {
    let mut tampered = b.clone();
    let mid = tampered.archive.len() / 2;
    tampered.archive[mid] ^= 0x01;
    tampered.to_content()
}

/// One byte of `flows.json` flipped and repacked; only the archive digest
/// is updated, the declared artifact hashes stay as they were.
fn flipped_artifact(b: &Bundle) -> BundleContent {
    let mut tampered = b.clone();
    let last = tampered.artifacts.flows.len() - 1;
    tampered.artifacts.flows[last] ^= 0x01;
    tampered.archive = archive::pack(&tampered.artifacts).unwrap();
    tampered.hashes.bundle_hash = integrity::digest_hex(&tampered.archive);
    tampered.to_content()
}

fn staged_entries(channel_dir: &std::path::Path) -> usize {
    std::fs::read_dir(channel_dir.join("staging")).map_or(0, |d| d.count())
}

#[tokio::test]
async fn test_tampered_bundle_leaves_running_build_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), GRACEFUL, SwitchProbe::ready());

    let good = bundle("ch-1", "b-1");
    manager
        .deploy("ch-1", "b-1", BuildMode::Test, &good.to_content(), None)
        .await
        .unwrap();
    let before = manager.status("ch-1").unwrap();
    assert_eq!(before.state, ChannelState::Running);

    // Artifacts of b-2 paired with the hashes of another bundle
    let next = bundle("ch-1", "b-2");
    let mut content = next.to_content();
    content.hashes.merkle_root = good.hashes.merkle_root.clone();

    let err = manager
        .deploy("ch-1", "b-2", BuildMode::Test, &content, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Integrity(_)));

    let after = manager.status("ch-1").unwrap();
    assert_eq!(after.state, ChannelState::Running);
    assert_eq!(after.build_id.as_deref(), Some("b-1"));
    assert_eq!(after.pid, before.pid);
    assert!(!dir.path().join("channels/ch-1/builds/b-2").exists());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_tampered_bundle_never_starts_new_channel() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), GRACEFUL, SwitchProbe::ready());
    let b = bundle("ch-1", "b-1");

    for content in [flipped_archive(&b), flipped_artifact(&b)] {
        let err = manager
            .deploy("ch-1", "b-1", BuildMode::Test, &content, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Integrity(_)), "unexpected error: {err}");
        assert!(manager.status("ch-1").is_none());
        assert!(manager.summary().is_empty());
        assert!(!dir.path().join("channels/ch-1").exists());
    }
}

#[tokio::test]
async fn test_tampered_bundle_leaves_stopped_channel_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), GRACEFUL, SwitchProbe::ready());
    let good = bundle("ch-1", "b-1");
    manager
        .deploy("ch-1", "b-1", BuildMode::Test, &good.to_content(), None)
        .await
        .unwrap();
    manager.stop("ch-1", None).await.unwrap();

    let next = bundle("ch-1", "b-2");
    for content in [flipped_archive(&next), flipped_artifact(&next)] {
        let err = manager
            .deploy("ch-1", "b-2", BuildMode::Test, &content, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Integrity(_)), "unexpected error: {err}");

        let status = manager.status("ch-1").unwrap();
        assert_eq!(status.state, ChannelState::Stopped);
        assert!(status.pid.is_none());
        assert_eq!(status.build_id.as_deref(), Some("b-1"));
        assert!(!dir.path().join("channels/ch-1/builds/b-2").exists());
        assert_eq!(staged_entries(&dir.path().join("channels/ch-1")), 0);
    }
}

#[tokio::test]
async fn test_redeploy_replaces_running_build() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), GRACEFUL, SwitchProbe::ready());

    for build_id in ["b-1", "b-2"] {
        let b = bundle("ch-1", build_id);
        let outcome = manager
            .deploy("ch-1", build_id, BuildMode::Test, &b.to_content(), None)
            .await
            .unwrap();
        assert_eq!(outcome.verified_root, b.hashes.merkle_root);
    }

    let status = manager.status("ch-1").unwrap();
    assert_eq!(status.state, ChannelState::Running);
    assert_eq!(status.build_id.as_deref(), Some("b-2"));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_stop_waits_out_drain_for_stubborn_engine() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), STUBBORN, SwitchProbe::ready());
    let b = bundle("ch-1", "b-1");
    manager
        .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
        .await
        .unwrap();

    let drain = Duration::from_millis(400);
    let started = Instant::now();
    let status = manager.stop("ch-1", Some(drain)).await.unwrap();
    assert!(started.elapsed() >= drain);
    assert_eq!(status.state, ChannelState::Stopped);
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn test_graceful_engine_stops_before_drain_expires() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), GRACEFUL, SwitchProbe::ready());
    let b = bundle("ch-1", "b-1");
    manager
        .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
        .await
        .unwrap();

    let started = Instant::now();
    manager.stop("ch-1", Some(Duration::from_secs(10))).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    // a second stop is a no-op
    let again = manager.stop("ch-1", Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(again.state, ChannelState::Stopped);
}

#[tokio::test]
async fn test_engine_crash_moves_channel_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), "sleep 0.3; exit 3", SwitchProbe::ready());
    let b = bundle("ch-1", "b-1");
    manager
        .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
        .await
        .unwrap();

    let crashed = eventually(Duration::from_secs(5), || {
        manager
            .status("ch-1")
            .is_some_and(|s| s.state == ChannelState::Error)
    })
    .await;
    assert!(crashed, "channel never reached error");

    let status = manager.status("ch-1").unwrap();
    assert!(status.pid.is_none());
    assert!(status.last_error.is_some());

    // error is only left through restart or deploy
    assert!(matches!(
        manager.start("ch-1").await,
        Err(ChannelError::InvalidTransition { .. })
    ));
    assert!(matches!(
        manager.stop("ch-1", None).await,
        Err(ChannelError::InvalidTransition { .. })
    ));
    let restarted = manager.restart("ch-1").await.unwrap();
    assert_eq!(restarted.state, ChannelState::Running);
    assert!(restarted.last_error.is_none());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_restart_recovers_from_failed_startup() {
    let dir = tempfile::tempdir().unwrap();
    let probe = SwitchProbe::ready();
    probe.set(false);
    let manager = manager(dir.path(), GRACEFUL, probe.clone());
    let b = bundle("ch-1", "b-1");

    let err = manager
        .deploy("ch-1", "b-1", BuildMode::Test, &b.to_content(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::StartupTimeout { .. }));
    assert_eq!(manager.status("ch-1").unwrap().state, ChannelState::Error);

    probe.set(true);
    let status = manager.restart("ch-1").await.unwrap();
    assert_eq!(status.state, ChannelState::Running);
    assert!(status.pid.is_some());
    manager.shutdown().await;
}
