mod common;

use std::fs;

use common::{Fixture, link_page, server, zip_bytes};
use gsm_agent::{BuildVersion, MergePolicy, ProvisionError, UpdateOutcome};
use gsm_agent::{InstanceConfig, NullSink, SampServer};
use gsm_process::ProvisionStage;

const ARCHIVE: &str = "/files/samp037_svr_R2-2-1_win32.zip";
const STOCK_CFG: &[u8] = b"echo Executing Server Config...\nrcon_password changeme\nport 7777\n";

async fn installed(fx: &Fixture, dir: &std::path::Path) -> SampServer {
    fx.page("/create-server/", &link_page(ARCHIVE));
    fx.page("/downloads/", &link_page(ARCHIVE));
    fx.file(
        ARCHIVE,
        zip_bytes(&[
            ("samp-server.exe", b"MZ old build"),
            ("server.cfg", STOCK_CFG),
            ("filterscripts/base.amx", b"amx"),
        ]),
    );
    let s = server(dir, fx.source());
    s.install().await.unwrap();
    s
}

#[tokio::test]
async fn install_unpacks_release_and_removes_archive() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    fx.page("/create-server/", &link_page(ARCHIVE));
    fx.file(
        ARCHIVE,
        zip_bytes(&[("samp-server.exe", b"MZ"), ("server.cfg", STOCK_CFG)]),
    );

    let s = server(dir.path(), fx.source());
    assert!(!s.is_install_valid());
    let release = s.install().await.unwrap();

    assert_eq!(release.download_url.as_str(), fx.url(ARCHIVE));
    assert_eq!(release.version, Some(BuildVersion([0, 3, 7, 0])));
    assert!(s.is_install_valid());
    assert_eq!(fs::read(dir.path().join("server.cfg")).unwrap(), STOCK_CFG);
    assert!(!dir.path().join("samp037_svr_R2-2-1_win32.zip").exists());
    assert_eq!(s.local_build().await.unwrap(), BuildVersion([0, 3, 7, 0]));
}

#[tokio::test]
async fn install_keeps_archive_when_extraction_fails() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    fx.page("/create-server/", &link_page(ARCHIVE));
    fx.file(ARCHIVE, b"this is not a zip archive".to_vec());

    let s = server(dir.path(), fx.source());
    let err = s.install().await.unwrap_err();

    assert_eq!(err.code(), "extract");
    assert!(dir.path().join("samp037_svr_R2-2-1_win32.zip").is_file());
    assert!(!s.is_install_valid());
}

#[tokio::test]
async fn install_without_matching_link_fails() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    fx.page("/create-server/", "<a href=\"/files/client.exe\">client</a>");

    let err = server(dir.path(), fx.source()).install().await.unwrap_err();
    assert!(matches!(err, ProvisionError::NoReleaseLink { .. }));
}

#[tokio::test]
async fn update_with_same_version_downloads_nothing() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    let s = installed(&fx, dir.path()).await;
    fs::write(dir.path().join("server.cfg"), "hostname mine\n").unwrap();
    let downloads_before = fx.hits(ARCHIVE);

    let task = s.update(false, None);
    let op = task.operation_id().clone();
    let outcome = task.wait().await.unwrap();

    assert_eq!(
        outcome,
        UpdateOutcome::UpToDate {
            version: BuildVersion([0, 3, 7, 0])
        }
    );
    assert_eq!(fx.hits(ARCHIVE), downloads_before);
    assert_eq!(
        fs::read_to_string(dir.path().join("server.cfg")).unwrap(),
        "hostname mine\n"
    );
    assert_eq!(
        gsm_agent::progress::get(&op).unwrap().stage,
        ProvisionStage::UpToDate
    );
    assert!(!dir.path().join(".gsm-staging").exists());
}

#[tokio::test]
async fn forced_update_merges_release_and_restores_config() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    let s = installed(&fx, dir.path()).await;
    let user_cfg = "echo mine\r\nrcon_password hunter2\r\nport 7001\r\n";
    fs::write(dir.path().join("server.cfg"), user_cfg).unwrap();
    fs::write(dir.path().join("gamemodes.amx"), b"local addition").unwrap();

    let next = "/files/samp037_svr_R2-3_win32.zip";
    fx.file(
        next,
        zip_bytes(&[
            ("samp-server.exe", b"MZ new build"),
            ("server.cfg", STOCK_CFG),
            ("filterscripts/base.amx", b"amx v2"),
        ]),
    );

    let outcome = s.update(true, Some(fx.url(next))).wait().await.unwrap();
    match outcome {
        UpdateOutcome::Updated { download_url, .. } => {
            assert_eq!(download_url.as_str(), fx.url(next));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(fx.hits(next), 1);
    assert_eq!(
        fs::read(dir.path().join("samp-server.exe")).unwrap(),
        b"MZ new build"
    );
    assert_eq!(
        fs::read(dir.path().join("filterscripts/base.amx")).unwrap(),
        b"amx v2"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("server.cfg")).unwrap(),
        user_cfg
    );
    assert_eq!(
        fs::read(dir.path().join("gamemodes.amx")).unwrap(),
        b"local addition"
    );
    assert!(!dir.path().join(".gsm-staging").exists());
}

#[tokio::test]
async fn update_with_new_file_leaves_live_tree_untouched() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    let s = installed(&fx, dir.path()).await;
    fs::write(dir.path().join("server.cfg"), "port 7002\n").unwrap();

    let next = "/files/samp038_svr_win32.zip";
    fx.file(
        next,
        zip_bytes(&[
            ("samp-server.exe", b"MZ new build"),
            ("npcmodes/new.amx", b"npc"),
        ]),
    );

    let err = s.update(true, Some(fx.url(next))).wait().await.unwrap_err();
    assert_eq!(err.code(), "merge_precondition");

    assert_eq!(
        fs::read(dir.path().join("samp-server.exe")).unwrap(),
        b"MZ old build"
    );
    assert!(!dir.path().join("npcmodes").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("server.cfg")).unwrap(),
        "port 7002\n"
    );
    // Staging is kept for inspection.
    assert!(dir.path().join(".gsm-staging").is_dir());
}

#[tokio::test]
async fn create_or_overwrite_policy_accepts_new_files() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    installed(&fx, dir.path()).await;

    let mut cfg = InstanceConfig::new("it");
    cfg.install_dir = Some(dir.path().to_path_buf());
    cfg.merge_policy = MergePolicy::CreateOrOverwrite;
    let s = SampServer::with_source(cfg, fx.source(), std::sync::Arc::new(NullSink)).unwrap();

    let next = "/files/samp038_svr_win32.zip";
    fx.file(next, zip_bytes(&[("npcmodes/new.amx", b"npc")]));
    s.update(true, Some(fx.url(next))).wait().await.unwrap();
    assert_eq!(fs::read(dir.path().join("npcmodes/new.amx")).unwrap(), b"npc");
}

#[tokio::test]
async fn resolver_failure_means_no_action() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    let s = installed(&fx, dir.path()).await;
    fs::write(dir.path().join("server.cfg"), "port 7003\n").unwrap();
    fx.fail("/downloads/", 503);
    let downloads_before = fx.hits(ARCHIVE);

    let remote = s.remote_build().await.unwrap_err();
    assert!(remote.is_resolution_failure());
    assert!(!remote.to_string().is_empty());

    let err = s.update(false, None).wait().await.unwrap_err();
    assert!(err.is_resolution_failure());
    assert_eq!(fx.hits(ARCHIVE), downloads_before);
    assert_eq!(
        fs::read(dir.path().join("samp-server.exe")).unwrap(),
        b"MZ old build"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("server.cfg")).unwrap(),
        "port 7003\n"
    );
}

#[tokio::test]
async fn overlapping_updates_run_one_after_another() {
    let fx = Fixture::start().await;
    let dir = tempfile::tempdir().unwrap();
    let s = installed(&fx, dir.path()).await;

    let a = s.update(false, None);
    let b = s.update(false, None);
    assert_ne!(a.operation_id(), b.operation_id());
    assert!(matches!(a.wait().await, Ok(UpdateOutcome::UpToDate { .. })));
    assert!(matches!(b.wait().await, Ok(UpdateOutcome::UpToDate { .. })));
}
