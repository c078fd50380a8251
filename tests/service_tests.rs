mod common;

use common::{test_lab, FakeDevice, FakeLab};
use lablink::core::{ErrorKind, InventoryStore};
use lablink::credentials::CredentialKind;
use lablink::identity::AddressSource;
use lablink::ssh::{AuthKind, ConnectionMode};
use lablink::transfer::{FilePair, SyncOptions};
use std::fs;

#[tokio::test]
async fn test_pooled_session_is_reused() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));

    for _ in 0..3 {
        let report = t.service.ssh_exec("sentai-01", "echo hi", None).await;
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.connection, Some(ConnectionMode::Multiplexed));
        assert_eq!(report.auth, Some(AuthKind::Key));
        assert_eq!(report.data.unwrap().stdout, "hi\n");
    }
    assert_eq!(t.lab.connect_count(), 1);
    assert_eq!(t.service.open_sessions(), 1);
    assert_eq!(t.service.shutdown(), 1);
    assert_eq!(t.service.open_sessions(), 0);
}

#[tokio::test]
async fn test_nonzero_exit_is_unsuccessful_but_keeps_output() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));

    let report = t.service.ssh_exec("sentai-01", "frobnicate", None).await;
    assert!(!report.success);
    let output = report.data.unwrap();
    assert_eq!(output.exit_status, 127);
    assert!(output.stderr.contains("not found"));
}

#[tokio::test]
async fn test_rejected_key_falls_back_to_cached_password() {
    let t = test_lab(
        FakeLab::default().with("10.0.0.5", FakeDevice::password_only("sentai", "root", "s3cret")),
    );
    t.service
        .cache_credential("sentai-01", "root", Some("s3cret".into()), CredentialKind::Ssh)
        .unwrap();

    let report = t.service.ssh_exec("sentai-01", "echo ok", None).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.connection, Some(ConnectionMode::Direct));
    assert_eq!(report.auth, Some(AuthKind::CachedPassword));
    assert_eq!(report.username.as_deref(), Some("root"));
}

#[tokio::test]
async fn test_class_default_login_is_tried_last() {
    let t = test_lab(
        FakeLab::default()
            .with("10.0.0.7", FakeDevice::password_only("imx93-board", "fio", "fio")),
    );

    let report = t.service.ssh_exec("imx93-board", "echo ok", None).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.auth, Some(AuthKind::DefaultPassword));
    assert_eq!(report.username.as_deref(), Some("fio"));
}

#[tokio::test]
async fn test_auth_failure_reports_attempted_username() {
    let t = test_lab(
        FakeLab::default().with("10.0.0.5", FakeDevice::password_only("sentai", "root", "s3cret")),
    );

    let report = t.service.ssh_exec("sentai-01", "echo ok", None).await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, ErrorKind::AuthFailed);
    assert_eq!(report.username.as_deref(), Some("root"));
}

#[tokio::test]
async fn test_refused_connection_is_typed_and_cached() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::refusing()));

    let report = t.service.ssh_exec("sentai-01", "echo ok", None).await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, ErrorKind::ConnectionRefused);
    assert_eq!(report.ip.as_deref(), Some("10.0.0.5"));

    let entry = t.service.cache_lookup("10.0.0.5").unwrap();
    assert!(entry.resolved_device_id.is_none());
    assert!(entry.last_error.is_some());
}

#[tokio::test]
async fn test_unknown_device_is_not_found() {
    let t = test_lab(FakeLab::default());

    let report = t.service.ssh_exec("nope", "echo ok", None).await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, ErrorKind::DeviceNotFound);
    assert_eq!(t.lab.connect_count(), 0);
}

#[tokio::test]
async fn test_identified_address_wins_over_inventory() {
    // sentai-01 is configured at .5 but DHCP moved it to .9
    let t = test_lab(FakeLab::default().with("10.0.0.9", FakeDevice::keyed("sentai", Some("ABC123"))));

    let report = t.service.identify("10.0.0.9", None, None, false).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.device_id.as_deref(), Some("sentai-01"));
    let identification = report.data.unwrap();
    assert_eq!(identification.candidates[0].score, 20);
    assert_eq!(
        identification.firmware.unwrap().version_id.as_deref(),
        Some("4.0.11")
    );

    let target = t.service.resolve("sentai-01").await.unwrap();
    assert_eq!(target.ip, "10.0.0.9");
    assert_eq!(target.source, AddressSource::Cache);

    let exec = t.service.ssh_exec("sentai-01", "echo moved", None).await;
    assert!(exec.success);
    assert_eq!(exec.ip.as_deref(), Some("10.0.0.9"));
}

#[tokio::test]
async fn test_identify_uses_fresh_cache() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));

    let first = t.service.identify("10.0.0.5", None, None, true).await;
    assert!(!first.data.unwrap().from_cache);
    let probes = t.lab.connect_count();

    let second = t.service.identify("10.0.0.5", None, None, true).await;
    assert!(second.data.unwrap().from_cache);
    assert_eq!(t.lab.connect_count(), probes);
}

#[tokio::test]
async fn test_identify_many_keeps_input_order() {
    let t = test_lab(
        FakeLab::default()
            .with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123")))
            .with("10.0.0.7", FakeDevice::keyed("imx93-board", Some("0x5fa1c0de"))),
    );

    let ips = vec!["10.0.0.7".to_string(), "10.0.0.99".to_string(), "10.0.0.5".to_string()];
    let reports = t.service.identify_many(ips, None, None, false, Some(2)).await;

    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].device_id.as_deref(), Some("imx93-board"));
    assert!(!reports[1].success);
    assert_eq!(reports[1].error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(reports[2].device_id.as_deref(), Some("sentai-01"));
}

#[tokio::test]
async fn test_verify_fleet_reports_every_device() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));

    let reports = t.service.verify_fleet(None).await;
    assert_eq!(reports.len(), 2);
    let sentai = reports
        .iter()
        .find(|r| r.device_id.as_deref() == Some("sentai-01"))
        .unwrap();
    assert!(sentai.success);
    let board = reports
        .iter()
        .find(|r| r.device_id.as_deref() == Some("imx93-board"))
        .unwrap();
    assert!(!board.success);
    assert_eq!(board.error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_verify_other_unit_is_verification_failure() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("imposter", Some("ZZZ999"))));

    let report = t.service.verify("sentai-01", None).await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, ErrorKind::VerificationFailed);
    assert!(!report.data.unwrap().verified);
}

#[tokio::test]
async fn test_update_ip_only_after_verification() {
    let t = test_lab(
        FakeLab::default()
            .with("10.0.0.9", FakeDevice::keyed("sentai", Some("ABC123")))
            .with("10.0.0.10", FakeDevice::keyed("imposter", Some("ZZZ999"))),
    );
    let before = fs::read(t.inventory_path()).unwrap();

    let rejected = t.service.update_ip_if_verified("sentai-01", "10.0.0.10").await;
    assert!(!rejected.success);
    assert!(!rejected.data.as_ref().unwrap().updated);
    assert_eq!(fs::read(t.inventory_path()).unwrap(), before);

    let accepted = t.service.update_ip_if_verified("sentai-01", "10.0.0.9").await;
    assert!(accepted.success, "{:?}", accepted.error);
    let update = accepted.data.unwrap();
    assert!(update.updated);
    assert_eq!(update.old_ip.as_deref(), Some("10.0.0.5"));

    let reread = InventoryStore::open(t.inventory_path()).unwrap();
    let record = reread.resolve("sentai-01").unwrap();
    assert_eq!(record.configured_ip.as_deref(), Some("10.0.0.9"));
    let raw = fs::read_to_string(t.inventory_path()).unwrap();
    assert!(raw.contains("carrier rev B"));
}

#[tokio::test]
async fn test_copy_round_trip() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));
    let local = t.dir.path().join("fw.bin");
    fs::write(&local, b"firmware").unwrap();

    let push = t
        .service
        .copy_to_device("sentai-01", local, "/tmp/fw.bin", None)
        .await;
    assert!(push.success, "{:?}", push.error);
    assert_eq!(push.data.unwrap().bytes, 8);

    let back = t.dir.path().join("pulled/fw.bin");
    let pull = t
        .service
        .copy_from_device("sentai-01", "/tmp/fw.bin", back.clone())
        .await;
    assert!(pull.success, "{:?}", pull.error);
    assert_eq!(fs::read(back).unwrap(), b"firmware");
}

#[tokio::test]
async fn test_copy_missing_local_file_is_invalid() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));

    let report = t
        .service
        .copy_to_device("sentai-01", t.dir.path().join("absent"), "/tmp/x", None)
        .await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_parallel_copy_keeps_order() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));
    let mut files = Vec::new();
    for i in 0..5 {
        let local = t.dir.path().join(format!("f{}.txt", i));
        fs::write(&local, "x".repeat(i + 1)).unwrap();
        files.push(FilePair {
            local,
            remote: format!("/data/f{}.txt", i),
        });
    }
    files.insert(2, FilePair {
        local: t.dir.path().join("missing.txt"),
        remote: "/data/missing.txt".into(),
    });

    let reports = t.service.copy_files_parallel("sentai-01", files, Some(3)).await;
    assert_eq!(reports.len(), 6);
    assert!(!reports[2].success);
    let sizes: Vec<u64> = reports
        .iter()
        .filter_map(|r| r.data.as_ref().map(|d| d.bytes))
        .collect();
    assert_eq!(sizes, vec![1, 2, 3, 4, 5]);
    assert_eq!(t.lab.device("10.0.0.5").file_names().len(), 5);
}

#[tokio::test]
async fn test_sync_directory_excludes_and_deletes() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));
    let src = t.dir.path().join("app");
    fs::create_dir_all(src.join("lib")).unwrap();
    fs::write(src.join("main.py"), "main").unwrap();
    fs::write(src.join("main.pyc"), "bytecode").unwrap();
    fs::write(src.join("lib/util.py"), "util").unwrap();

    let device = t.lab.device("10.0.0.5");
    device
        .files
        .lock()
        .unwrap()
        .insert("/opt/app/old.py".into(), b"stale".to_vec());

    let options = SyncOptions {
        exclude: vec!["*.pyc".into()],
        delete: true,
    };
    let report = t
        .service
        .sync_directory("sentai-01", src, "/opt/app", options)
        .await;
    assert!(report.success, "{:?}", report.error);
    let summary = report.data.unwrap();
    assert_eq!(summary.files_transferred, 2);
    assert_eq!(summary.bytes_transferred, 8);
    assert_eq!(summary.files_deleted, vec!["/opt/app/old.py".to_string()]);

    assert_eq!(
        device.file_names(),
        vec!["/opt/app/lib/util.py".to_string(), "/opt/app/main.py".to_string()]
    );
    assert!(device.commands().iter().any(|c| c.starts_with("mkdir -p /opt/app")));
}

#[tokio::test]
async fn test_cache_rename_survives_reprobe() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));

    t.service.identify("10.0.0.5", None, None, false).await;
    assert!(t.service.cache_rename("10.0.0.5", "Bench A").unwrap());
    t.service.identify("10.0.0.5", None, None, false).await;

    let entry = t.service.cache_lookup("10.0.0.5").unwrap();
    assert_eq!(entry.friendly_name.as_deref(), Some("Bench A"));
    assert!(!t.service.cache_rename("10.0.0.77", "Nobody").unwrap());

    assert_eq!(t.service.cache_clear().unwrap(), 1);
    assert!(t.service.cache_entries().is_empty());
}

#[tokio::test]
async fn test_missing_remote_file_keeps_pooled_session() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));
    assert!(t.service.ssh_exec("sentai-01", "echo warm", None).await.success);

    let report = t
        .service
        .copy_from_device("sentai-01", "/no/such/file", t.dir.path().join("out.bin"))
        .await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, ErrorKind::RemoteError);
    assert_eq!(report.connection, Some(ConnectionMode::Multiplexed));
    assert_eq!(t.service.open_sessions(), 1);
    assert_eq!(t.lab.connect_count(), 1);

    assert!(t.service.ssh_exec("sentai-01", "echo again", None).await.success);
    assert_eq!(t.lab.connect_count(), 1);
}

#[tokio::test]
async fn test_sync_into_readonly_path_is_remote_error() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));
    let src = t.dir.path().join("app");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("main.py"), "main").unwrap();

    let report = t
        .service
        .sync_directory("sentai-01", src, "/readonly/app", SyncOptions::default())
        .await;
    assert!(!report.success);
    assert_eq!(report.error.unwrap().kind, ErrorKind::RemoteError);

    let device = t.lab.device("10.0.0.5");
    let mkdirs = device
        .commands()
        .iter()
        .filter(|c| c.starts_with("mkdir -p"))
        .count();
    assert_eq!(mkdirs, 1);
    assert!(device.file_names().is_empty());
    assert_eq!(t.lab.connect_count(), 1);
}

#[tokio::test]
async fn test_identify_over_cached_password_after_key_rejection() {
    let t = test_lab(
        FakeLab::default().with("10.0.0.5", FakeDevice::password_only("sentai", "root", "s3cret")),
    );
    t.service
        .cache_credential("10.0.0.5", "root", Some("s3cret".into()), CredentialKind::Ssh)
        .unwrap();

    let report = t.service.identify("10.0.0.5", None, None, false).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.device_id.as_deref(), Some("sentai-01"));
    assert_eq!(t.lab.connect_count(), 1);
    assert!(t
        .lab
        .device("10.0.0.5")
        .commands()
        .iter()
        .any(|c| c == "hostname"));
}

#[tokio::test]
async fn test_concurrent_exec_shares_one_session() {
    let t = test_lab(FakeLab::default().with("10.0.0.5", FakeDevice::keyed("sentai", Some("ABC123"))));

    let calls = (0..8).map(|i| {
        let command = format!("echo run{}", i);
        let service = &t.service;
        async move { service.ssh_exec("sentai-01", &command, None).await }
    });
    let reports = futures::future::join_all(calls).await;

    for (i, report) in reports.iter().enumerate() {
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.connection, Some(ConnectionMode::Multiplexed));
        assert_eq!(report.data.as_ref().unwrap().stdout, format!("run{}\n", i));
    }
    assert_eq!(t.lab.connect_count(), 1);
    assert_eq!(t.service.open_sessions(), 1);
}
