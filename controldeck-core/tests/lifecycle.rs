use controldeck_core::plugin::registry::PluginHealth;
use controldeck_core::plugin::types::SourceTier;
use std::sync::atomic::Ordering;

mod fixture;

const SINGLE: &str = r#"
name = "Single"
version = "1.0"

[[service]]
id = "single-svc"
kind = "scripted"
"#;

#[test]
fn test_install_enable_poll_disable_round_trip() {
    fixture::run(|fixture| async move {
        let path = fixture.write_module("single.toml", SINGLE);

        let installed = fixture.host.install(path.to_str().unwrap()).await.unwrap();
        assert!(installed.success, "{}", installed.message);
        let entry = fixture.host.registry().get("single").unwrap();
        assert!(!entry.record.enabled, "install must never auto-enable");

        let snapshot = fixture.host.refresh_status().await;
        assert!(snapshot.get("single-svc").is_none());
        assert_eq!(fixture.probe("single-svc").checks.load(Ordering::SeqCst), 0);

        assert!(fixture.host.enable("single").await.unwrap().success);
        assert!(fixture.host.registry().get("single").unwrap().record.enabled);
        let snapshot = fixture.host.refresh_status().await;
        let checked = snapshot.get("single-svc").cloned().unwrap();
        assert!(checked.check_error.is_none());
        assert_eq!(fixture.probe("single-svc").checks.load(Ordering::SeqCst), 1);

        assert!(fixture.host.disable("single").await.unwrap().success);
        assert!(!fixture.host.registry().get("single").unwrap().record.enabled);
        let after = fixture.host.refresh_status().await;
        assert!(after.sequence > snapshot.sequence);
        // no new check, last known entry left as it was
        assert_eq!(fixture.probe("single-svc").checks.load(Ordering::SeqCst), 1);
        assert_eq!(after.get("single-svc"), Some(&checked));

        // both operations are idempotent
        assert!(fixture.host.disable("single").await.unwrap().success);
        assert!(fixture.host.enable("single").await.unwrap().success);
        assert!(fixture.host.enable("single").await.unwrap().success);
        assert!(fixture.host.registry().get("single").unwrap().record.enabled);
    });
}

#[test]
fn test_same_id_from_two_sources_records_superseded() {
    fixture::run(|fixture| async move {
        fixture.write_module("single.toml", SINGLE);
        let user_dir = fixture.user_plugins();
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(
            user_dir.join("single.toml"),
            SINGLE.replace("version = \"1.0\"", "version = \"0.9\""),
        )
        .unwrap();

        let report = fixture.host.discover().await;
        let winner = report.find("single").unwrap();
        assert_eq!(winner.origin.tier, SourceTier::Workspace);
        assert_eq!(report.superseded.len(), 1);
        assert_eq!(report.superseded[0].descriptor.version, "0.9");
        assert!(report.superseded[0].conflict);

        let listing = fixture.host.available().await;
        assert!(listing.message.contains("superseded"), "{}", listing.message);

        let installed = fixture.host.install("single").await.unwrap();
        assert!(installed.success, "{}", installed.message);
        let record = fixture.host.registry().get("single").unwrap().record;
        assert_eq!(record.installed_version, "1.0");
    });
}

#[test]
fn test_lower_priority_copy_needs_force_to_replace() {
    fixture::run(|fixture| async move {
        fixture.write_module("single.toml", SINGLE);
        assert!(fixture.host.install("single").await.unwrap().success);

        let older = fixture.home_dir.path().join("downloads").join("single.toml");
        std::fs::create_dir_all(older.parent().unwrap()).unwrap();
        std::fs::write(&older, SINGLE.replace("version = \"1.0\"", "version = \"0.9\"")).unwrap();

        let kept = fixture.host.install(older.to_str().unwrap()).await.unwrap();
        assert!(!kept.success);
        assert!(kept.message.contains("--force"), "{}", kept.message);
        let record = fixture.host.registry().get("single").unwrap().record;
        assert_eq!(record.installed_version, "1.0");
        assert_eq!(record.source_tier, SourceTier::Workspace);

        let forced = fixture.host.force_install(older.to_str().unwrap()).await.unwrap();
        assert!(forced.success, "{}", forced.message);
        let record = fixture.host.registry().get("single").unwrap().record;
        assert_eq!(record.installed_version, "0.9");
        assert_eq!(record.source_tier, SourceTier::Additional);
    });
}

#[test]
fn test_source_without_services_is_rejected() {
    fixture::run(|fixture| async move {
        let path = fixture.write_module(
            "empty.toml",
            "name = \"Empty\"\n\n[[service]]\nid = \"half\"\nstatus = \"true\"\n",
        );

        let validated = fixture.host.validate(&path);
        assert!(!validated.success);
        assert!(validated.message.contains("no usable service"), "{}", validated.message);

        let installed = fixture.host.install(path.to_str().unwrap()).await.unwrap();
        assert!(!installed.success);
        assert!(fixture.host.entries().is_empty());
        assert!(fixture.host.registry().enabled_handles().is_empty());
    });
}

#[test]
fn test_denied_permission_is_not_installed() {
    fixture::run(|fixture| async move {
        let path = fixture.write_module(
            "systemd.toml",
            "permissions = [\"system\"]\n\n[[service]]\nid = \"unit\"\nkind = \"scripted\"\n",
        );

        let validated = fixture.host.validate(&path);
        assert!(!validated.success);
        assert!(validated.message.contains("system"), "{}", validated.message);

        let installed = fixture.host.install(path.to_str().unwrap()).await.unwrap();
        assert!(!installed.success);
        assert!(fixture.host.entries().is_empty());
    });
}

#[test]
fn test_panicking_constructor_leaves_host_running() {
    fixture::run(|fixture| async move {
        let path = fixture.write_module(
            "boom.toml",
            "[[service]]\nid = \"boom-svc\"\nkind = \"exploding\"\n",
        );
        assert!(fixture.host.install(path.to_str().unwrap()).await.unwrap().success);

        let enabled = fixture.host.enable("boom").await.unwrap();
        assert!(!enabled.success);
        assert!(enabled.message.contains("constructor exploded"), "{}", enabled.message);

        let entry = fixture.host.registry().get("boom").unwrap();
        assert!(matches!(entry.health, PluginHealth::Broken { .. }));
        assert!(!entry.record.enabled);

        // the host keeps serving other modules
        fixture.install_enabled("single.toml", SINGLE).await;
        let snapshot = fixture.host.refresh_status().await;
        assert_eq!(snapshot.len(), 1);
    });
}

#[test]
fn test_remove_running_module_requires_can_remove() {
    fixture::run(|fixture| async move {
        fixture
            .install_enabled(
                "pinned.toml",
                "[[service]]\nid = \"pinned-svc\"\nkind = \"scripted\"\ninitially_running = true\n",
            )
            .await;
        fixture
            .install_enabled(
                "loose.toml",
                "[[service]]\nid = \"loose-svc\"\nkind = \"scripted\"\ninitially_running = true\nallow_remove = true\n",
            )
            .await;
        let snapshot = fixture.host.refresh_status().await;
        assert!(snapshot.get("pinned-svc").unwrap().running);

        let rejected = fixture.host.remove("pinned").await.unwrap();
        assert!(!rejected.success);
        assert!(fixture.host.registry().get("pinned").is_some());

        let removed = fixture.host.remove("loose").await.unwrap();
        assert!(removed.success, "{}", removed.message);
        let again = fixture.host.remove("loose").await.unwrap();
        assert!(again.success, "{}", again.message);
        assert!(again.message.contains("already removed"), "{}", again.message);
        assert!(fixture.host.registry().get("loose").is_none());
        assert!(fixture.host.poller().latest().get("loose-svc").is_none());
        assert!(fixture.host.poller().latest().get("pinned-svc").is_some());
    });
}

#[test]
fn test_lifecycle_state_survives_host_restart() {
    fixture::run(|fixture| async move {
        fixture.install_enabled("single.toml", SINGLE).await;
        let path = fixture.write_module(
            "idle.toml",
            "[[service]]\nid = \"idle-svc\"\nkind = \"scripted\"\n",
        );
        assert!(fixture.host.install(path.to_str().unwrap()).await.unwrap().success);

        let reopened = fixture.reopen();
        let report = reopened.restore().await.unwrap();
        assert_eq!(report.restored, 2);
        assert_eq!(report.loaded, vec!["single".to_string()]);

        let snapshot = reopened.refresh_status().await;
        assert!(snapshot.get("single-svc").is_some());
        assert!(snapshot.get("idle-svc").is_none());

        let listing = reopened.list();
        assert!(listing.message.contains("idle"), "{}", listing.message);
        assert!(listing.message.contains("not loaded"), "{}", listing.message);
    });
}

#[test]
fn test_missing_source_is_listed_as_missing() {
    fixture::run(|fixture| async move {
        fixture.install_enabled("single.toml", SINGLE).await;
        let store = fixture.host.registry().store().path("single");
        std::fs::remove_file(store).unwrap();

        let reopened = fixture.reopen();
        let report = reopened.restore().await.unwrap();
        assert_eq!(report.failed.len(), 1);

        let entries = reopened.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].health, PluginHealth::Missing);
    });
}

#[test]
fn test_reinstall_updates_version_and_keeps_enabled() {
    fixture::run(|fixture| async move {
        fixture.install_enabled("single.toml", SINGLE).await;

        let unchanged = fixture
            .host
            .install(fixture.workspace_plugins().join("single.toml").to_str().unwrap())
            .await
            .unwrap();
        assert!(unchanged.message.contains("already installed"), "{}", unchanged.message);

        let path = fixture.write_module("single.toml", &SINGLE.replace("1.0", "1.1"));
        let updated = fixture.host.install(path.to_str().unwrap()).await.unwrap();
        assert!(updated.success, "{}", updated.message);

        let entry = fixture.host.registry().get("single").unwrap();
        assert_eq!(entry.record.installed_version, "1.1");
        assert!(entry.record.enabled);
        assert_eq!(entry.health, PluginHealth::Loaded);
        assert_eq!(entry.instances.len(), 1);
    });
}
