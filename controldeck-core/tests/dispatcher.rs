use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

mod fixture;

fn service(id: &str, options: &str) -> String {
    format!("[[service]]\nid = \"{id}\"\nkind = \"scripted\"\n{options}\n")
}

#[test]
fn test_concurrent_actions_on_one_service_are_serialised() {
    fixture::run(|fixture| async move {
        fixture
            .install_enabled("slow.toml", &service("slow", "delay_ms = 300"))
            .await;

        let (first, second) = tokio::join!(fixture.host.start("slow"), fixture.host.start("slow"));
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 1);
        let busy = outcomes.iter().find(|o| !o.success).unwrap();
        assert!(busy.message.contains("already in flight"), "{}", busy.message);

        let probe = fixture.probe("slow");
        assert_eq!(probe.starts.load(Ordering::SeqCst), 1);
        assert_eq!(probe.max_concurrent.load(Ordering::SeqCst), 1);
        assert!(!fixture.host.dispatcher().is_busy("slow"));
    });
}

#[test]
fn test_actions_on_different_services_run_in_parallel() {
    fixture::run(|fixture| async move {
        fixture
            .install_enabled(
                "pair.toml",
                &format!(
                    "{}\n{}",
                    service("left", "delay_ms = 400"),
                    service("right", "delay_ms = 400")
                ),
            )
            .await;

        let started = Instant::now();
        let (left, right) = tokio::join!(fixture.host.start("left"), fixture.host.start("right"));
        assert!(left.success, "{}", left.message);
        assert!(right.success, "{}", right.message);
        assert!(started.elapsed() < Duration::from_millis(750));
    });
}

#[test]
fn test_timed_out_action_keeps_service_busy() {
    fixture::run(|fixture| async move {
        fixture
            .install_enabled("stuck.toml", &service("stuck", "start_mode = \"hang\""))
            .await;

        let timed_out = fixture.host.start("stuck").await;
        assert!(!timed_out.success);
        assert!(timed_out.message.contains("timed out"), "{}", timed_out.message);

        // the abandoned worker still holds the service
        assert!(fixture.host.dispatcher().is_busy("stuck"));
        let rejected = fixture.host.stop("stuck").await;
        assert!(rejected.message.contains("already in flight"), "{}", rejected.message);
        assert_eq!(fixture.probe("stuck").stops.load(Ordering::SeqCst), 0);

        fixture.probes.release();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fixture.host.dispatcher().is_busy("stuck") {
            assert!(Instant::now() < deadline, "abandoned action never returned");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stopped = fixture.host.stop("stuck").await;
        assert!(stopped.success, "{}", stopped.message);
    });
}

#[test]
fn test_action_refreshes_status_immediately() {
    fixture::run(|fixture| async move {
        fixture.install_enabled("web.toml", &service("web", "")).await;
        let before = fixture.host.refresh_status().await;
        assert!(!before.get("web").unwrap().running);

        let started = fixture.host.start("web").await;
        assert!(started.success, "{}", started.message);
        assert!(started.message.contains("running"), "{}", started.message);

        let latest = fixture.host.poller().latest();
        assert!(latest.sequence > before.sequence);
        assert!(latest.get("web").unwrap().running);
        assert_eq!(fixture.probe("web").checks.load(Ordering::SeqCst), 2);

        let stopped = fixture.host.stop("web").await;
        assert!(stopped.message.contains("stopped"), "{}", stopped.message);
        assert!(!fixture.host.poller().latest().get("web").unwrap().running);
    });
}

#[test]
fn test_actions_on_unknown_or_disabled_services_are_rejected() {
    fixture::run(|fixture| async move {
        let missing = fixture.host.start("ghost").await;
        assert!(!missing.success);
        assert!(missing.message.contains("no loaded module"), "{}", missing.message);

        fixture.install_enabled("web.toml", &service("web", "")).await;
        assert!(fixture.host.disable("web").await.unwrap().success);

        let disabled = fixture.host.start("web").await;
        assert!(!disabled.success);
        assert!(disabled.message.contains("disabled"), "{}", disabled.message);
        assert_eq!(fixture.probe("web").starts.load(Ordering::SeqCst), 0);
    });
}

#[test]
fn test_remove_service_detaches_instance() {
    fixture::run(|fixture| async move {
        fixture
            .install_enabled(
                "boxes.toml",
                &format!(
                    "{}\n{}",
                    service("box-a", "allow_remove = true"),
                    service("box-b", "")
                ),
            )
            .await;
        fixture.host.refresh_status().await;

        let kept = fixture.host.remove_service("box-b").await;
        assert!(!kept.success);
        assert!(kept.message.contains("cannot be removed"), "{}", kept.message);
        assert_eq!(fixture.probe("box-b").removes.load(Ordering::SeqCst), 0);

        let removed = fixture.host.remove_service("box-a").await;
        assert!(removed.success, "{}", removed.message);
        assert_eq!(fixture.probe("box-a").removes.load(Ordering::SeqCst), 1);

        let latest = fixture.host.poller().latest();
        assert!(latest.get("box-a").is_none());
        assert!(latest.get("box-b").is_some());

        let entry = fixture.host.registry().get("boxes").unwrap();
        let ids: Vec<&str> = entry.instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["box-b"]);
        assert!(!fixture.host.start("box-a").await.success);
    });
}

#[test]
fn test_failed_restart_reports_stopped_service() {
    fixture::run(|fixture| async move {
        fixture
            .install_enabled(
                "db.toml",
                &service("db", "start_mode = \"fail\"\ninitially_running = true"),
            )
            .await;

        let restarted = fixture.host.restart("db").await;
        assert!(!restarted.success);
        assert!(restarted.message.contains("service stopped"), "{}", restarted.message);
        assert!(!restarted.message.contains("swordfish"), "{}", restarted.message);

        let probe = fixture.probe("db");
        assert_eq!(probe.stops.load(Ordering::SeqCst), 1);
        assert_eq!(probe.starts.load(Ordering::SeqCst), 1);
        assert!(!fixture.host.poller().latest().get("db").unwrap().running);
    });
}

#[test]
fn test_panicking_action_is_contained() {
    fixture::run(|fixture| async move {
        fixture
            .install_enabled("crashy.toml", &service("crashy", "start_mode = \"panic\""))
            .await;

        let crashed = fixture.host.start("crashy").await;
        assert!(!crashed.success);
        assert!(crashed.message.contains("panicked"), "{}", crashed.message);
        assert!(!fixture.host.dispatcher().is_busy("crashy"));

        let stopped = fixture.host.stop("crashy").await;
        assert!(stopped.success, "{}", stopped.message);
    });
}
