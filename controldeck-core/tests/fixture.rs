use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use controldeck_core::plugin::manifest::ServiceDefinition;
use controldeck_core::settings::Settings;
use controldeck_core::{DeckHost, ModuleKinds, ServiceModule};
use tempfile::TempDir;

/// Observations of one scripted service, shared with the test body.
#[derive(Default)]
pub struct ServiceProbe {
    pub running: AtomicBool,
    pub checks: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub removes: AtomicUsize,
    concurrent: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl ServiceProbe {
    fn enter(&self) {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Probes {
    services: Mutex<HashMap<String, Arc<ServiceProbe>>>,
    released: AtomicBool,
}

impl Probes {
    pub fn get(&self, id: &str) -> Arc<ServiceProbe> {
        self.services
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Lets every hung module call return.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn hang(&self) {
        let deadline = Instant::now() + Duration::from_secs(60);
        while !self.released.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ok,
    Hang,
    Panic,
    Fail,
}

impl Mode {
    fn parse(definition: &ServiceDefinition, key: &str) -> Mode {
        match definition.options.get(key).and_then(|v| v.as_str()) {
            Some("hang") => Mode::Hang,
            Some("panic") => Mode::Panic,
            Some("fail") => Mode::Fail,
            _ => Mode::Ok,
        }
    }
}

/// Test module kind driven by `check_mode`, `start_mode`, `delay_ms`,
/// `allow_remove` and `initially_running` options.
struct ScriptedModule {
    id: String,
    name: String,
    check_mode: Mode,
    start_mode: Mode,
    delay: Duration,
    allow_remove: bool,
    probe: Arc<ServiceProbe>,
    probes: Arc<Probes>,
}

impl ScriptedModule {
    fn act(&self, mode: Mode) -> Result<()> {
        self.probe.enter();
        std::thread::sleep(self.delay);
        let result = match mode {
            Mode::Ok => Ok(()),
            Mode::Hang => {
                self.probes.hang();
                Ok(())
            }
            Mode::Panic => {
                self.probe.leave();
                panic!("{} exploded", self.id)
            }
            Mode::Fail => Err(anyhow::anyhow!("{} refused: password=swordfish", self.id)),
        };
        self.probe.leave();
        result
    }
}

impl ServiceModule for ScriptedModule {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_running(&self) -> Result<bool> {
        self.probe.checks.fetch_add(1, Ordering::SeqCst);
        match self.check_mode {
            Mode::Ok => Ok(self.probe.running.load(Ordering::SeqCst)),
            Mode::Hang => {
                self.probes.hang();
                Ok(false)
            }
            Mode::Panic => panic!("status of {} exploded", self.id),
            Mode::Fail => bail!("daemon socket unavailable"),
        }
    }

    fn details(&self) -> String {
        format!("checked {} times", self.probe.checks.load(Ordering::SeqCst))
    }

    fn start(&self) -> Result<()> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        self.act(self.start_mode)?;
        self.probe.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        self.act(Mode::Ok)?;
        self.probe.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn can_remove(&self) -> bool {
        self.allow_remove
    }

    fn remove(&self) -> Result<()> {
        self.probe.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn test_kinds(probes: Arc<Probes>) -> ModuleKinds {
    let mut kinds = ModuleKinds::new();

    kinds.register("scripted", move |definition| {
        let id = definition.id.clone().unwrap_or_else(|| "scripted".into());
        let probe = probes.get(&id);
        let option_bool =
            |key: &str| definition.options.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        if option_bool("initially_running") {
            probe.running.store(true, Ordering::SeqCst);
        }
        let delay_ms = definition
            .options
            .get("delay_ms")
            .and_then(|v| v.as_integer())
            .unwrap_or(0) as u64;

        let module = ScriptedModule {
            name: definition.name.clone().unwrap_or_else(|| id.clone()),
            id,
            check_mode: Mode::parse(definition, "check_mode"),
            start_mode: Mode::parse(definition, "start_mode"),
            delay: Duration::from_millis(delay_ms),
            allow_remove: option_bool("allow_remove"),
            probe,
            probes: probes.clone(),
        };
        Ok(vec![Arc::new(module) as Arc<dyn ServiceModule>])
    });

    kinds.register("exploding", |_| panic!("constructor exploded"));

    kinds
}

pub struct Fixture {
    pub host: DeckHost,
    pub probes: Arc<Probes>,
    pub home_dir: TempDir,
    settings: Settings,
}

impl Fixture {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let home_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(home_dir.path().join("workspace")).unwrap();

        let mut settings = Settings::default();
        settings.deck.refresh_interval_secs = 1;
        settings.deck.check_timeout_secs = 1;
        settings.deck.action_timeout_secs = 1;
        settings.deck.load_timeout_secs = 5;
        settings.plugins.system_dir = None;
        configure(&mut settings);

        let probes = Arc::new(Probes::default());
        let host = build_host(&home_dir, &settings, probes.clone());

        Fixture {
            host,
            probes,
            home_dir,
            settings,
        }
    }

    /// A second host over the same home directory, as after a restart.
    #[allow(dead_code)]
    pub fn reopen(&self) -> DeckHost {
        build_host(&self.home_dir, &self.settings, self.probes.clone())
    }

    #[allow(dead_code)]
    pub fn workspace_plugins(&self) -> PathBuf {
        self.home_dir
            .path()
            .join("workspace")
            .join(".controldeck")
            .join("plugins")
    }

    #[allow(dead_code)]
    pub fn user_plugins(&self) -> PathBuf {
        self.home_dir.path().join(".controldeck").join("plugins")
    }

    /// Writes a module source into the workspace plugin directory.
    #[allow(dead_code)]
    pub fn write_module(&self, file: &str, content: &str) -> PathBuf {
        let dir = self.workspace_plugins();
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[allow(dead_code)]
    pub fn probe(&self, id: &str) -> Arc<ServiceProbe> {
        self.probes.get(id)
    }

    /// Installs a module source from the workspace and enables it.
    #[allow(dead_code)]
    pub async fn install_enabled(&self, file: &str, content: &str) {
        let path = self.write_module(file, content);
        let installed = self.host.install(path.to_str().unwrap()).await.unwrap();
        assert!(installed.success, "{}", installed.message);
        let id = file.trim_end_matches(".toml");
        let enabled = self.host.enable(id).await.unwrap();
        assert!(enabled.success, "{}", enabled.message);
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.probes.release();
    }
}

fn build_host(home_dir: &TempDir, settings: &Settings, probes: Arc<Probes>) -> DeckHost {
    DeckHost::builder()
        .settings(settings.clone())
        .home_dir(home_dir.path().to_path_buf())
        .workspace_roots(vec![home_dir.path().join("workspace")])
        .kinds(test_kinds(probes))
        .build()
        .unwrap()
}

#[allow(dead_code)]
pub fn run<F, Fut>(test_fn: F)
where
    F: FnOnce(Fixture) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    run_with_settings(|_| {}, test_fn)
}

pub fn run_with_settings<S, F, Fut>(configure: S, test_fn: F)
where
    S: FnOnce(&mut Settings),
    F: FnOnce(Fixture) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use tokio::time::timeout;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    runtime.block_on(async {
        let fixture = Fixture::with_settings(configure);
        let test_future = test_fn(fixture);
        timeout(Duration::from_secs(30), test_future)
            .await
            .expect("Test timed out after 30 seconds");
    });

    // Hung module calls may still occupy blocking threads.
    runtime.shutdown_background();
}
