//! Serialised start/stop/restart/remove requests.
//!
//! At most one action runs per service id. A second request for an id with
//! an action in flight is rejected with [`ActionError::Busy`], never queued.
//! The in-flight mark is held by the worker itself, so an action abandoned
//! on timeout keeps its id busy until the module call actually returns.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{panic_message, ActionError};
use crate::module::ServiceModule;
use crate::plugin::registry::{LifecycleRegistry, ModuleHandle};
use crate::redact::redact_credentials;

use super::poller::StatusPoller;
use super::snapshot::StatusEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Remove,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Remove => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "restart" => Ok(Action::Restart),
            "remove" => Ok(Action::Remove),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Last action applied to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    pub success: bool,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub id: String,
    pub action: Action,
    pub message: String,
    /// Status after the out-of-cycle refresh. None after a removal.
    pub status: Option<StatusEntry>,
}

/// Removes the id from the in-flight set when dropped.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.id);
    }
}

pub struct ActionDispatcher {
    registry: Arc<LifecycleRegistry>,
    poller: Arc<StatusPoller>,
    timeout: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ActionDispatcher {
    pub fn new(
        registry: Arc<LifecycleRegistry>,
        poller: Arc<StatusPoller>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            poller,
            timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    fn try_claim(&self, id: &str) -> Result<InFlightGuard, ActionError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(id.to_string()) {
            return Err(ActionError::Busy(id.to_string()));
        }
        Ok(InFlightGuard {
            in_flight: self.in_flight.clone(),
            id: id.to_string(),
        })
    }

    /// Runs `action` on service `id` and applies the outcome.
    pub async fn request(&self, id: &str, action: Action) -> Result<ActionOutcome, ActionError> {
        let handle = self.registry.handle(id)?;
        let guard = self.try_claim(id)?;

        info!(service = %id, action = %action, "Dispatching action");
        let result = self.run(&handle, action, guard).await;

        let record = ActionRecord {
            action,
            success: result.is_ok(),
            message: match &result {
                Ok(message) => message.clone(),
                Err(e) => e.to_string(),
            },
            finished_at: Utc::now(),
        };
        self.registry.record_action(&handle, record);

        if action == Action::Remove && result.is_ok() {
            self.registry.detach_instance(&handle);
            self.poller.forget(&[handle.id.clone()]);
            info!(service = %id, "Service removed");
            return result.map(|message| ActionOutcome {
                id: handle.id,
                action,
                message,
                status: None,
            });
        }

        let status = self.poller.refresh(id).await;
        match result {
            Ok(message) => Ok(ActionOutcome {
                id: handle.id,
                action,
                message,
                status,
            }),
            Err(e) => {
                warn!(service = %id, action = %action, error = %e, "Action failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        handle: &ModuleHandle,
        action: Action,
        guard: InFlightGuard,
    ) -> Result<String, ActionError> {
        let module = handle.module();
        let id = handle.id.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            perform(module.as_ref(), &id, action)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let cause = if e.is_panic() {
                    format!("panicked: {}", panic_message(e.into_panic().as_ref()))
                } else {
                    e.to_string()
                };
                Err(ActionError::OperationFailed {
                    id: handle.id.clone(),
                    action: action.to_string(),
                    cause: redact_credentials(&cause),
                })
            }
            Err(_) => {
                warn!(
                    service = %handle.id,
                    action = %action,
                    "Action timed out; abandoning worker"
                );
                Err(ActionError::TimedOut {
                    id: handle.id.clone(),
                    action: action.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

/// Runs on a blocking worker.
fn perform(module: &dyn ServiceModule, id: &str, action: Action) -> Result<String, ActionError> {
    let failed = |e: anyhow::Error| ActionError::OperationFailed {
        id: id.to_string(),
        action: action.to_string(),
        cause: redact_credentials(&format!("{e:#}")),
    };

    match action {
        Action::Start => module.start().map_err(failed)?,
        Action::Stop => module.stop().map_err(failed)?,
        Action::Restart if module.has_custom_restart() => module.restart().map_err(failed)?,
        Action::Restart => {
            module.stop().map_err(failed)?;
            // stopped but not started again: report the service as stopped
            module.start().map_err(|e| ActionError::OperationFailed {
                id: id.to_string(),
                action: action.to_string(),
                cause: redact_credentials(&format!("service stopped; start failed: {e:#}")),
            })?;
        }
        Action::Remove => {
            if !module.can_remove() {
                return Err(ActionError::NotRemovable(id.to_string()));
            }
            module.remove().map_err(failed)?;
        }
    }

    Ok(match action {
        Action::Start => format!("Started {id}"),
        Action::Stop => format!("Stopped {id}"),
        Action::Restart => format!("Restarted {id}"),
        Action::Remove => format!("Removed {id}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        fail_start: bool,
        removable: bool,
        running: AtomicBool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ServiceModule for Recorder {
        fn name(&self) -> String {
            "Recorder".into()
        }
        fn id(&self) -> String {
            "rec".into()
        }
        fn is_running(&self) -> Result<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }
        fn start(&self) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                bail!("port in use; token=abc123");
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn can_remove(&self) -> bool {
            self.removable
        }
        fn remove(&self) -> Result<()> {
            self.calls.lock().unwrap().push("remove");
            Ok(())
        }
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("Restart".parse::<Action>(), Ok(Action::Restart));
        assert!("reboot".parse::<Action>().is_err());
    }

    #[test]
    fn test_default_restart_is_stop_then_start() {
        let module = Recorder::default();
        perform(&module, "rec", Action::Restart).unwrap();
        assert_eq!(module.calls(), vec!["stop", "start"]);
        assert!(module.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_restart_leaves_service_stopped() {
        let module = Recorder {
            fail_start: true,
            running: AtomicBool::new(true),
            ..Default::default()
        };
        let err = perform(&module, "rec", Action::Restart).unwrap_err();
        let ActionError::OperationFailed { cause, .. } = err else {
            panic!("expected OperationFailed");
        };
        assert!(cause.contains("service stopped"));
        assert!(!cause.contains("abc123"));
        assert!(!module.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_remove_checks_can_remove_first() {
        let module = Recorder::default();
        assert_eq!(
            perform(&module, "rec", Action::Remove),
            Err(ActionError::NotRemovable("rec".into()))
        );
        assert!(module.calls().is_empty());

        let module = Recorder {
            removable: true,
            ..Default::default()
        };
        perform(&module, "rec", Action::Remove).unwrap();
        assert_eq!(module.calls(), vec!["remove"]);
    }
}
