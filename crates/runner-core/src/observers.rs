//! Observer Manager: watches the output tree for file conditions a client
//! registered interest in, and publishes `ObserverTriggered` once each.
//!
//! Grounded in `task_runner.observers.ObserverManager`: a live registry
//! (observers can be added/removed while the sweep loop runs), a
//! snapshot-then-sweep pattern each tick so a removal mid-sweep doesn't
//! race the iteration, and de-registration on first match so a triggered
//! observer never re-fires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::event_logger::EventLogger;
use crate::events::{Event, EventBody};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ObserverType {
    #[serde(rename = "file_exists_observer")]
    FileExists,
    #[serde(rename = "file_regex_observer")]
    FileRegex,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observer {
    pub observer_id: Uuid,
    pub observer_type: ObserverType,
    pub task_id: String,
    pub file_path: Option<String>,
    pub regex: Option<String>,
}

/// Registry of observers plus the periodic sweep loop; `Send + Sync` so it
/// can be shared behind an `Arc` between the message listener (which
/// registers/deregisters) and the sweep task the handler spawns.
pub struct ObserverManager {
    runner_id: Uuid,
    event_logger: std::sync::Arc<EventLogger>,
    check_interval: Duration,
    observers: Mutex<HashMap<Uuid, Observer>>,
}

impl ObserverManager {
    pub fn new(runner_id: Uuid, event_logger: std::sync::Arc<EventLogger>) -> Self {
        Self {
            runner_id,
            event_logger,
            check_interval: DEFAULT_CHECK_INTERVAL,
            observers: Mutex::new(HashMap::new()),
        }
    }

    pub fn start_observing(&self, observer: Observer) {
        self.observers.lock().unwrap().insert(observer.observer_id, observer);
    }

    pub fn stop_observing(&self, observer_id: Uuid) {
        self.observers.lock().unwrap().remove(&observer_id);
    }

    fn snapshot(&self) -> Vec<Observer> {
        self.observers.lock().unwrap().values().cloned().collect()
    }

    /// Sweep every registered observer against `sim_dir` until `stop`
    /// resolves. Runs as its own task for the lifetime of one task
    /// execution.
    pub async fn run(&self, sim_dir: &std::path::Path, stop: impl std::future::Future<Output = ()>) {
        tokio::pin!(stop);
        loop {
            for observer in self.snapshot() {
                tracing::debug!(observer_id = %observer.observer_id, "checking observer");
                let triggered = match observer.observer_type {
                    ObserverType::FileExists => {
                        check_file_exists(sim_dir, observer.file_path.as_deref())
                    }
                    ObserverType::FileRegex => check_file_regex(
                        sim_dir,
                        observer.file_path.as_deref(),
                        observer.regex.as_deref(),
                    ),
                };

                if triggered {
                    self.stop_observing(observer.observer_id);
                    let event = Event::new(
                        observer.task_id.clone(),
                        self.runner_id,
                        EventBody::ObserverTriggered {
                            observer_id: observer.observer_id,
                        },
                    );
                    self.event_logger.log(&event).await;
                }
            }

            tokio::select! {
                _ = &mut stop => return,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
    }
}

fn check_file_exists(sim_dir: &std::path::Path, file_path: Option<&str>) -> bool {
    let Some(file_path) = file_path else {
        return false;
    };
    sim_dir.join(file_path).exists()
}

fn check_file_regex(sim_dir: &std::path::Path, file_path: Option<&str>, regex: Option<&str>) -> bool {
    let (Some(file_path), Some(regex)) = (file_path, regex) else {
        return false;
    };
    let path = sim_dir.join(file_path);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return false;
    };
    let Ok(re) = regex::Regex::new(regex) else {
        return false;
    };
    re.is_match(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiCredential;

    fn manager() -> ObserverManager {
        let api = std::sync::Arc::new(
            crate::api_client::ApiClient::new(
                "http://127.0.0.1:1",
                ApiCredential::UserApiKey("test".to_string()),
            )
            .unwrap(),
        );
        api.set_runner_id_for_test(Uuid::nil());
        ObserverManager::new(Uuid::nil(), std::sync::Arc::new(EventLogger::new(api)))
    }

    #[test]
    fn file_exists_check_matches_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("done.flag"), b"").unwrap();
        assert!(check_file_exists(dir.path(), Some("done.flag")));
        assert!(!check_file_exists(dir.path(), Some("missing.flag")));
    }

    #[test]
    fn file_regex_check_matches_file_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log.txt"), b"simulation converged at t=10").unwrap();
        assert!(check_file_regex(dir.path(), Some("log.txt"), Some(r"converged at t=\d+")));
        assert!(!check_file_regex(dir.path(), Some("log.txt"), Some(r"diverged")));
    }

    #[test]
    fn stop_observing_removes_an_unfired_observer() {
        let manager = manager();
        let id = Uuid::new_v4();
        manager.start_observing(Observer {
            observer_id: id,
            observer_type: ObserverType::FileExists,
            task_id: "task-1".to_string(),
            file_path: Some("x".to_string()),
            regex: None,
        });
        assert_eq!(manager.snapshot().len(), 1);
        manager.stop_observing(id);
        assert_eq!(manager.snapshot().len(), 0);
    }
}
