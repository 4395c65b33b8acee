//! Model roster.
//!
//! Tracks which completion backends are currently usable so callers ask for
//! "the next available model" instead of hard-coding one. State transitions
//! are driven entirely by reported call outcomes and guarded by a single
//! lock, which keeps the roster safe if extraction loops ever run
//! concurrently.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Availability state of one model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Available,
    /// Skipped until the cooldown deadline passes, then probed again.
    CoolingDown,
    /// Failed through every cooldown; never selected again this run.
    Exhausted,
}

/// One candidate language-model backend.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub state: ModelState,
    pub consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl ModelDescriptor {
    fn new(name: String) -> Self {
        Self {
            name,
            state: ModelState::Available,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }
}

/// Registry of candidate models, ordered preferred-first.
pub struct ModelRoster {
    models: Mutex<Vec<ModelDescriptor>>,
    failure_threshold: u32,
    exhaust_threshold: u32,
    cooldown: Duration,
}

impl ModelRoster {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_EXHAUST_THRESHOLD: u32 = 9;
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(120);

    /// Build the roster from the backend's deployed model list.
    ///
    /// Models named in the allow-list come first, in allow-list order;
    /// deployed models not on the list are appended after them. Allow-list
    /// entries the backend does not actually serve are dropped.
    pub fn new(deployed: &[String], allowlist: &[String]) -> Self {
        let mut ordered: Vec<ModelDescriptor> = Vec::new();

        for preferred in allowlist {
            if deployed.iter().any(|m| m == preferred) {
                ordered.push(ModelDescriptor::new(preferred.clone()));
            } else {
                warn!(model = %preferred, "allow-listed model not deployed, dropping");
            }
        }
        for model in deployed {
            if !ordered.iter().any(|d| &d.name == model) {
                ordered.push(ModelDescriptor::new(model.clone()));
            }
        }

        info!(
            models = ?ordered.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            "model roster initialized"
        );

        Self {
            models: Mutex::new(ordered),
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            exhaust_threshold: Self::DEFAULT_EXHAUST_THRESHOLD,
            cooldown: Self::DEFAULT_COOLDOWN,
        }
    }

    /// Override the cooldown window (tests use zero).
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Names of currently selectable models, preferred-first.
    ///
    /// Models whose cooldown deadline has passed are revived here rather
    /// than by a background task.
    pub fn list_available(&self) -> Vec<String> {
        let mut models = self.models.lock().expect("roster lock poisoned");
        let now = Instant::now();

        for model in models.iter_mut() {
            if model.state == ModelState::CoolingDown {
                if let Some(deadline) = model.cooldown_until {
                    if now >= deadline {
                        info!(model = %model.name, "cooldown elapsed, reviving model");
                        model.state = ModelState::Available;
                        model.cooldown_until = None;
                    }
                }
            }
        }

        models
            .iter()
            .filter(|m| m.state == ModelState::Available)
            .map(|m| m.name.clone())
            .collect()
    }

    /// Record a successful call: the failure streak resets.
    pub fn report_success(&self, name: &str) {
        let mut models = self.models.lock().expect("roster lock poisoned");
        if let Some(model) = models.iter_mut().find(|m| m.name == name) {
            model.consecutive_failures = 0;
            if model.state == ModelState::CoolingDown {
                model.state = ModelState::Available;
                model.cooldown_until = None;
            }
        }
    }

    /// Record a failed call, moving the model into cooldown (or exhausting
    /// it) when the streak crosses the thresholds.
    pub fn report_failure(&self, name: &str) {
        let mut models = self.models.lock().expect("roster lock poisoned");
        let Some(model) = models.iter_mut().find(|m| m.name == name) else {
            return;
        };

        model.consecutive_failures += 1;

        if model.consecutive_failures >= self.exhaust_threshold {
            warn!(
                model = %model.name,
                failures = model.consecutive_failures,
                "model exhausted, removing from rotation"
            );
            model.state = ModelState::Exhausted;
            model.cooldown_until = None;
        } else if model.consecutive_failures % self.failure_threshold == 0 {
            warn!(
                model = %model.name,
                failures = model.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "model cooling down"
            );
            model.state = ModelState::CoolingDown;
            model.cooldown_until = Some(Instant::now() + self.cooldown);
        }
    }

    /// Current consecutive-failure count for a model (observability and
    /// tests).
    pub fn failure_count(&self, name: &str) -> u32 {
        let models = self.models.lock().expect("roster lock poisoned");
        models
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.consecutive_failures)
            .unwrap_or(0)
    }
}
