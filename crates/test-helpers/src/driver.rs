//! In-memory runtime driver.

use async_trait::async_trait;
use mixsim_driver::{is_managed_image, Driver, DriverError, RunOutput, RunSpec};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// One recorded driver operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Prepare,
    Build(String),
    Pull(String),
    Run(String),
    Stop(String),
    Download { name: String, remote: String },
    Peek { name: String, remote: String },
    Upload { name: String, remote: String },
    Cleanup(String),
}

#[derive(Default)]
struct State {
    running: BTreeMap<String, RunSpec>,
    images: BTreeSet<String>,
    /// (entity, absolute remote path) -> content.
    files: HashMap<(String, String), String>,
    /// Launches of a name that still have to fail.
    run_failures: HashMap<String, u32>,
    /// (entity, remote path) whose reads fail with a runtime error.
    broken: BTreeSet<(String, String)>,
    next_address: u32,
    calls: Vec<DriverCall>,
}

/// A [`Driver`] keeping every instance in memory.
#[derive(Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `image` is already present locally.
    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.state.lock().images.insert(image.into());
        self
    }

    /// Make the next `times` launches of `name` fail.
    pub fn fail_runs(&self, name: impl Into<String>, times: u32) {
        self.state.lock().run_failures.insert(name.into(), times);
    }

    /// Place a file inside an entity (it persists across restarts).
    pub fn set_file(&self, name: &str, remote: &str, content: impl Into<String>) {
        self.state
            .lock()
            .files
            .insert((name.to_string(), remote.to_string()), content.into());
    }

    /// Make reads of `remote` inside `name` fail as a rejected command.
    pub fn break_file(&self, name: &str, remote: &str) {
        self.state
            .lock()
            .broken
            .insert((name.to_string(), remote.to_string()));
    }

    /// Content of a file inside an entity, e.g. an uploaded one.
    pub fn file(&self, name: &str, remote: &str) -> Option<String> {
        self.state
            .lock()
            .files
            .get(&(name.to_string(), remote.to_string()))
            .cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().running.contains_key(name)
    }

    pub fn running(&self) -> Vec<String> {
        self.state.lock().running.keys().cloned().collect()
    }

    /// Launch specification of a running instance.
    pub fn spec(&self, name: &str) -> Option<RunSpec> {
        self.state.lock().running.get(name).cloned()
    }

    pub fn images(&self) -> BTreeSet<String> {
        self.state.lock().images.clone()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls equal to `call`.
    pub fn count(&self, call: &DriverCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn prepare(&self) -> Result<(), DriverError> {
        self.state.lock().calls.push(DriverCall::Prepare);
        Ok(())
    }

    async fn has_image(&self, name: &str) -> Result<bool, DriverError> {
        Ok(self.state.lock().images.contains(name))
    }

    async fn build(&self, name: &str, _path: &Path) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Build(name.to_string()));
        state.images.insert(name.to_string());
        Ok(())
    }

    async fn pull(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Pull(name.to_string()));
        state.images.insert(name.to_string());
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Run(spec.name.clone()));

        if state.running.contains_key(&spec.name) {
            return Err(DriverError::NameCollision(spec.name.clone()));
        }
        if let Some(remaining) = state.run_failures.get_mut(&spec.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::Command {
                    command: format!("run {}", spec.name),
                    status: "exit status: 125".to_string(),
                    stderr: "injected failure".to_string(),
                });
            }
        }

        state.next_address += 1;
        let address = if spec.skip_address_wait {
            String::new()
        } else {
            format!("10.0.0.{}", state.next_address)
        };
        state.running.insert(spec.name.clone(), spec.clone());
        Ok(RunOutput {
            address,
            ports: spec.ports.clone(),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Stop(name.to_string()));
        state.running.remove(name);
        Ok(())
    }

    async fn download(&self, name: &str, remote: &str, local: &Path) -> Result<(), DriverError> {
        let matched: Vec<(String, String)> = {
            let mut state = self.state.lock();
            state.calls.push(DriverCall::Download {
                name: name.to_string(),
                remote: remote.to_string(),
            });
            if !state.running.contains_key(name) {
                return Err(DriverError::NotFound(name.to_string()));
            }

            let root = remote.trim_end_matches('/');
            let base = root.rsplit('/').next().unwrap_or(root);
            state
                .files
                .iter()
                .filter(|((entity, _), _)| entity == name)
                .filter_map(|((_, path), content)| {
                    let rest = path.strip_prefix(root)?;
                    if rest.is_empty() || rest.starts_with('/') {
                        Some((format!("{base}{rest}"), content.clone()))
                    } else {
                        None
                    }
                })
                .collect()
        };

        if matched.is_empty() {
            return Err(DriverError::NotFound(format!("{name}:{remote}")));
        }
        for (relative, content) in matched {
            let target = local.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        Ok(())
    }

    async fn peek(&self, name: &str, remote: &str) -> Result<String, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Peek {
            name: name.to_string(),
            remote: remote.to_string(),
        });
        if !state.running.contains_key(name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        let key = (name.to_string(), remote.to_string());
        if state.broken.contains(&key) {
            return Err(DriverError::Command {
                command: format!("cat {remote}"),
                status: "exit status: 1".to_string(),
                stderr: "permission denied".to_string(),
            });
        }
        state
            .files
            .get(&key)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("{name}:{remote}")))
    }

    async fn upload(&self, name: &str, local: &Path, remote: &str) -> Result<(), DriverError> {
        let content = std::fs::read_to_string(local)?;
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Upload {
            name: name.to_string(),
            remote: remote.to_string(),
        });
        if !state.running.contains_key(name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        state
            .files
            .insert((name.to_string(), remote.to_string()), content);
        Ok(())
    }

    async fn cleanup(&self, image_prefix: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Cleanup(image_prefix.to_string()));
        state
            .running
            .retain(|_, spec| !is_managed_image(&spec.image, image_prefix));
        Ok(())
    }
}
