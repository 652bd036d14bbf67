//! In-memory [`ContainerEngine`] for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{HealthConfig, HostConfig};

use super::{
    ContainerEngine, ContainerSnapshot, ContainerSpec, EngineError, HealthState, ImageDefaults,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Pull,
    Rename,
    Create,
    /// Attaching extra networks. Fails after the container was created,
    /// leaving it behind.
    Connect,
    Start,
    Stop,
    Remove,
    RemoveImage,
    Tag,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    running: bool,
    spec: ContainerSpec,
    health: VecDeque<HealthState>,
    last_health: HealthState,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, FakeContainer>,
    images: HashMap<String, ImageDefaults>,
    health_plans: HashMap<String, Vec<HealthState>>,
    failures: HashMap<Op, (Option<String>, String)>,
    calls: Vec<String>,
    next_id: u32,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local image with its runtime defaults.
    pub fn add_image(&self, image: &str, entrypoint: &[&str], cmd: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let to_vec =
            |v: &[&str]| (!v.is_empty()).then(|| v.iter().map(|s| s.to_string()).collect());
        state.images.insert(
            image.to_string(),
            ImageDefaults {
                id: Some(format!("sha256:{image}")),
                entrypoint: to_vec(entrypoint),
                cmd: to_vec(cmd),
                repo_digests: vec![],
            },
        );
    }

    /// Add an existing container. Returns its id.
    pub fn add_container(&self, name: &str, spec: ContainerSpec, running: bool) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{name}-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                running,
                spec,
                health: VecDeque::new(),
                last_health: HealthState::None,
            },
        );
        id
    }

    /// Health states reported, in order, by containers created from `image`.
    /// The last state repeats forever.
    pub fn plan_health(&self, image: &str, states: &[HealthState]) {
        self.state
            .lock()
            .unwrap()
            .health_plans
            .insert(image.to_string(), states.to_vec());
    }

    /// Set the health sequence of an existing container.
    pub fn set_health(&self, name_or_id: &str, states: &[HealthState]) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = find_mut(&mut state, name_or_id) {
            c.health = states.iter().copied().collect();
        }
    }

    /// Make the next `op` fail. With a `target`, only calls on that name or
    /// id fail.
    pub fn fail(&self, op: Op, target: Option<&str>, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op, (target.map(str::to_string), message.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<_> = state.containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn get(&self, name_or_id: &str) -> Option<(String, String, bool)> {
        let mut state = self.state.lock().unwrap();
        find_mut(&mut state, name_or_id).map(|c| (c.id.clone(), c.spec.image.clone(), c.running))
    }

    pub fn spec_of(&self, name_or_id: &str) -> Option<ContainerSpec> {
        let mut state = self.state.lock().unwrap();
        find_mut(&mut state, name_or_id).map(|c| c.spec.clone())
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state.lock().unwrap().images.contains_key(image)
    }
}

fn find_mut<'a>(state: &'a mut State, name_or_id: &str) -> Option<&'a mut FakeContainer> {
    state
        .containers
        .values_mut()
        .find(|c| c.id == name_or_id || c.name == name_or_id)
}

fn check(state: &mut State, op: Op, target: &str) -> Result<(), EngineError> {
    let matches = match state.failures.get(&op) {
        Some((None, _)) => true,
        Some((Some(t), _)) => t == target,
        None => false,
    };
    if matches {
        if let Some((_, message)) = state.failures.remove(&op) {
            return Err(EngineError::Other(message));
        }
    }
    Ok(())
}

/// A spec with an image and, optionally, a health check.
pub fn spec(image: &str, healthcheck: bool) -> ContainerSpec {
    ContainerSpec {
        image: image.to_string(),
        healthcheck: healthcheck.then(|| HealthConfig {
            test: Some(vec!["CMD".into(), "true".into()]),
            ..Default::default()
        }),
        host_config: Some(HostConfig::default()),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect_container(
        &self,
        name_or_id: &str,
    ) -> Result<Option<ContainerSnapshot>, EngineError> {
        let mut state = self.state.lock().unwrap();
        let Some(c) = find_mut(&mut state, name_or_id) else {
            return Ok(None);
        };
        if let Some(next) = c.health.pop_front() {
            c.last_health = next;
        }
        Ok(Some(ContainerSnapshot {
            id: c.id.clone(),
            name: c.name.clone(),
            image_id: Some(format!("sha256:{}", c.spec.image)),
            running: c.running,
            health: if c.running {
                c.last_health
            } else {
                HealthState::None
            },
            spec: c.spec.clone(),
        }))
    }

    async fn inspect_image(&self, image: &str) -> Result<Option<ImageDefaults>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .get(image)
            .or_else(|| {
                state
                    .images
                    .values()
                    .find(|i| i.id.as_deref() == Some(image))
            })
            .cloned())
    }

    async fn pull_image(
        &self,
        image: &str,
        _credentials: Option<DockerCredentials>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("pull {image}"));
        check(&mut state, Op::Pull, image)?;
        state
            .images
            .entry(image.to_string())
            .or_insert_with(|| ImageDefaults {
                id: Some(format!("sha256:{image}")),
                ..Default::default()
            });
        Ok(())
    }

    async fn rename_container(
        &self,
        name_or_id: &str,
        new_name: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("rename {name_or_id} {new_name}"));
        check(&mut state, Op::Rename, name_or_id)?;
        if state.containers.values().any(|c| c.name == new_name) {
            return Err(EngineError::Other(format!("name {new_name} already in use")));
        }
        let c = find_mut(&mut state, name_or_id)
            .ok_or_else(|| EngineError::NotFound(name_or_id.to_string()))?;
        c.name = new_name.to_string();
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create {name} {}", spec.image));
        check(&mut state, Op::Create, name)?;
        if state.containers.values().any(|c| c.name == name) {
            return Err(EngineError::Other(format!("name {name} already in use")));
        }
        state.next_id += 1;
        let id = format!("{name}-{}", state.next_id);
        let health = state
            .health_plans
            .get(&spec.image)
            .map(|plan| plan.iter().copied().collect())
            .unwrap_or_default();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                running: false,
                spec: spec.clone(),
                health,
                last_health: HealthState::Starting,
            },
        );
        check(&mut state, Op::Connect, name)?;
        Ok(id)
    }

    async fn start_container(&self, name_or_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start {name_or_id}"));
        check(&mut state, Op::Start, name_or_id)?;
        let c = find_mut(&mut state, name_or_id)
            .ok_or_else(|| EngineError::NotFound(name_or_id.to_string()))?;
        c.running = true;
        Ok(())
    }

    async fn stop_container(&self, name_or_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop {name_or_id}"));
        check(&mut state, Op::Stop, name_or_id)?;
        let c = find_mut(&mut state, name_or_id)
            .ok_or_else(|| EngineError::NotFound(name_or_id.to_string()))?;
        c.running = false;
        if c.spec.auto_remove() {
            let id = c.id.clone();
            state.containers.remove(&id);
        }
        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove {name_or_id}"));
        check(&mut state, Op::Remove, name_or_id)?;
        let c = find_mut(&mut state, name_or_id)
            .ok_or_else(|| EngineError::NotFound(name_or_id.to_string()))?;
        if c.running && !force {
            return Err(EngineError::Other(format!("container {name_or_id} is running")));
        }
        let id = c.id.clone();
        state.containers.remove(&id);
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove_image {image}"));
        check(&mut state, Op::RemoveImage, image)?;
        state
            .images
            .remove(image)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(image.to_string()))
    }

    async fn tag_image(&self, image: &str, reference: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("tag {image} {reference}"));
        check(&mut state, Op::Tag, image)?;
        let defaults = state
            .images
            .get(image)
            .or_else(|| state.images.values().find(|i| i.id.as_deref() == Some(image)))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(image.to_string()))?;
        state.images.insert(reference.to_string(), defaults);
        Ok(())
    }
}
