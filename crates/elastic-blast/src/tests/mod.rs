//! Test utilities shared by the unit tests of all modules.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, VecDeque};
use std::io::BufRead;
use std::rc::Rc;
use std::sync::Mutex;

use derive_builder::Builder;

use crate::cloud::{
    CloudError, CloudFuture, CloudProvider, ClusterHandle, ClusterState, CommandRunner,
};
use crate::config::defaults::EnvironmentDefaults;
use crate::config::file::ConfigFile;
use crate::config::locator::Locator;
use crate::config::{CliOverrides, ClusterConfig, ProviderKind, RunConfig, resolve};
use crate::status::JobState;
use crate::storage::{ObjectStorage, StorageError, StorageResult};
use crate::{Map, Set};

pub struct WrappedRcRefCell<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> Clone for WrappedRcRefCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Default> Default for WrappedRcRefCell<T> {
    fn default() -> Self {
        Self::wrap(T::default())
    }
}

impl<T> WrappedRcRefCell<T> {
    pub fn wrap(t: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(t)),
        }
    }

    #[track_caller]
    pub fn get(&self) -> Ref<'_, T> {
        self.inner.borrow()
    }

    #[track_caller]
    pub fn get_mut(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}

/// Scripted behaviour and call log of [`MockProvider`].
#[derive(Default)]
pub struct MockState {
    /// Every provider operation as `<operation> <name>`, in call order.
    pub calls: Vec<String>,
    pub cluster: Option<ClusterState>,
    pub fail_create_cluster: bool,
    /// A failed cluster creation leaves a cluster in the `Failed` state behind.
    pub leave_partial_cluster: bool,
    pub fail_create_storage: bool,
    /// Submissions of these jobs are rejected.
    pub rejected_jobs: Set<String>,
    /// Status sequences returned by `get_job`. The last state repeats.
    pub scripts: Map<String, VecDeque<JobState>>,
    /// Accepted jobs and their remaining status sequence.
    pub jobs: BTreeMap<String, VecDeque<JobState>>,
    /// `get_job` of these jobs fails.
    pub unreachable_jobs: Set<String>,
    pub fail_delete_cluster: bool,
    /// The tool check reports a missing `kubectl`.
    pub missing_tool: bool,
}

impl MockState {
    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{operation} ");
        self.calls
            .iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(|s| s.to_string()))
            .collect()
    }
}

fn failure(command: &str) -> CloudError {
    CloudError::CommandFailed {
        command: command.to_string(),
        code: 1,
        stderr: "simulated failure".to_string(),
    }
}

/// Value of the first `name:` key of a manifest.
pub fn manifest_name(manifest: &str) -> String {
    manifest
        .lines()
        .find_map(|line| line.trim().strip_prefix("name:"))
        .map(|name| name.trim().to_string())
        .unwrap_or_default()
}

/// In-memory provider recording every call.
#[derive(Clone, Default)]
pub struct MockProvider {
    pub state: WrappedRcRefCell<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ClusterHandle {
        ClusterHandle {
            name: "elasticblast".to_string(),
            context: "mock-context".to_string(),
        }
    }

    fn record(&self, operation: &str, name: &str) {
        self.state.get_mut().calls.push(format!("{operation} {name}"));
    }
}

impl CloudProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn runner(&self) -> CommandRunner {
        CommandRunner::new(true)
    }

    fn check_prerequisites(&self) -> CloudFuture<()> {
        let result = if self.state.get().missing_tool {
            Err(CloudError::MissingTool {
                program: "kubectl".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn cluster_state(&self, name: &str) -> CloudFuture<Option<ClusterState>> {
        self.record("cluster_state", name);
        let state = self.state.get().cluster.clone();
        Box::pin(async move { Ok(state) })
    }

    fn create_cluster(
        &self,
        cluster: &ClusterConfig,
        _labels: &BTreeMap<String, String>,
    ) -> CloudFuture<()> {
        self.record("create_cluster", &cluster.name);
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.get_mut();
            if state.fail_create_cluster {
                if state.leave_partial_cluster {
                    state.cluster = Some(ClusterState::Failed);
                }
                return Err(failure("create cluster"));
            }
            state.cluster = Some(ClusterState::Running);
            Ok(())
        })
    }

    fn delete_cluster(&self, name: &str) -> CloudFuture<()> {
        self.record("delete_cluster", name);
        let state = self.state.clone();
        Box::pin(async move {
            let mut state = state.get_mut();
            if state.fail_delete_cluster {
                return Err(failure("delete cluster"));
            }
            state.cluster = None;
            state.jobs.clear();
            Ok(())
        })
    }

    fn get_credentials(&self, name: &str) -> CloudFuture<ClusterHandle> {
        self.record("get_credentials", name);
        let mut handle = self.handle();
        handle.name = name.to_string();
        Box::pin(async move { Ok(handle) })
    }

    fn storage_class(&self) -> &'static str {
        "mock-storage"
    }

    fn docker_image(&self) -> String {
        "mock/elb:latest".to_string()
    }

    fn create_storage(&self, _cluster: &ClusterHandle, manifest: String) -> CloudFuture<()> {
        self.record("create_storage", &manifest_name(&manifest));
        let fail = self.state.get().fail_create_storage;
        Box::pin(async move {
            if fail {
                return Err(failure("create storage"));
            }
            Ok(())
        })
    }

    fn delete_storage(&self, _cluster: &ClusterHandle, name: &str) -> CloudFuture<()> {
        self.record("delete_storage", name);
        Box::pin(async move { Ok(()) })
    }

    fn submit_job(&self, _cluster: &ClusterHandle, manifest: String) -> CloudFuture<()> {
        let name = manifest_name(&manifest);
        self.record("submit_job", &name);
        let state = self.state.clone();
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut state = state.get_mut();
            if state.rejected_jobs.contains(&name) {
                return Err(failure(&format!("submit {name}")));
            }
            let script = state
                .scripts
                .get(&name)
                .cloned()
                .unwrap_or_else(|| VecDeque::from([JobState::Pending]));
            state.jobs.insert(name, script);
            Ok(())
        })
    }

    fn delete_job(&self, _cluster: &ClusterHandle, name: &str) -> CloudFuture<()> {
        self.record("delete_job", name);
        let state = self.state.clone();
        let name = name.to_string();
        Box::pin(async move {
            state.get_mut().jobs.remove(&name);
            Ok(())
        })
    }

    fn get_job(&self, _cluster: &ClusterHandle, name: &str) -> CloudFuture<Option<JobState>> {
        self.record("get_job", name);
        let state = self.state.clone();
        let name = name.to_string();
        Box::pin(async move {
            let mut state = state.get_mut();
            if state.unreachable_jobs.contains(&name) {
                return Err(failure(&format!("get job {name}")));
            }
            Ok(state.jobs.get_mut(&name).and_then(|script| {
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().copied()
                }
            }))
        })
    }

    fn list_jobs(
        &self,
        _cluster: &ClusterHandle,
        selector: &str,
    ) -> CloudFuture<Map<String, JobState>> {
        self.record("list_jobs", selector);
        let jobs = self
            .state
            .get()
            .jobs
            .iter()
            .filter_map(|(name, script)| script.front().map(|state| (name.clone(), *state)))
            .collect();
        Box::pin(async move { Ok(jobs) })
    }
}

/// Object storage kept in memory, keyed by locator.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn insert(&self, locator: &str, content: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(locator.to_string(), content.to_vec());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, locator: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(locator)
            .map(|content| String::from_utf8_lossy(content).to_string())
    }
}

impl ObjectStorage for MemoryStorage {
    fn open_read(&self, locator: &Locator) -> StorageResult<Box<dyn BufRead + Send>> {
        match self.objects.lock().unwrap().get(locator.as_str()) {
            Some(content) => Ok(Box::new(std::io::Cursor::new(content.clone()))),
            None => Err(StorageError::Io {
                locator: locator.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }

    fn write(&self, locator: &Locator, content: &[u8]) -> StorageResult<()> {
        self.insert(locator.as_str(), content);
        Ok(())
    }

    fn remove_prefix(&self, prefix: &Locator) -> StorageResult<()> {
        let prefix = format!("{}/", prefix.as_str());
        self.objects
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}

/// Fasta content with one record of `length` residues per item.
pub fn fasta(lengths: &[usize]) -> String {
    let mut content = String::new();
    for (index, length) in lengths.iter().enumerate() {
        content.push_str(&format!(">seq{index}\n"));
        content.push_str(&"ACGT".repeat(length / 4 + 1)[..*length]);
        content.push('\n');
    }
    content
}

// Run configurations
#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct TestRun {
    #[builder(default = "1")]
    num_nodes: i64,
    #[builder(default = "100")]
    batch_len: i64,
    #[builder(default)]
    reuse: bool,
    #[builder(default)]
    use_local_ssd: bool,
    #[builder(default = "true")]
    auto_shutdown: bool,
    #[builder(default = "\"gs://elb-test/queries.fa\".to_string()")]
    queries: String,
    #[builder(default)]
    job_template: Option<std::path::PathBuf>,
}

impl TestRunBuilder {
    pub fn build(self) -> RunConfig {
        let TestRun {
            num_nodes,
            batch_len,
            reuse,
            use_local_ssd,
            auto_shutdown,
            queries,
            job_template,
        } = self.finish().unwrap();
        let mut file = ConfigFile::parse(
            r#"
[cloud-provider]
gcp-project = "elb-project"
gcp-region = "us-east4"
gcp-zone = "us-east4-b"

[blast]
program = "blastn"
db = "pdbnt"
results = "gs://elb-test/results"
"#,
        )
        .unwrap();
        file.cluster.reuse = Some(reuse);
        file.cluster.use_local_ssd = Some(use_local_ssd);
        file.cluster.auto_shutdown = Some(auto_shutdown);
        file.cluster.job_template = job_template;
        let cli = CliOverrides {
            num_nodes: Some(num_nodes),
            batch_len: Some(batch_len),
            queries: vec![queries],
            ..Default::default()
        };
        resolve(&cli, &file, &EnvironmentDefaults::default()).unwrap()
    }
}

pub fn test_run() -> TestRunBuilder {
    TestRunBuilder::default()
}
