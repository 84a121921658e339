use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ELB_VERSION;
use crate::cleanup::{CleanupStack, ResourceKind, UndoAction};
use crate::cloud::{CloudError, CloudProvider, ClusterHandle, ClusterState};
use crate::common::env::{
    ELB_CLUSTER_CREATE_TIMEOUT_MS, ELB_PD_SIZE, ELB_PVC_NAME, ELB_RUN_ID, ELB_STORAGE_CLASS,
    get_duration_from_env,
};
use crate::common::error::ErrorKind;
use crate::common::placeholders::{PlaceholderMap, resolve};
use crate::config::locator::Locator;
use crate::config::{RUN_LABEL, RunConfig, StorageMode};
use crate::split::BatchManifest;
use crate::storage::{ObjectStorage, StorageError, run_blocking};

const PVC_TEMPLATE: &str = include_str!("../templates/pvc.yaml.template");

pub const MANIFEST_FILE: &str = "elastic-blast-manifest.json";
pub const QUERY_LENGTH_FILE: &str = "query_length.txt";
pub const NUM_BATCHES_FILE: &str = "num_batches.txt";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Cluster {name} already exists, set `reuse` to use it or choose another name")]
    ClusterExists { name: String },
    #[error("Cluster {name} cannot be used, it is in state {state}")]
    ClusterUnusable { name: String, state: ClusterState },
    #[error("Cannot create cluster {name}: {source}")]
    Cluster { name: String, source: CloudError },
    #[error("Creation of cluster {name} did not finish within {}", humantime::format_duration(*.timeout))]
    ClusterTimedOut { name: String, timeout: Duration },
    #[error("Cannot access cluster {name}: {source}")]
    Credentials { name: String, source: CloudError },
    #[error("Cannot create shared storage {name}: {source}")]
    Storage { name: String, source: CloudError },
    #[error("Cannot write run metadata: {0}")]
    Metadata(#[source] StorageError),
    #[error("Provisioning was interrupted")]
    Interrupted,
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::ClusterExists { .. } => ErrorKind::Input,
            ProvisionError::ClusterUnusable { .. } | ProvisionError::ClusterTimedOut { .. } => {
                ErrorKind::Cluster
            }
            ProvisionError::Cluster { source, .. }
            | ProvisionError::Credentials { source, .. }
            | ProvisionError::Storage { source, .. } => source.kind(),
            ProvisionError::Metadata(error) => error.kind(),
            ProvisionError::Interrupted => ErrorKind::Interrupted,
        }
    }
}

type ProvisionResult<T> = Result<T, ProvisionError>;

/// Runs `future` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = ProvisionResult<T>>,
) -> ProvisionResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisionError::Interrupted),
        result = future => result,
    }
}

/// Labels attached to the cluster. User labels take precedence.
pub fn cluster_labels(config: &RunConfig) -> BTreeMap<String, String> {
    let mut labels = config.cluster().labels.clone();
    for (key, value) in [
        ("created-by", "elastic-blast".to_string()),
        (RUN_LABEL, config.run_id().to_string()),
        ("program", config.blast().program.name().to_string()),
        ("version", ELB_VERSION.to_string()),
    ] {
        labels.entry(key.to_string()).or_insert(value);
    }
    labels
}

pub fn cluster_undo(provider: Rc<dyn CloudProvider>, name: String) -> UndoAction {
    UndoAction::new(ResourceKind::Cluster, name.clone(), move || async move {
        provider.delete_cluster(&name).await?;
        Ok(())
    })
}

pub fn storage_undo(
    provider: Rc<dyn CloudProvider>,
    cluster: ClusterHandle,
    name: String,
) -> UndoAction {
    UndoAction::new(ResourceKind::SharedStorage, name.clone(), move || async move {
        provider.delete_storage(&cluster, &name).await?;
        Ok(())
    })
}

/// Removes everything stored under `prefix`.
pub fn prefix_undo(
    kind: ResourceKind,
    storage: Arc<dyn ObjectStorage>,
    prefix: Locator,
) -> UndoAction {
    UndoAction::new(kind, prefix.to_string(), move || async move {
        run_blocking(move || storage.remove_prefix(&prefix)).await?;
        Ok(())
    })
}

async fn create_cluster(
    config: &RunConfig,
    provider: &Rc<dyn CloudProvider>,
    stack: &mut CleanupStack,
    cancel: &CancellationToken,
) -> ProvisionResult<()> {
    let cluster = config.cluster();
    let name = cluster.name.clone();
    let labels = cluster_labels(config);

    log::info!(
        "Creating cluster {name} with {} {} node(s)",
        cluster.num_nodes,
        cluster.machine_type
    );
    let create = async {
        let creation = provider.create_cluster(cluster, &labels);
        let result = match get_duration_from_env(ELB_CLUSTER_CREATE_TIMEOUT_MS) {
            Some(timeout) => tokio::time::timeout(timeout, creation)
                .await
                .map_err(|_| ProvisionError::ClusterTimedOut {
                    name: name.clone(),
                    timeout,
                })?,
            None => creation.await,
        };
        result.map_err(|source| ProvisionError::Cluster {
            name: name.clone(),
            source,
        })
    };
    let result = cancellable(cancel, create).await;

    match &result {
        Ok(()) => stack.push(cluster_undo(provider.clone(), name)),
        Err(error) => {
            // The control plane may keep working on an abandoned or failed request
            match provider.cluster_state(&name).await {
                Ok(None) => log::debug!("No trace of cluster {name} after: {error}"),
                Ok(Some(state)) => {
                    log::warn!("Cluster {name} was left in state {state}");
                    stack.push(cluster_undo(provider.clone(), name));
                }
                Err(state_error) => {
                    log::warn!("Cannot find out whether cluster {name} exists: {state_error}");
                    stack.push(cluster_undo(provider.clone(), name));
                }
            }
        }
    }
    result
}

fn pvc_manifest(config: &RunConfig, provider: &dyn CloudProvider, size: String) -> String {
    let mut map = PlaceholderMap::default();
    map.insert(ELB_PVC_NAME, config.storage_claim_name().into());
    map.insert(ELB_RUN_ID, config.run_id().to_string().into());
    map.insert(ELB_STORAGE_CLASS, provider.storage_class().into());
    map.insert(ELB_PD_SIZE, size.into());
    resolve(&map, PVC_TEMPLATE)
}

#[derive(Serialize)]
struct RunMetadata<'a> {
    version: &'static str,
    run_id: &'a str,
    cluster: &'a str,
    program: &'static str,
    db: &'a str,
    batch_len: u64,
    created: String,
    #[serde(flatten)]
    manifest: &'a BatchManifest,
}

async fn write_metadata(
    config: &RunConfig,
    storage: &Arc<dyn ObjectStorage>,
    manifest: &BatchManifest,
    stack: &mut CleanupStack,
) -> ProvisionResult<()> {
    let metadata = RunMetadata {
        version: ELB_VERSION,
        run_id: config.run_id().as_str(),
        cluster: &config.cluster().name,
        program: config.blast().program.name(),
        db: &config.blast().db,
        batch_len: config.blast().batch_len,
        created: chrono::Utc::now().to_rfc3339(),
        manifest,
    };
    let json = serde_json::to_string_pretty(&metadata).map_err(|error| {
        ProvisionError::Metadata(StorageError::Io {
            locator: MANIFEST_FILE.to_string(),
            source: error.into(),
        })
    })?;

    let prefix = config.metadata_prefix();
    let objects = vec![
        (prefix.join(MANIFEST_FILE), json),
        (prefix.join(QUERY_LENGTH_FILE), manifest.total_size().to_string()),
        (prefix.join(NUM_BATCHES_FILE), manifest.len().to_string()),
    ];
    let writer = storage.clone();
    let result = run_blocking(move || {
        for (locator, content) in objects {
            writer.write(&locator, content.as_bytes())?;
        }
        Ok(())
    })
    .await;

    // Registered even after a failure, some objects may have been written
    stack.push(prefix_undo(
        ResourceKind::RunMetadata,
        storage.clone(),
        prefix,
    ));
    result.map_err(ProvisionError::Metadata)
}

/// Prepares the cluster of a run. Every created resource is registered in
/// `stack` before the next step starts.
pub async fn provision(
    config: &RunConfig,
    provider: &Rc<dyn CloudProvider>,
    storage: &Arc<dyn ObjectStorage>,
    manifest: &BatchManifest,
    stack: &mut CleanupStack,
    cancel: &CancellationToken,
) -> ProvisionResult<ClusterHandle> {
    let name = config.cluster().name.clone();

    let state = cancellable(cancel, async {
        provider
            .cluster_state(&name)
            .await
            .map_err(|source| ProvisionError::Cluster {
                name: name.clone(),
                source,
            })
    })
    .await?;
    match state {
        Some(state) if config.cluster().reuse => {
            if !state.is_usable() {
                return Err(ProvisionError::ClusterUnusable { name, state });
            }
            log::info!("Using existing cluster {name}");
        }
        Some(_) => return Err(ProvisionError::ClusterExists { name }),
        None => create_cluster(config, provider, stack, cancel).await?,
    }

    let cluster = cancellable(cancel, async {
        provider
            .get_credentials(&name)
            .await
            .map_err(|source| ProvisionError::Credentials {
                name: name.clone(),
                source,
            })
    })
    .await?;

    if let StorageMode::Shared { size } = config.cluster().storage {
        let claim = config.storage_claim_name();
        log::info!("Creating shared storage {claim} of {size}");
        let manifest = pvc_manifest(config, provider.as_ref(), size.to_k8s_quantity());
        cancellable(cancel, async {
            provider
                .create_storage(&cluster, manifest)
                .await
                .map_err(|source| ProvisionError::Storage {
                    name: claim.clone(),
                    source,
                })
        })
        .await?;
        stack.push(storage_undo(provider.clone(), cluster.clone(), claim));
    }

    if cancel.is_cancelled() {
        return Err(ProvisionError::Interrupted);
    }
    write_metadata(config, storage, manifest, stack).await?;
    Ok(cluster)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::{MANIFEST_FILE, NUM_BATCHES_FILE, ProvisionError, cluster_labels, provision};
    use crate::cleanup::{CleanupStack, ResourceKind};
    use crate::cloud::{CloudProvider, ClusterState};
    use crate::common::error::ErrorKind;
    use crate::split::BatchManifest;
    use crate::storage::ObjectStorage;
    use crate::tests::{MemoryStorage, MockProvider, test_run};

    struct Fixture {
        mock: MockProvider,
        provider: Rc<dyn CloudProvider>,
        storage: Arc<MemoryStorage>,
        stack: CleanupStack,
    }

    impl Fixture {
        fn new() -> Self {
            let mock = MockProvider::new();
            Self {
                provider: Rc::new(mock.clone()),
                mock,
                storage: Arc::new(MemoryStorage::default()),
                stack: CleanupStack::new(),
            }
        }

        fn storage(&self) -> Arc<dyn ObjectStorage> {
            self.storage.clone()
        }

        fn kinds(&self) -> Vec<ResourceKind> {
            self.stack.entries().map(|(kind, _)| kind).collect()
        }
    }

    #[tokio::test]
    async fn test_provision_new_cluster() {
        let mut fx = Fixture::new();
        let config = test_run().build();
        let storage = fx.storage();
        let cluster = provision(
            &config,
            &fx.provider,
            &storage,
            &BatchManifest::default(),
            &mut fx.stack,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(cluster.name, config.cluster().name);
        assert_eq!(
            fx.kinds(),
            vec![
                ResourceKind::Cluster,
                ResourceKind::SharedStorage,
                ResourceKind::RunMetadata
            ]
        );
        assert_eq!(
            fx.mock.state.get().calls_of("create_storage"),
            vec![config.storage_claim_name()]
        );
        let metadata = config.metadata_prefix();
        assert_eq!(
            fx.storage.get(metadata.join(NUM_BATCHES_FILE).as_str()).unwrap(),
            "0"
        );
        assert!(fx.storage.get(metadata.join(MANIFEST_FILE).as_str()).is_some());

        let errors = fx.stack.unwind_all().await;
        assert!(errors.is_empty());
        assert!(fx.storage.keys().is_empty());
        assert_eq!(fx.mock.state.get().calls_of("delete_cluster").len(), 1);
    }

    #[tokio::test]
    async fn test_local_ssd_has_no_shared_storage() {
        let mut fx = Fixture::new();
        let config = test_run().use_local_ssd(true).build();
        let storage = fx.storage();
        provision(
            &config,
            &fx.provider,
            &storage,
            &BatchManifest::default(),
            &mut fx.stack,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(
            fx.kinds(),
            vec![ResourceKind::Cluster, ResourceKind::RunMetadata]
        );
        fx.stack.commit();
    }

    #[tokio::test]
    async fn test_reused_cluster_is_not_deleted() {
        let mut fx = Fixture::new();
        fx.mock.state.get_mut().cluster = Some(ClusterState::Running);
        let config = test_run().reuse(true).build();
        let storage = fx.storage();
        provision(
            &config,
            &fx.provider,
            &storage,
            &BatchManifest::default(),
            &mut fx.stack,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!fx.kinds().contains(&ResourceKind::Cluster));
        assert!(fx.mock.state.get().calls_of("create_cluster").is_empty());
        fx.stack.commit();
    }

    #[tokio::test]
    async fn test_existing_cluster_without_reuse() {
        let mut fx = Fixture::new();
        fx.mock.state.get_mut().cluster = Some(ClusterState::Running);
        let config = test_run().build();
        let storage = fx.storage();
        let error = provision(
            &config,
            &fx.provider,
            &storage,
            &BatchManifest::default(),
            &mut fx.stack,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, ProvisionError::ClusterExists { .. }));
        assert!(fx.stack.is_empty());
    }

    #[tokio::test]
    async fn test_partial_cluster_is_registered() {
        let mut fx = Fixture::new();
        {
            let mut state = fx.mock.state.get_mut();
            state.fail_create_cluster = true;
            state.leave_partial_cluster = true;
        }
        let config = test_run().build();
        let storage = fx.storage();
        let error = provision(
            &config,
            &fx.provider,
            &storage,
            &BatchManifest::default(),
            &mut fx.stack,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Cluster);
        assert_eq!(fx.kinds(), vec![ResourceKind::Cluster]);

        fx.stack.unwind_all().await;
        assert!(fx.mock.state.get().cluster.is_none());
    }

    #[tokio::test]
    async fn test_failed_create_without_trace() {
        let mut fx = Fixture::new();
        fx.mock.state.get_mut().fail_create_cluster = true;
        let config = test_run().build();
        let storage = fx.storage();
        assert!(
            provision(
                &config,
                &fx.provider,
                &storage,
                &BatchManifest::default(),
                &mut fx.stack,
                &CancellationToken::new(),
            )
            .await
            .is_err()
        );
        assert!(fx.stack.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_cluster_undo() {
        let mut fx = Fixture::new();
        fx.mock.state.get_mut().fail_create_storage = true;
        let config = test_run().build();
        let storage = fx.storage();
        let error = provision(
            &config,
            &fx.provider,
            &storage,
            &BatchManifest::default(),
            &mut fx.stack,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, ProvisionError::Storage { .. }));
        assert_eq!(fx.kinds(), vec![ResourceKind::Cluster]);
        fx.stack.unwind_all().await;
    }

    #[tokio::test]
    async fn test_interrupted_provisioning() {
        let mut fx = Fixture::new();
        let config = test_run().build();
        let storage = fx.storage();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = provision(
            &config,
            &fx.provider,
            &storage,
            &BatchManifest::default(),
            &mut fx.stack,
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Interrupted);
        assert!(fx.stack.is_empty());
    }

    #[test]
    fn test_user_labels_take_precedence() {
        let config = test_run().build();
        let labels = cluster_labels(&config);
        assert_eq!(labels["created-by"], "elastic-blast");
        assert_eq!(labels["elb-run"], config.run_id().as_str());
        assert_eq!(labels["program"], "blastn");
    }
}
