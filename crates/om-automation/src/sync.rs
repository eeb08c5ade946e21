//! Serialized read-modify-write cycles against a stored automation config.
//!
//! Ops Manager keeps one automation config per project. Every update reads the
//! whole document, merges into it and writes it back, so two updates of the
//! same project must never interleave. [`ProjectLocks`] hands out one lock per
//! project and [`read_update_deployment`] holds it for the whole cycle.

use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::{
    deployment::Deployment,
    document::{self, semantically_equal},
};

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to read the automation config of project {project}"))]
    ReadDeployment { source: BoxedError, project: ProjectKey },

    #[snafu(display("failed to update the automation config of project {project}"))]
    UpdateDeployment { source: BoxedError, project: ProjectKey },

    #[snafu(display("failed to modify the automation config of project {project}"))]
    ModifyDeployment { source: BoxedError, project: ProjectKey },

    #[snafu(display("failed to compare the automation config of project {project}"))]
    CompareDeployment {
        source: document::Error,
        project: ProjectKey,
    },
}

/// Identifies the automation config of one Ops Manager project.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ProjectKey {
    pub project: String,
    pub organization: String,
}

impl ProjectKey {
    pub fn new(project: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            organization: organization.into(),
        }
    }
}

impl Display for ProjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization, self.project)
    }
}

/// Lazily created locks, one per project. Clones share the same registry.
#[derive(Clone, Debug, Default)]
pub struct ProjectLocks {
    locks: Arc<Mutex<HashMap<ProjectKey, Arc<Mutex<()>>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder of the lock for `key` is left.
    pub async fn lock(&self, key: &ProjectKey) -> OwnedMutexGuard<()> {
        self.lock_for(key).await.lock_owned().await
    }

    async fn lock_for(&self, key: &ProjectKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }
}

/// Where automation configs are read from and written to.
//
// async-trait keeps the trait usable as `dyn DeploymentStore`.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The project whose automation config this store holds.
    fn project_key(&self) -> ProjectKey;

    async fn read_deployment(&self) -> Result<Deployment, Self::Error>;

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Self::Error>;
}

/// Reads the automation config, runs `modify` on it and writes the result back.
///
/// The cycle holds the project lock from `locks` for its whole duration. The
/// write is skipped when the modified document is semantically equal to the
/// one that was read. Returns whether the document was written.
pub async fn read_update_deployment<S, F, E>(store: &S, locks: &ProjectLocks, modify: F) -> Result<bool>
where
    S: DeploymentStore + ?Sized,
    F: FnOnce(&mut Deployment) -> Result<(), E> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let project = store.project_key();
    let _guard = locks.lock(&project).await;

    let original = store
        .read_deployment()
        .await
        .boxed()
        .context(ReadDeploymentSnafu {
            project: project.clone(),
        })?;

    let mut deployment = original.clone();
    modify(&mut deployment)
        .boxed()
        .context(ModifyDeploymentSnafu {
            project: project.clone(),
        })?;

    let before = original.to_value().context(CompareDeploymentSnafu {
        project: project.clone(),
    })?;
    let after = deployment.to_value().context(CompareDeploymentSnafu {
        project: project.clone(),
    })?;

    if semantically_equal(&before, &after) {
        debug!(project = %project, "automation config is unchanged, skipping update");
        return Ok(false);
    }

    let changes = json_patch::diff(&before, &after).0.len();
    info!(
        project = %project,
        changed_paths = changes,
        "updating automation config"
    );
    store
        .update_deployment(&deployment)
        .await
        .boxed()
        .context(UpdateDeploymentSnafu { project })?;
    Ok(true)
}

#[derive(Debug, Snafu)]
pub enum FileStoreError {
    #[snafu(display("failed to read automation config from {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse automation config from {path:?}"))]
    ParseFile {
        source: document::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to serialize automation config"))]
    SerializeDeployment { source: serde_json::Error },

    #[snafu(display("failed to write automation config to {path:?}"))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Keeps the automation config of a single project in a JSON file.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
    project: ProjectKey,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, project: ProjectKey) -> Self {
        Self {
            path: path.into(),
            project,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeploymentStore for FileStore {
    type Error = FileStoreError;

    fn project_key(&self) -> ProjectKey {
        self.project.clone()
    }

    async fn read_deployment(&self) -> Result<Deployment, FileStoreError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .context(ReadFileSnafu { path: &self.path })?;
        Deployment::from_slice(&bytes).context(ParseFileSnafu { path: &self.path })
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), FileStoreError> {
        let mut bytes = serde_json::to_vec_pretty(deployment).context(SerializeDeploymentSnafu)?;
        bytes.push(b'\n');
        tokio::fs::write(&self.path, bytes)
            .await
            .context(WriteFileSnafu { path: &self.path })
    }
}
