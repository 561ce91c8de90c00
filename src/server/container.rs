//! Container backend
//!
//! Runs the language server inside an OCI container via the `docker`,
//! `podman` or `nerdctl` CLI: `run -i` with stdio attached, workspace
//! folders bind-mounted at their host paths so file URIs stay valid inside
//! the container. Containers are removed on exit by default; reusable
//! containers get a deterministic name derived from the image and the
//! workspace so a second session finds the same one.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info};

use crate::io::process::ChildProcessManager;
use crate::server::error::BackendError;
use crate::server::{RunningServer, ServerBackend};
use crate::workspace::Workspace;

const DEFAULT_BACKEND: &str = "docker";
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Length of the hash suffix in generated container names
const NAME_HASH_LENGTH: usize = 12;

/// A `--mount` specification
#[derive(Debug, Clone, PartialEq)]
pub enum MountSpec {
    /// Bind a host path into the container
    Bind {
        source: PathBuf,
        target: String,
        readonly: bool,
        /// `bind-propagation`: rprivate, private, rshared, shared,
        /// rslave or slave
        propagation: Option<String>,
    },
    /// Mount a named (or anonymous) volume
    Volume {
        source: Option<String>,
        target: String,
        readonly: bool,
        /// `volume-driver`
        driver: Option<String>,
        /// `volume-subpath`: mount only this path within the volume
        subpath: Option<String>,
        /// `volume-nocopy`: skip copying existing image data into the volume
        nocopy: bool,
        /// `volume-opt` key/value pairs, passed through verbatim
        options: Vec<(String, String)>,
    },
    /// Mount a tmpfs
    Tmpfs {
        target: String,
        size_bytes: Option<u64>,
        mode: Option<u32>,
    },
}

impl MountSpec {
    /// Read-write bind mount of a host path at the same path inside
    pub fn bind_through<P: Into<PathBuf>>(path: P) -> Self {
        let source = path.into();
        let target = source.to_string_lossy().into_owned();
        MountSpec::Bind {
            source,
            target,
            readonly: false,
            propagation: None,
        }
    }

    /// Named volume mounted read-write with default options
    pub fn volume<S: Into<String>, T: Into<String>>(source: S, target: T) -> Self {
        MountSpec::Volume {
            source: Some(source.into()),
            target: target.into(),
            readonly: false,
            driver: None,
            subpath: None,
            nocopy: false,
            options: Vec::new(),
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSpec::Bind {
                source,
                target,
                readonly,
                propagation,
            } => {
                write!(f, "type=bind,source={},target={target}", source.display())?;
                if *readonly {
                    write!(f, ",readonly")?;
                }
                if let Some(propagation) = propagation {
                    write!(f, ",bind-propagation={propagation}")?;
                }
                Ok(())
            }
            MountSpec::Volume {
                source,
                target,
                readonly,
                driver,
                subpath,
                nocopy,
                options,
            } => {
                write!(f, "type=volume")?;
                if let Some(source) = source {
                    write!(f, ",source={source}")?;
                }
                write!(f, ",target={target}")?;
                if *readonly {
                    write!(f, ",readonly")?;
                }
                if let Some(driver) = driver {
                    write!(f, ",volume-driver={driver}")?;
                }
                if let Some(subpath) = subpath {
                    write!(f, ",volume-subpath={subpath}")?;
                }
                if *nocopy {
                    write!(f, ",volume-nocopy")?;
                }
                for (key, value) in options {
                    write!(f, ",volume-opt={key}={value}")?;
                }
                Ok(())
            }
            MountSpec::Tmpfs {
                target,
                size_bytes,
                mode,
            } => {
                write!(f, "type=tmpfs,target={target}")?;
                if let Some(size) = size_bytes {
                    write!(f, ",tmpfs-size={size}")?;
                }
                if let Some(mode) = mode {
                    write!(f, ",tmpfs-mode={mode:o}")?;
                }
                Ok(())
            }
        }
    }
}

/// Language server run inside a container
#[derive(Debug, Clone)]
pub struct ContainerServer {
    pub image: String,
    /// CLI used to run containers: docker, podman or nerdctl
    pub backend: String,
    /// Command to run inside the container; empty means the image entrypoint
    pub command: Vec<String>,
    /// Working directory inside the container; defaults to the workspace root
    pub workdir: Option<String>,
    pub mounts: Vec<MountSpec>,
    /// Explicit container name; overrides the generated one
    pub container_name: Option<String>,
    /// Remove the container on exit. When false the container gets a
    /// deterministic name so it can be found again.
    pub auto_remove: bool,
    pub extra_args: Vec<String>,
    pub shutdown_timeout: Duration,
}

impl ContainerServer {
    pub fn new<I: Into<String>>(image: I) -> Self {
        Self {
            image: image.into(),
            backend: DEFAULT_BACKEND.to_string(),
            command: Vec::new(),
            workdir: None,
            mounts: Vec::new(),
            container_name: None,
            auto_remove: true,
            extra_args: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_backend<B: Into<String>>(mut self, backend: B) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_workdir<W: Into<String>>(mut self, workdir: W) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    /// Deterministic reuse name: fixed prefix plus a short hash over the
    /// image and the sorted workspace folder URIs.
    pub fn generate_name(&self, workspace: &Workspace) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image.as_bytes());
        let mut uris = workspace.folder_uris();
        uris.sort();
        for uri in uris {
            hasher.update(uri.as_bytes());
        }
        let digest = hasher.finalize();
        let hex: String = digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect();
        format!("lsp-server-{}", &hex[..NAME_HASH_LENGTH])
    }

    /// The configured workdir, or the single workspace folder. A workspace
    /// with zero or several folders has no unambiguous default.
    fn effective_workdir(&self, workspace: &Workspace) -> Result<String, BackendError> {
        if let Some(workdir) = &self.workdir {
            return Ok(workdir.clone());
        }
        match workspace.folders() {
            [folder] => Ok(folder.path.to_string_lossy().into_owned()),
            folders => Err(BackendError::AmbiguousWorkdir {
                folders: folders.len(),
            }),
        }
    }

    /// The full argument vector for `<backend> run ...`
    pub fn format_args(&self, workspace: &Workspace) -> Result<Vec<String>, BackendError> {
        let mut args = vec!["run".to_string(), "-i".to_string()];

        if self.auto_remove {
            args.push("--rm".to_string());
        }

        let name = match (&self.container_name, self.auto_remove) {
            (Some(name), _) => Some(name.clone()),
            (None, false) => Some(self.generate_name(workspace)),
            (None, true) => None,
        };
        if let Some(name) = name {
            args.push("--name".to_string());
            args.push(name);
        }

        args.push("--workdir".to_string());
        args.push(self.effective_workdir(workspace)?);

        for mount in self.effective_mounts(workspace) {
            args.push("--mount".to_string());
            args.push(mount.to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        Ok(args)
    }

    /// Explicit mounts plus a pass-through bind for every workspace folder
    /// not already covered by one.
    fn effective_mounts(&self, workspace: &Workspace) -> Vec<MountSpec> {
        let mut mounts = self.mounts.clone();
        for folder in workspace.folders() {
            let covered = mounts.iter().any(|mount| {
                matches!(mount, MountSpec::Bind { source, .. } if *source == folder.path)
            });
            if !covered {
                mounts.push(MountSpec::bind_through(&folder.path));
            }
        }
        mounts
    }

    /// Check whether the image is present locally, pulling it if not
    async fn ensure_image(&self) -> Result<(), BackendError> {
        let inspect = Command::new(&self.backend)
            .args(["image", "inspect", &self.image])
            .output()
            .await
            .map_err(|e| BackendError::runtime(format!("failed to run {}: {e}", self.backend)))?;

        if inspect.status.success() {
            debug!("Image '{}' present locally", self.image);
            return Ok(());
        }

        info!("Pulling image '{}'", self.image);
        let pull = Command::new(&self.backend)
            .args(["pull", &self.image])
            .output()
            .await
            .map_err(|e| BackendError::runtime(format!("failed to run {}: {e}", self.backend)))?;

        if pull.status.success() {
            Ok(())
        } else {
            Err(BackendError::ImagePullFailed {
                image: self.image.clone(),
                reason: String::from_utf8_lossy(&pull.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ServerBackend for ContainerServer {
    fn name(&self) -> String {
        format!("container({})", self.image)
    }

    async fn check_availability(&self) -> Result<(), BackendError> {
        which::which(&self.backend).map_err(|_| BackendError::ContainerBackendNotFound {
            backend: self.backend.clone(),
        })?;
        self.ensure_image().await
    }

    async fn start(&self, workspace: &Workspace) -> Result<RunningServer, BackendError> {
        let args = self.format_args(workspace)?;
        info!("Starting container server: {} {:?}", self.backend, args);

        let mut process = ChildProcessManager::new(
            self.backend.clone(),
            args,
            std::collections::HashMap::new(),
            None,
        );
        process.start().await?;

        RunningServer::from_process(self.name(), process, self.shutdown_timeout)
    }
}
