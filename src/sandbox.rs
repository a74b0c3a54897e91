use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, chroot};

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::fs::{create_dev_null, remove_tree_at, resolve_command, stage_executable, trace_dir};
use crate::images::DockerRegistryClient;
use crate::layer::{blob_path, materialize};
use crate::reference::ImageReference;
use crate::transport::Transport;

static ROOT_PREFIX: &str = "minidock.";

/// Exit status reported when the target command cannot be exec'd.
pub const EXEC_FAILURE_STATUS: i32 = 1;

/// Ephemeral directory that becomes the sandbox's `/`. Removed on drop, or
/// by [`SandboxRoot::cleanup`], through a descriptor of its parent directory
/// so removal still works after the process has chrooted into it.
#[derive(Debug)]
pub struct SandboxRoot {
    path: PathBuf,
    name: OsString,
    parent: Option<File>,
}

impl SandboxRoot {
    /// Allocates a uniquely named root under `base`. With `keep` set the
    /// directory outlives this value.
    pub fn create_in(base: &Path, keep: bool) -> Result<Self> {
        let staging_err = |source| SandboxError::Staging {
            path: base.to_path_buf(),
            source,
        };

        let dir = tempfile::Builder::new()
            .prefix(ROOT_PREFIX)
            .tempdir_in(base)
            .map_err(staging_err)?;

        let parent = if keep {
            None
        } else {
            match File::open(base) {
                Ok(parent) => Some(parent),
                Err(e) => {
                    let _ = dir.close();
                    return Err(staging_err(e));
                }
            }
        };

        let path = dir.keep();
        let name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
        tracing::debug!(root = %path.display(), keep, "created sandbox root");

        Ok(Self { path, name, parent })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory now, reporting any failure.
    pub fn cleanup(mut self) -> io::Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> io::Result<()> {
        match self.parent.take() {
            Some(parent) => {
                remove_tree_at(&parent, &self.name)?;
                tracing::debug!(root = %self.path.display(), "removed sandbox root");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for SandboxRoot {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!(root = %self.path.display(), error = %e, "failed to remove sandbox root");
        }
    }
}

/// Result of entering an isolation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isolated {
    /// Directory that plays `/` for the child, as seen by this process.
    pub exec_root: PathBuf,
}

impl Isolated {
    fn resolve(&self, command: &Path) -> PathBuf {
        self.exec_root
            .join(command.strip_prefix("/").unwrap_or(command))
    }
}

/// One-shot capability that moves the process into the sandbox root.
pub trait Isolation {
    fn enter(self, root: &Path) -> Result<Isolated>;
}

/// `chroot` into the root, then unshare the PID namespace so the next child
/// is PID 1. Irreversible for the calling process.
#[derive(Debug, Default)]
pub struct ChrootIsolation;

impl Isolation for ChrootIsolation {
    fn enter(self, root: &Path) -> Result<Isolated> {
        let isolation_err = |source| SandboxError::Isolation {
            root: root.to_path_buf(),
            source,
        };

        chdir(root).map_err(isolation_err)?;
        chroot(root).map_err(isolation_err)?;
        chdir("/").map_err(isolation_err)?;
        unshare(CloneFlags::CLONE_NEWPID).map_err(isolation_err)?;
        tracing::debug!(root = %root.display(), "entered chroot and PID namespace");

        Ok(Isolated {
            exec_root: PathBuf::from("/"),
        })
    }
}

/// Leaves the process where it is; the command runs from inside the root by
/// its host path.
#[derive(Debug, Default)]
pub struct NoIsolation;

impl Isolation for NoIsolation {
    fn enter(self, root: &Path) -> Result<Isolated> {
        tracing::warn!(root = %root.display(), "running without isolation");
        Ok(Isolated {
            exec_root: root.to_path_buf(),
        })
    }
}

/// Pulls an image into a fresh root and runs one command inside it.
pub struct Sandbox<'a, T: Transport, I: Isolation> {
    config: &'a Config,
    transport: &'a T,
    isolation: I,
}

impl<'a, T: Transport, I: Isolation> Sandbox<'a, T, I> {
    pub fn new(config: &'a Config, transport: &'a T, isolation: I) -> Self {
        Self {
            config,
            transport,
            isolation,
        }
    }

    /// Runs `command args..` inside `image`, relaying the child's stdout and
    /// stderr to `out` and `err`. Returns the child's exit status.
    pub fn run<O: Write, E: Write>(
        self,
        image: &str,
        command: &str,
        args: &[String],
        out: &mut O,
        err: &mut E,
    ) -> Result<i32> {
        let reference = ImageReference::parse(image);

        let root = SandboxRoot::create_in(&self.config.temp_base, self.config.keep_root)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| SandboxError::Runtime { source })?;
        runtime.block_on(pull_image(self.transport, self.config, &reference, root.path()))?;
        drop(runtime);
        trace_dir(root.path());

        let command = resolve_command(command)?;
        create_dev_null(root.path())?;
        stage_executable(&command, root.path())?;

        let isolated = self.isolation.enter(root.path())?;
        let status = spawn_and_relay(&isolated, &command, args, out, err)?;

        if let Err(e) = root.cleanup() {
            tracing::warn!(error = %e, "failed to remove sandbox root");
        }

        Ok(status)
    }
}

/// Fetches every layer of `reference` in manifest order and applies it onto
/// `root`.
pub async fn pull_image<T: Transport>(
    transport: &T,
    config: &Config,
    reference: &ImageReference,
    root: &Path,
) -> Result<()> {
    let client = DockerRegistryClient::new(transport, config);

    let token = client.request_token(&reference.pull_scope()).await?;
    let layers = client.fetch_manifest(&token, reference).await?;
    if layers.is_empty() {
        return Err(SandboxError::Manifest {
            image: reference.to_string(),
            reason: "manifest lists no layers".to_string(),
        });
    }

    tracing::info!(image = %reference, layers = layers.len(), "pulling image");
    for digest in &layers {
        let blob = blob_path(root, digest);
        client.fetch_layer_blob(&token, reference, digest, &blob).await?;
        materialize(&blob, root)?;
    }

    Ok(())
}

fn spawn_and_relay<O: Write, E: Write>(
    isolated: &Isolated,
    command: &Path,
    args: &[String],
    out: &mut O,
    err: &mut E,
) -> Result<i32> {
    let program = isolated.resolve(command);
    let spawned = Command::new(&program)
        .args(args)
        .current_dir(&isolated.exec_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let child = match spawned {
        Ok(child) => child,
        Err(e) if is_exec_failure(&e) => {
            tracing::debug!(program = %program.display(), error = %e, "command could not be executed");
            return Ok(EXEC_FAILURE_STATUS);
        }
        Err(source) => {
            return Err(SandboxError::Spawn {
                command: program.display().to_string(),
                source,
            })
        }
    };
    tracing::debug!(pid = child.id(), program = %program.display(), "child started");

    let spawn_err = |source| SandboxError::Spawn {
        command: program.display().to_string(),
        source,
    };

    let output = child.wait_with_output().map_err(spawn_err)?;
    out.write_all(&output.stdout).map_err(spawn_err)?;
    out.flush().map_err(spawn_err)?;
    err.write_all(&output.stderr).map_err(spawn_err)?;
    err.flush().map_err(spawn_err)?;

    let status = exit_code(output.status);
    tracing::debug!(status, "child exited");
    Ok(status)
}

fn is_exec_failure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    ) || e.raw_os_error() == Some(nix::libc::ENOEXEC)
}

/// Exit code of a finished child; death by signal maps to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
