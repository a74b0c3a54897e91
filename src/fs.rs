use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use nix::dir::{Dir, Type};
use nix::fcntl::{openat, AtFlags, OFlag};
use nix::sys::stat::{fstatat, makedev, mknod, Mode, SFlag};
use nix::unistd::{unlinkat, UnlinkatFlags};

use crate::error::{Result, SandboxError};

const MAX_SYMLINK_HOPS: usize = 40;

/// Resolves `command` to an absolute host path. Commands without a leading
/// `/` are looked up on `PATH`.
pub fn resolve_command(command: &str) -> Result<PathBuf> {
    let path = Path::new(command);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    which::which(command).map_err(|e| SandboxError::Staging {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::NotFound, e.to_string()),
    })
}

/// Copies the executable at absolute `command` into `root` under the same
/// path, so it can be exec'd by that path once `root` becomes `/`.
/// Returns the staged file's host path.
pub fn stage_executable(command: &Path, root: &Path) -> Result<PathBuf> {
    let relative = command.strip_prefix("/").unwrap_or(command);

    let staging_err = |source| SandboxError::Staging {
        path: command.to_path_buf(),
        source,
    };

    let dest = resolve_in_root(root, relative).map_err(staging_err)?;

    // A layer may already ship this path as a symlink (e.g. busybox applets);
    // copying through it would write outside the root.
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(&dest).map_err(staging_err)?;
    }

    let bytes = fs::copy(command, &dest).map_err(staging_err)?;
    tracing::debug!(command = %command.display(), dest = %dest.display(), bytes, "staged executable");
    Ok(dest)
}

/// Host path of `relative` as the sandbox will see it once `root` is `/`.
///
/// Intermediate symlinks shipped by layers are followed as if `root` were
/// already the filesystem root, so absolute targets and `..` never leave it.
/// Missing intermediate directories are created. The final component is not
/// followed.
pub fn resolve_in_root(root: &Path, relative: &Path) -> io::Result<PathBuf> {
    let mut pending: VecDeque<OsString> = VecDeque::new();
    push_front_components(&mut pending, relative);

    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let is_last = pending.is_empty();
        let candidate = root.join(&resolved).join(&part);
        match candidate.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() && !is_last => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(io::Error::from_raw_os_error(nix::libc::ELOOP));
                }
                let target = fs::read_link(&candidate)?;
                if target.is_absolute() {
                    resolved.clear();
                }
                push_front_components(&mut pending, &target);
            }
            Ok(meta) if is_last || meta.is_dir() => resolved.push(&part),
            Ok(_) => return Err(io::Error::from_raw_os_error(nix::libc::ENOTDIR)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !is_last {
                    fs::create_dir(&candidate)?;
                }
                resolved.push(&part);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(root.join(resolved))
}

fn push_front_components(pending: &mut VecDeque<OsString>, path: &Path) {
    let parts: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect();
    for part in parts.into_iter().rev() {
        pending.push_front(part);
    }
}

/// Makes `<root>/dev/null` available inside the sandbox. Needs `CAP_MKNOD` for
/// a real character device; without it an empty regular file stands in.
pub fn create_dev_null(root: &Path) -> Result<()> {
    let dev_null = resolve_in_root(root, Path::new("dev/null")).map_err(|source| {
        SandboxError::Staging {
            path: root.join("dev/null"),
            source,
        }
    })?;
    if dev_null.symlink_metadata().is_ok() {
        return Ok(());
    }

    if let Err(errno) = mknod(
        dev_null.as_path(),
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        makedev(1, 3),
    ) {
        tracing::warn!(%errno, "cannot create /dev/null device, using a regular file");
        fs::File::create(&dev_null).map_err(|source| SandboxError::Staging {
            path: dev_null.clone(),
            source,
        })?;
    }

    Ok(())
}

/// Removes the directory `name` inside the directory open as `parent`,
/// with everything below it. Works through descriptors only, so it still
/// reaches a root this process has since chrooted into. Symlinks are
/// removed, never followed.
pub fn remove_tree_at(parent: &File, name: &OsStr) -> io::Result<()> {
    remove_dir_at(parent.as_raw_fd(), name)?;
    Ok(())
}

fn remove_dir_at(parent: RawFd, name: &OsStr) -> nix::Result<()> {
    let fd = openat(
        parent,
        name,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let mut dir = Dir::from_fd(fd)?;

    let mut children = Vec::new();
    for entry in dir.iter() {
        let entry = entry?;
        let child = entry.file_name();
        if child.to_bytes() == b"." || child.to_bytes() == b".." {
            continue;
        }
        children.push((OsStr::from_bytes(child.to_bytes()).to_os_string(), entry.file_type()));
    }

    let dir_fd = dir.as_raw_fd();
    for (child, file_type) in children {
        let is_dir = match file_type {
            Some(file_type) => file_type == Type::Directory,
            None => {
                let stat = fstatat(dir_fd, child.as_os_str(), AtFlags::AT_SYMLINK_NOFOLLOW)?;
                SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFDIR
            }
        };

        if is_dir {
            remove_dir_at(dir_fd, &child)?;
        } else {
            unlinkat(Some(dir_fd), child.as_os_str(), UnlinkatFlags::NoRemoveDir)?;
        }
    }

    unlinkat(Some(parent), name, UnlinkatFlags::RemoveDir)
}

/// Logs every entry below `dir` at trace level.
pub fn trace_dir(dir: &Path) {
    if !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::trace!(dir = %dir.display(), error = %e, "cannot list directory");
            return;
        }
    };

    for e in entries.flatten() {
        let Ok(file_type) = e.file_type() else {
            continue;
        };
        let path = e.path();
        if file_type.is_symlink() {
            let target = fs::read_link(&path).unwrap_or_default();
            tracing::trace!("L    {} -> {}", path.display(), target.display());
        } else if file_type.is_dir() {
            tracing::trace!("d    {}", path.display());
            trace_dir(&path);
        } else {
            tracing::trace!("f    {}", path.display());
        }
    }
}
