//! Blocking filesystem primitives.
//!
//! These are the only functions that touch the OS. The inline strategy calls
//! them directly, the native provider calls them on the blocking pool and
//! workers call them from their own thread or process.

use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::metadata::{FsRequest, FsResponse, Metadata};
use crate::mode::OpenMode;

/// Open `path` and report its current size.
pub(crate) fn open(path: &Path, mode: OpenMode) -> Result<(File, u64)> {
    let file = mode
        .to_open_options()
        .open(path)
        .map_err(|err| Error::filesystem(&format!("open ({mode})"), path, err))?;
    let meta = file
        .metadata()
        .map_err(|err| Error::filesystem("stat", path, err))?;
    if meta.is_dir() {
        return Err(Error::Filesystem(format!(
            "open ({mode}) {}: is a directory",
            path.display()
        )));
    }
    Ok((file, meta.len()))
}

/// Read up to `length` bytes at `offset`.
///
/// Short reads only happen at end of file; an empty buffer means there was
/// nothing left to read. The buffer never outgrows what the file holds past
/// `offset`, whatever `length` asks for.
pub(crate) fn read_at(file: &File, offset: u64, length: usize) -> io::Result<Vec<u8>> {
    let available = file.metadata()?.len().saturating_sub(offset);
    let length = usize::try_from(available).map_or(length, |available| available.min(length));
    let mut buf = vec![0u8; length];
    let mut filled = 0;
    while filled < length {
        match pread(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Write all of `data` at `offset`.
pub(crate) fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match pwrite(file, &data[written..], offset + written as u64) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Resize the file, zero-filling when it grows.
pub(crate) fn truncate(file: &File, size: u64) -> io::Result<()> {
    file.set_len(size)
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

/// Execute a whole-path request.
pub(crate) fn execute(request: FsRequest) -> Result<FsResponse> {
    match request {
        FsRequest::Status { path } => stat(&path, |p: &Path| fs::metadata(p)),
        FsRequest::LinkStatus { path } => stat(&path, |p: &Path| fs::symlink_metadata(p)),
        FsRequest::Touch { path } => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|err| Error::filesystem("touch", &path, err))?;
            file.set_modified(SystemTime::now())
                .map_err(|err| Error::filesystem("touch", &path, err))?;
            Ok(FsResponse::Done)
        }
        FsRequest::DeleteFile { path } => {
            fs::remove_file(&path).map_err(|err| Error::filesystem("delete", &path, err))?;
            Ok(FsResponse::Done)
        }
        FsRequest::Move { from, to } => {
            fs::rename(&from, &to).map_err(|err| {
                Error::Filesystem(format!(
                    "move {} to {}: {err}",
                    from.display(),
                    to.display()
                ))
            })?;
            Ok(FsResponse::Done)
        }
        FsRequest::CreateDirectory { path, recursive } => {
            let created = if recursive {
                fs::create_dir_all(&path)
            } else {
                fs::create_dir(&path)
            };
            created.map_err(|err| Error::filesystem("create directory", &path, err))?;
            Ok(FsResponse::Done)
        }
        FsRequest::DeleteDirectory { path } => {
            fs::remove_dir(&path)
                .map_err(|err| Error::filesystem("delete directory", &path, err))?;
            Ok(FsResponse::Done)
        }
        FsRequest::ListFiles { path } => {
            let entries =
                fs::read_dir(&path).map_err(|err| Error::filesystem("list", &path, err))?;
            let mut names = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|err| Error::filesystem("list", &path, err))?;
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(FsResponse::Names(names))
        }
        FsRequest::ChangePermissions { path, mode } => {
            set_permissions(&path, mode)
                .map_err(|err| Error::filesystem("change permissions", &path, err))?;
            Ok(FsResponse::Done)
        }
        FsRequest::CreateSymlink { target, link } => {
            symlink(&target, &link)
                .map_err(|err| Error::filesystem("create symlink", &link, err))?;
            Ok(FsResponse::Done)
        }
        FsRequest::ResolveSymlink { path } => {
            let target =
                fs::read_link(&path).map_err(|err| Error::filesystem("resolve", &path, err))?;
            Ok(FsResponse::Path(target))
        }
        FsRequest::Read { path } => {
            let contents = fs::read(&path).map_err(|err| Error::filesystem("read", &path, err))?;
            Ok(FsResponse::Contents(contents))
        }
        FsRequest::Write { path, contents } => {
            fs::write(&path, contents).map_err(|err| Error::filesystem("write", &path, err))?;
            Ok(FsResponse::Done)
        }
    }
}

fn stat(path: &Path, lookup: fn(&Path) -> io::Result<fs::Metadata>) -> Result<FsResponse> {
    match lookup(path) {
        Ok(meta) => Ok(FsResponse::Status(Some(Metadata::from_std(&meta)))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(FsResponse::Status(None)),
        Err(err) => Err(Error::filesystem("stat", path, err)),
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, permissions)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
