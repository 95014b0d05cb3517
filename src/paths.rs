//! Path helpers shared by configuration, topology loading and file access.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If the `HOME` environment variable is not set, the input is returned
/// unchanged.
///
/// # Examples
///
/// ```
/// # use virtlab::paths::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/known_hosts"), format!("{home}/.ssh/known_hosts"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Splits `path` into its parent directory and file name.
pub(crate) fn split_file(path: &Utf8Path) -> io::Result<(&Utf8Path, &str)> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} is missing a file name"),
        )
    })?;
    Ok((parent, file_name))
}

/// Reads `path`, returning `None` when either the file or its directory is
/// absent.
pub(crate) fn read_optional(path: &Utf8Path) -> io::Result<Option<String>> {
    let (parent, file_name) = split_file(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Opens the directory holding `path`, creating it when absent, and returns
/// it with the file name.
pub(crate) fn open_parent(path: &Utf8Path) -> io::Result<(Dir, &str)> {
    let (parent, file_name) = split_file(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, file_name))
}

/// Replaces `path` with `contents`, creating parent directories as needed.
///
/// The contents are written to a sibling temporary file that is then
/// renamed over `path`, so readers see either the old or the new file.
pub(crate) fn write_file(path: &Utf8Path, contents: &str) -> io::Result<()> {
    let (dir, file_name) = open_parent(path)?;
    let staging = format!(".{file_name}.tmp");
    dir.write(&staging, contents)?;
    dir.rename(&staging, &dir, file_name)
}

/// Resolves `name` against `base` unless it is already absolute or
/// explicitly relative to the working directory.
#[must_use]
pub fn resolve_under(base: &Utf8Path, name: &str) -> Utf8PathBuf {
    let expanded = Utf8PathBuf::from(expand_tilde(name));
    if expanded.is_absolute() || name.starts_with("./") || name.starts_with("../") {
        expanded
    } else {
        base.join(expanded)
    }
}
