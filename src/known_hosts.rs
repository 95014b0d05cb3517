//! Removal of stale SSH host keys for destroyed machines.

use std::io;
use std::net::Ipv4Addr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::paths::{read_optional, write_file};

/// The user's SSH `known_hosts` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KnownHosts {
    path: Utf8PathBuf,
}

fn line_matches(line: &str, address: &str) -> bool {
    let Some(hosts) = line.split_whitespace().next() else {
        return false;
    };
    hosts.split(',').any(|host| {
        let bare = host
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
            .map_or(host, |(inner, _)| inner);
        bare == address
    })
}

impl KnownHosts {
    /// Wraps the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Removes every entry whose host field names `address` exactly and
    /// returns the number of lines removed. A missing file removes nothing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be read or rewritten.
    pub fn remove(&self, address: Ipv4Addr) -> io::Result<usize> {
        let Some(contents) = read_optional(&self.path)? else {
            return Ok(0);
        };
        let needle = address.to_string();
        let mut removed = 0;
        let mut kept = String::with_capacity(contents.len());
        for line in contents.lines() {
            if line_matches(line, &needle) {
                removed += 1;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }
        if removed > 0 {
            write_file(&self.path, &kept)?;
            debug!(path = %self.path, %address, removed, "removed known host entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.5 ssh-ed25519 AAAA", true)]
    #[case("host,10.0.0.5 ssh-ed25519 AAAA", true)]
    #[case("[10.0.0.5]:2200 ssh-ed25519 AAAA", true)]
    #[case("10.0.0.50 ssh-ed25519 AAAA", false)]
    #[case("110.0.0.5 ssh-ed25519 AAAA", false)]
    #[case("", false)]
    fn matches_exact_host_fields(#[case] line: &str, #[case] expected: bool) {
        assert_eq!(line_matches(line, "10.0.0.5"), expected);
    }

    #[test]
    fn remove_rewrites_only_matching_lines() {
        let temp = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = Utf8PathBuf::from_path_buf(temp.path().join("known_hosts"))
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        write_file(
            &path,
            "10.0.0.5 ssh-ed25519 AAAA\n10.0.0.50 ssh-ed25519 BBBB\n",
        )
        .expect("seed file");

        let known_hosts = KnownHosts::new(path.clone());
        let removed = known_hosts
            .remove(Ipv4Addr::new(10, 0, 0, 5))
            .expect("remove");
        assert_eq!(removed, 1);
        let remaining = read_optional(&path).expect("read").unwrap_or_default();
        assert_eq!(remaining, "10.0.0.50 ssh-ed25519 BBBB\n");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let temp = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = Utf8PathBuf::from_path_buf(temp.path().join("absent"))
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        let removed = KnownHosts::new(path)
            .remove(Ipv4Addr::new(10, 0, 0, 5))
            .expect("missing file tolerated");
        assert_eq!(removed, 0);
    }
}
