//! Executable resolution against a colon-delimited search path.
//!
//! Mirrors POSIX `PATH` lookup: directories are tried left to right and the
//! first executable match wins. Directories that do not exist or cannot be
//! searched are skipped silently.

use nix::unistd::{access, AccessFlags};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Ordered list of directories to search for commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Parse a colon-delimited directory list. Empty entries are dropped.
    pub fn parse(list: &OsStr) -> Self {
        let dirs = list
            .as_bytes()
            .split(|&b| b == b':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(OsStr::from_bytes(dir)))
            .collect();
        Self { dirs }
    }

    /// Read `PATH` from the environment as it is right now.
    ///
    /// An unset `PATH` gives an empty search path, which resolves nothing.
    pub fn from_env() -> Self {
        match std::env::var_os("PATH") {
            Some(path) => Self::parse(&path),
            None => Self::default(),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Every executable match for `command`, in search order.
    ///
    /// Lazy: stopping after the first item never touches later directories.
    pub fn candidates<'a>(&'a self, command: &'a str) -> Box<dyn Iterator<Item = PathBuf> + 'a> {
        if command.is_empty() {
            return Box::new(std::iter::empty());
        }

        // A name with a slash is a path, not something to search for
        if command.contains('/') {
            let path = PathBuf::from(command);
            return Box::new(Some(path).into_iter().filter(|p| is_executable(p)));
        }

        Box::new(
            self.dirs
                .iter()
                .map(move |dir| dir.join(command))
                .filter(|candidate| is_executable(candidate)),
        )
    }

    /// First executable match for `command`.
    #[cfg(test)]
    pub fn resolve(&self, command: &str) -> Option<PathBuf> {
        self.candidates(command).next()
    }
}

/// Whether `path` names a regular file the process may execute.
///
/// This is a point-in-time check; the file can change before it is exec'd.
pub fn is_executable(path: &Path) -> bool {
    let is_file = std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        return false;
    }

    access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn join(dirs: &[&Path]) -> std::ffi::OsString {
        let mut list = std::ffi::OsString::new();
        for (i, dir) in dirs.iter().enumerate() {
            if i > 0 {
                list.push(":");
            }
            list.push(dir.as_os_str());
        }
        list
    }

    #[test]
    fn test_parse_skips_empty_entries() {
        let search = SearchPath::parse(OsStr::new("/a::/b:"));
        assert_eq!(search.dirs(), [PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn test_first_match_wins() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let c = TempDir::new().unwrap();
        let expected = write_file(b.path(), "tool", 0o755);
        write_file(c.path(), "tool", 0o755);

        let search = SearchPath::parse(&join(&[a.path(), b.path(), c.path()]));
        assert_eq!(search.resolve("tool"), Some(expected.clone()));

        let all: Vec<PathBuf> = search.candidates("tool").collect();
        assert_eq!(all, vec![expected, c.path().join("tool")]);
    }

    #[test]
    fn test_no_match() {
        let a = TempDir::new().unwrap();
        let search = SearchPath::parse(&join(&[a.path()]));
        assert_eq!(search.resolve("nonexistentcmd123"), None);
    }

    #[test]
    fn test_skips_missing_dirs_and_non_executables() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write_file(a.path(), "tool", 0o644);
        let expected = write_file(b.path(), "tool", 0o700);

        let missing = Path::new("/nonexistent-remote-exec-dir");
        let search = SearchPath::parse(&join(&[missing, a.path(), b.path()]));
        assert_eq!(search.resolve("tool"), Some(expected));
    }

    #[test]
    fn test_directories_never_resolve() {
        let a = TempDir::new().unwrap();
        fs::create_dir(a.path().join("subdir")).unwrap();
        let search = SearchPath::parse(&join(&[a.path()]));
        assert_eq!(search.resolve("subdir"), None);
    }

    #[test]
    fn test_empty_command_never_resolves() {
        let a = TempDir::new().unwrap();
        let search = SearchPath::parse(&join(&[a.path()]));
        assert_eq!(search.resolve(""), None);
    }

    #[test]
    fn test_slash_names_skip_search() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let direct = write_file(a.path(), "tool", 0o755);
        write_file(b.path(), "tool", 0o755);

        let search = SearchPath::parse(&join(&[b.path()]));
        let name = direct.to_str().unwrap();
        assert_eq!(search.resolve(name), Some(direct.clone()));
        assert_eq!(search.candidates(name).count(), 1);
    }

    #[test]
    fn test_empty_search_path() {
        assert_eq!(SearchPath::default().resolve("sh"), None);
    }
}
