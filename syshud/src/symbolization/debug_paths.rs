//! Where to look for separate debug files
//!
//! Candidates are produced in priority order. Every path is also tried under
//! each sysroot prefix (a container or sandbox filesystem visible from the
//! host), after the plain host path.

use std::path::{Path, PathBuf};

pub const DEFAULT_DEBUG_DIR: &str = "/usr/lib/debug";

#[derive(Debug, Clone)]
pub struct DebugSearch {
    debug_dirs: Vec<PathBuf>,
    sysroots: Vec<PathBuf>,
}

impl Default for DebugSearch {
    fn default() -> Self {
        Self { debug_dirs: vec![PathBuf::from(DEFAULT_DEBUG_DIR)], sysroots: Vec::new() }
    }
}

impl DebugSearch {
    #[must_use]
    pub fn new(debug_dirs: Vec<PathBuf>, sysroots: Vec<PathBuf>) -> Self {
        Self { debug_dirs, sysroots }
    }

    /// `<debug dir>/.build-id/xx/yyyy.debug` for every debug dir
    #[must_use]
    pub fn build_id_candidates(&self, build_id: &str) -> Vec<PathBuf> {
        if build_id.len() < 4 || !build_id.is_char_boundary(2) {
            return Vec::new();
        }
        let (init, rest) = build_id.split_at(2);
        let relative = Path::new(".build-id").join(init).join(format!("{rest}.debug"));

        let paths = self.debug_dirs.iter().map(|dir| dir.join(&relative)).collect();
        self.with_sysroots(paths)
    }

    /// Debug link candidates for `binary`, whose `.gnu_debuglink` names `link`:
    /// `{dir}/link`, `{dir}/.debug/link`, then `{debug dir}{dir}/link`.
    #[must_use]
    pub fn debug_link_candidates(&self, binary: &Path, link: &str) -> Vec<PathBuf> {
        let dir = binary.parent().unwrap_or_else(|| Path::new("/"));

        let mut paths = vec![dir.join(link), dir.join(".debug").join(link)];
        for debug_dir in &self.debug_dirs {
            paths.push(debug_dir.join(strip_root(dir)).join(link));
        }
        self.with_sysroots(paths)
    }

    /// `path` itself followed by `path` under every sysroot
    #[must_use]
    pub fn host_paths(&self, path: &Path) -> Vec<PathBuf> {
        self.with_sysroots(vec![path.to_path_buf()])
    }

    fn with_sysroots(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        let mut all = paths.clone();
        for sysroot in &self.sysroots {
            all.extend(paths.iter().map(|p| sysroot.join(strip_root(p))));
        }
        all.dedup();
        all
    }
}

fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}
