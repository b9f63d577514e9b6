// Three-tier resolution of a script's last-known-compatible version:
// inline header marker > directory marker file > target minus a fixed distance.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::marker::read_directory_marker;
use crate::types::{Resolution, ScriptRecord, VersionSource};
use crate::version::Version;

/// Minor versions subtracted from the target when no marker is present.
pub const DEFAULT_DISTANCE: u64 = 6;

/// Resolves [`ScriptRecord`]s to a version and the tier that produced it.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    distance: u64,
    floor: Version,
}

impl Default for VersionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_DISTANCE, Version::ZERO)
    }
}

impl VersionResolver {
    pub fn new(distance: u64, floor: Version) -> Self {
        Self { distance, floor }
    }

    /// The version assumed for scripts with no marker at all.
    pub fn default_for(&self, target: &Version) -> Version {
        target.minus_minor(self.distance, &self.floor)
    }

    /// Resolve one script. Never fails: malformed markers fall through to the
    /// next tier.
    ///
    /// `directory_chain` lists the directories to search for a marker file,
    /// nearest first (see [`directory_chain`]).
    pub fn resolve(
        &self,
        script: &ScriptRecord,
        directory_chain: &[PathBuf],
        target: &Version,
    ) -> Resolution {
        if let Some(raw) = &script.header_marker {
            match Version::parse(raw) {
                Ok(version) => {
                    return Resolution {
                        version,
                        source: VersionSource::Header,
                    };
                }
                Err(_) => {
                    warn!(path = %script.path.display(), marker = %raw, "Malformed header marker, ignoring");
                }
            }
        }

        for dir in directory_chain {
            let Some(raw) = read_directory_marker(dir) else {
                continue;
            };
            match Version::parse(&raw) {
                Ok(version) => {
                    debug!(path = %script.path.display(), dir = %dir.display(), %version, "Directory marker");
                    return Resolution {
                        version,
                        source: VersionSource::Directory,
                    };
                }
                Err(_) => {
                    warn!(dir = %dir.display(), marker = %raw, "Malformed directory marker, ignoring");
                }
            }
        }

        Resolution {
            version: self.default_for(target),
            source: VersionSource::Default,
        }
    }

    /// Resolve a script using the chain from its directory up to its scan root.
    #[must_use]
    pub fn resolve_record(&self, script: ScriptRecord, target: &Version) -> ScriptRecord {
        let chain = directory_chain(&script.path, &script.root);
        let resolution = self.resolve(&script, &chain, target);
        script.with_resolution(resolution)
    }
}

/// Directories from the script's parent up to and including `root`.
///
/// A script outside `root` gets only its own directory.
pub fn directory_chain(script: &Path, root: &Path) -> Vec<PathBuf> {
    let mut chain = Vec::new();
    let Some(mut dir) = script.parent() else {
        return chain;
    };
    if !dir.starts_with(root) {
        chain.push(dir.to_path_buf());
        return chain;
    }
    loop {
        chain.push(dir.to_path_buf());
        if dir == root {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
    chain
}
