//! Symlink materialization
//!
//! Walks a deploy tree and replaces every symlink with an independent copy of
//! whatever it points to, so that packaging steps which cannot follow links
//! see plain files and directories at the same paths.
//!
//! **Note**: link targets are copied wherever they live, including outside
//! the root, and link cycles are not detected.

use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use walkdir::WalkDir;

use crate::fsutil::{copy_dir_recursive, copy_file_with_metadata, resolve_link_target};
use crate::{Error, Result};

/// Callback receiving each entry's outcome as soon as it is known
pub type ReportCallback<'a> = &'a mut dyn FnMut(&Utf8Path, &Outcome);

/// Result of materializing a single entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The entry is not a symlink and was left alone
    NotSymlink,
    /// The link's target does not exist, the link was left in place
    Skipped { target: Utf8PathBuf },
    /// The link was replaced by a copy of its target (or would be, in a dry run)
    Materialized { target: Utf8PathBuf },
}

impl Outcome {
    /// Whether this outcome counts as a conversion
    pub fn is_converted(&self) -> bool {
        matches!(self, Outcome::Materialized { .. })
    }

    /// Render the report line for `path`, if the outcome has one
    pub fn report_line(&self, path: &Utf8Path, dry_run: bool) -> Option<String> {
        match self {
            Outcome::NotSymlink => None,
            Outcome::Skipped { target } => Some(format!(
                "Skipping {}: target does not exist ({})",
                path, target
            )),
            Outcome::Materialized { target } if dry_run => Some(format!(
                "Would materialize symlink: {} -> {}",
                path, target
            )),
            Outcome::Materialized { target } => {
                Some(format!("Materialized symlink: {} -> {}", path, target))
            }
        }
    }
}

/// Summary of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Links replaced, with their resolved targets, in walk order
    pub materialized: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    /// Broken links left untouched, with their resolved targets
    pub skipped: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    /// Whether the tree was left unmodified
    pub dry_run: bool,
}

impl RunReport {
    /// Number of converted links
    pub fn converted(&self) -> usize {
        self.materialized.len()
    }

    fn record(&mut self, path: &Utf8Path, outcome: &Outcome) {
        match outcome {
            Outcome::NotSymlink => {}
            Outcome::Skipped { target } => self.skipped.push((path.to_owned(), target.clone())),
            Outcome::Materialized { target } => {
                self.materialized.push((path.to_owned(), target.clone()))
            }
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            write!(f, "Would replace {} symlinks", self.converted())
        } else {
            write!(f, "Replaced {} symlinks", self.converted())
        }
    }
}

/// Replaces symlinks with copies of their targets
#[derive(Debug, Clone, Default)]
pub struct Materializer {
    staging_dir: Option<Utf8PathBuf>,
    dry_run: bool,
}

impl Materializer {
    /// Create a materializer staging copies in the system temp directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage copies under `dir` instead of the system temp directory.
    ///
    /// The final step is a rename, so `dir` should live on the same
    /// filesystem as the tree being walked.
    pub fn with_staging_dir(mut self, dir: Option<Utf8PathBuf>) -> Self {
        self.staging_dir = dir;
        self
    }

    /// Only report what would be replaced
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Walk `root` and materialize every symlink below it.
    ///
    /// Entries are processed in ascending path order. The listing is taken
    /// before anything is modified, so the contents of freshly copied
    /// directories are not revisited. The first fatal error aborts the run;
    /// links converted before it stay converted.
    pub fn run(&self, root: &Utf8Path, on_outcome: ReportCallback<'_>) -> Result<RunReport> {
        if !root.exists() {
            return Err(Error::root_not_found(root));
        }
        let root = root.canonicalize_utf8()?;

        tracing::info!(root = %root, dry_run = self.dry_run, "Materializing symlinks");

        let mut report = RunReport {
            dry_run: self.dry_run,
            ..RunReport::default()
        };

        for path in list_entries(&root)? {
            let outcome = self.materialize(&path)?;
            on_outcome(&path, &outcome);
            report.record(&path, &outcome);
        }

        tracing::debug!(
            converted = report.converted(),
            skipped = report.skipped.len(),
            "Materialization finished"
        );
        Ok(report)
    }

    /// Replace the symlink at `path` with a copy of its target.
    ///
    /// Anything that is not a symlink, including a missing path, is left
    /// alone. Links whose target does not exist are skipped.
    pub fn materialize(&self, path: &Utf8Path) -> Result<Outcome> {
        if !path.is_symlink() {
            return Ok(Outcome::NotSymlink);
        }

        let target = resolve_link_target(path)?;
        if !target.exists() {
            tracing::warn!(
                path = %path,
                target = %target,
                "Symlink target does not exist, skipping"
            );
            return Ok(Outcome::Skipped { target });
        }

        if self.dry_run {
            tracing::debug!(path = %path, target = %target, "Would materialize symlink");
            return Ok(Outcome::Materialized { target });
        }

        self.replace_with_copy(path, &target)?;

        tracing::info!(path = %path, target = %target, "Materialized symlink");
        Ok(Outcome::Materialized { target })
    }

    /// Stage a copy of `target`, then swap it in for the link at `path`
    fn replace_with_copy(&self, path: &Utf8Path, target: &Utf8Path) -> Result<()> {
        // Removed on drop if anything below fails
        let staging = self.create_staging_dir()?;
        let staging_path = Utf8Path::from_path(staging.path()).ok_or_else(|| {
            Error::materialize(
                format!("Staging path is not valid UTF-8: {:?}", staging.path()),
                "Set materialize.staging_dir to a UTF-8 path",
            )
        })?;

        let name = target.file_name().unwrap_or("target");
        let staged = staging_path.join(name);

        if target.is_dir() {
            copy_dir_recursive(target, &staged)?;
        } else {
            copy_file_with_metadata(target, &staged)?;
        }

        swap_into_place(&staged, path)?;

        let staging_display = staging_path.to_owned();
        if let Err(e) = staging.close() {
            tracing::warn!(
                staging = %staging_display,
                error = %e,
                "Failed to remove staging directory"
            );
        }

        Ok(())
    }

    fn create_staging_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".delink-");

        let staging = match &self.staging_dir {
            Some(dir) => std::fs::create_dir_all(dir).and_then(|_| builder.tempdir_in(dir)),
            None => builder.tempdir(),
        }
        .map_err(|e| {
            Error::materialize(
                format!("Failed to create staging directory: {}", e),
                "Check that the temporary directory is writable",
            )
        })?;

        tracing::debug!(staging = ?staging.path(), "Created staging directory");
        Ok(staging)
    }
}

/// Replace the link at `path` with `staged`.
///
/// If the rename fails (for example across filesystems) the link is put back
/// from its raw target before the error is returned.
fn swap_into_place(staged: &Utf8Path, path: &Utf8Path) -> Result<()> {
    let raw_target = std::fs::read_link(path)?;

    std::fs::remove_file(path).map_err(|e| {
        Error::materialize(
            format!("Failed to remove symlink {}: {}", path, e),
            "Check permissions on the containing directory",
        )
    })?;

    if let Err(e) = std::fs::rename(staged, path) {
        if let Err(restore) = std::os::unix::fs::symlink(&raw_target, path) {
            tracing::error!(
                path = %path,
                target = ?raw_target,
                error = %restore,
                "Failed to restore symlink"
            );
        }
        return Err(Error::materialize(
            format!("Failed to move {} to {}: {}", staged, path, e),
            "Set materialize.staging_dir to a directory on the same filesystem as the root",
        ));
    }

    Ok(())
}

/// Every path below `root`, without following links, sorted by path string
fn list_entries(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut paths = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            Error::walk(
                format!("Failed to read directory entry: {}", e),
                "Check directory permissions",
            )
        })?;

        let path = Utf8PathBuf::try_from(entry.into_path()).map_err(|e| {
            Error::walk(
                format!("Path is not valid UTF-8: {:?}", e),
                "Ensure all file paths contain only valid UTF-8 characters",
            )
        })?;
        paths.push(path);
    }

    paths.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(paths)
}
