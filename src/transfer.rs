// ── File transfer and directory sync ─────────────────────────────────────────
//
// Planning is pure (local walk, exclude globs, remote path mapping); the
// remote side is driven through a `RemoteSession` so the same code runs over
// a pooled or a direct session.

use glob::Pattern;
use lablink_core::LabError;
use lablink_ssh::ssh::{RemoteSession, SshFailure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

pub const DEFAULT_FILE_MODE: i32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePair {
    pub local: PathBuf,
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub transfer_id: String,
    pub local: PathBuf,
    pub remote: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Globs matched against the relative path and the file name.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Remove remote files that are not part of the local tree.
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub local: PathBuf,
    /// `/`-separated path below the sync root.
    pub relative: String,
    pub size: u64,
    pub mode: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Relative directories, parents first.
    pub directories: Vec<String>,
    pub files: Vec<PlannedFile>,
}

impl SyncPlan {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub transfer_id: String,
    pub files_transferred: usize,
    pub bytes_transferred: u64,
    pub directories_created: usize,
    pub files_deleted: Vec<String>,
}

/// Compiled exclude globs.
pub struct Excludes(Vec<Pattern>);

impl Excludes {
    pub fn compile(patterns: &[String]) -> Result<Self, LabError> {
        patterns
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| LabError::InvalidRequest(format!("bad exclude '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Excludes)
    }

    /// A path is excluded when the whole relative path or any one component
    /// matches a pattern, so `*.pyc` and `build` work at any depth.
    pub fn matches(&self, relative: &str) -> bool {
        self.0.iter().any(|p| {
            p.matches(relative) || relative.split('/').any(|component| p.matches(component))
        })
    }
}

fn relative_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative.to_string_lossy().replace('\\', "/"))
}

#[cfg(unix)]
pub(crate) fn file_mode(metadata: &std::fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    (metadata.permissions().mode() & 0o777) as i32
}

#[cfg(not(unix))]
pub(crate) fn file_mode(_metadata: &std::fs::Metadata) -> i32 {
    DEFAULT_FILE_MODE
}

/// Walk `root` and list what a sync would create and upload.
pub fn plan_sync(root: &Path, excludes: &Excludes) -> Result<SyncPlan, LabError> {
    if !root.is_dir() {
        return Err(LabError::InvalidRequest(format!(
            "'{}' is not a directory",
            root.display()
        )));
    }

    let mut plan = SyncPlan::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            relative_of(root, entry.path()).map_or(true, |rel| !excludes.matches(&rel))
        });

    for entry in walker {
        let entry = entry.map_err(|e| LabError::Io(e.into()))?;
        let Some(relative) = relative_of(root, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            plan.directories.push(relative);
        } else if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(|e| LabError::Io(e.into()))?;
            plan.files.push(PlannedFile {
                local: entry.path().to_path_buf(),
                relative,
                size: metadata.len(),
                mode: file_mode(&metadata),
            });
        }
    }
    Ok(plan)
}

pub fn remote_join(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

pub fn quote(path: &str) -> String {
    shell_escape::unix::escape(path.into()).into_owned()
}

/// Remote files under `remote_root` that the plan does not contain.
/// Excluded paths are never deleted.
pub fn stale_remote_files(
    listing: &str,
    remote_root: &str,
    plan: &SyncPlan,
    excludes: &Excludes,
) -> Vec<String> {
    let keep: BTreeSet<&str> = plan.files.iter().map(|f| f.relative.as_str()).collect();
    let prefix = format!("{}/", remote_root.trim_end_matches('/'));

    listing
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix(&prefix))
        .filter(|relative| !relative.is_empty())
        .filter(|relative| !keep.contains(relative) && !excludes.matches(relative))
        .map(|relative| remote_join(remote_root, relative))
        .collect()
}

fn run_checked(session: &dyn RemoteSession, command: &str, timeout: Duration) -> Result<String, SshFailure> {
    let output = session.exec(command, timeout)?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(SshFailure::remote(format!(
            "'{}' exited with {}: {}",
            command,
            output.exit_status,
            output.stderr.trim()
        )))
    }
}

/// Push `plan` to `remote_root` over one session.
pub fn apply_sync(
    session: &dyn RemoteSession,
    plan: &SyncPlan,
    remote_root: &str,
    options: &SyncOptions,
    excludes: &Excludes,
    timeout: Duration,
) -> Result<SyncSummary, SshFailure> {
    let mut summary = SyncSummary::default();

    let mut mkdir = vec![quote(remote_root)];
    mkdir.extend(
        plan.directories
            .iter()
            .map(|d| quote(&remote_join(remote_root, d))),
    );
    run_checked(session, &format!("mkdir -p {}", mkdir.join(" ")), timeout)?;
    summary.directories_created = plan.directories.len();

    for file in &plan.files {
        let remote = remote_join(remote_root, &file.relative);
        let bytes = session.upload(&file.local, &remote, file.mode, timeout)?;
        log::debug!("Synced {} ({} bytes)", remote, bytes);
        summary.files_transferred += 1;
        summary.bytes_transferred += bytes;
    }

    if options.delete {
        let listing = run_checked(
            session,
            &format!("find {} -type f", quote(remote_root)),
            timeout,
        )?;
        let stale = stale_remote_files(&listing, remote_root, plan, excludes);
        if !stale.is_empty() {
            let args: Vec<String> = stale.iter().map(|p| quote(p)).collect();
            run_checked(session, &format!("rm -f {}", args.join(" ")), timeout)?;
            log::info!("Removed {} stale file(s) under {}", stale.len(), remote_root);
        }
        summary.files_deleted = stale;
    }

    Ok(summary)
}
