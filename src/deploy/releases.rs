//! Release folder bookkeeping for one host
//!
//! Releases live in `<root>/releases/<YYYYMMDD.HHMMSS>`; the active one is
//! the target of the `<root>/current` link. Metadata about each release is
//! cached as JSON next to them. Folder names sort chronologically, so the
//! ordering of the folder set is the release history.
//!
//! Mutations update the in-memory view and return the shell commands that
//! make the host match it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::ReleasesConfig;
use crate::core::errors::{BearError, Result};
use crate::deploy::remote::{CommandRunner, HostAddress};
use crate::deploy::shell;

pub const RELEASE_NAME_FORMAT: &str = "%Y%m%d.%H%M%S";

/// Paths derived from the application root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasesLayout {
    pub root: String,
    pub releases_dir: String,
    pub current_link: String,
    pub pending_name: String,
    pub json_path: String,
    pub keep_releases: usize,
    pub clean_pending: bool,
}

impl ReleasesLayout {
    pub fn new(root: impl Into<String>) -> Self {
        Self::from_config(&ReleasesConfig {
            root: root.into(),
            ..ReleasesConfig::default()
        })
    }

    pub fn from_config(config: &ReleasesConfig) -> Self {
        let root = config.root.trim_end_matches('/').to_string();
        Self {
            releases_dir: format!("{}/releases", root),
            current_link: format!("{}/current", root),
            json_path: format!("{}/releases.json", root),
            pending_name: config.pending_name.clone(),
            keep_releases: config.keep_releases,
            clean_pending: config.clean_pending,
            root,
        }
    }

    pub fn pending_path(&self) -> String {
        self.release_path(&self.pending_name)
    }

    pub fn release_path(&self, name: &str) -> String {
        format!("{}/{}", self.releases_dir, name)
    }

    fn is_pending(&self, path: &str) -> bool {
        folder_name(path).starts_with(&self.pending_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Active,
    Inactive,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub path: String,
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Release {
    fn at(path: impl Into<String>, status: ReleaseStatus) -> Self {
        Self {
            path: path.into(),
            status,
            created_at: None,
            revision: None,
            author: None,
            comment: None,
        }
    }

    pub fn name(&self) -> &str {
        folder_name(&self.path)
    }

    pub fn is_active(&self) -> bool {
        self.status == ReleaseStatus::Active
    }
}

/// How a caller names a release: by folder name or by full path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseRef {
    Label(String),
    Path(String),
}

impl ReleaseRef {
    pub fn label(label: impl Into<String>) -> Self {
        Self::Label(label.into())
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self::Path(path.into())
    }
}

impl fmt::Display for ReleaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label(label) => write!(f, "label:{}", label),
            Self::Path(path) => write!(f, "path:{}", path),
        }
    }
}

fn folder_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The releases of one host
#[derive(Debug, Clone)]
pub struct Releases {
    layout: ReleasesLayout,
    folders: BTreeSet<String>,
    known: BTreeMap<String, Release>,
    current: Option<String>,
}

impl Releases {
    /// Build the view from a folder listing, the target of the current link
    /// and the JSON cache. A cache that cannot be parsed is ignored.
    pub fn from_listing<S: AsRef<str>>(
        layout: ReleasesLayout,
        listing: &[S],
        current: Option<&str>,
        cache_json: Option<&str>,
    ) -> Self {
        let folders: BTreeSet<String> = listing
            .iter()
            .map(|entry| entry.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|entry| !entry.is_empty())
            .filter(|entry| !entry.ends_with("/current") && !entry.ends_with(".json"))
            .collect();

        let mut known: BTreeMap<String, Release> = match cache_json.map(serde_json::from_str) {
            Some(Ok(map)) => map,
            Some(Err(e)) => {
                warn!("Ignoring unreadable releases cache {}: {}", layout.json_path, e);
                BTreeMap::new()
            }
            None => BTreeMap::new(),
        };
        known.retain(|path, _| {
            let present = folders.contains(path);
            if !present {
                debug!("Removing missing release from cache: {}", path);
            }
            present
        });

        for folder in &folders {
            if !known.contains_key(folder) {
                let status = if layout.is_pending(folder) {
                    ReleaseStatus::Pending
                } else {
                    ReleaseStatus::Inactive
                };
                known.insert(folder.clone(), Release::at(folder.clone(), status));
            }
        }

        let current = current
            .map(|link| link.trim().trim_end_matches('/').to_string())
            .filter(|link| !link.is_empty());

        let mut releases = Self {
            layout,
            folders,
            known,
            current,
        };
        releases.mark_current();
        releases
    }

    /// Read listing, current link and cache from `host`
    pub async fn load(
        runner: &dyn CommandRunner,
        host: &HostAddress,
        layout: ReleasesLayout,
    ) -> Result<Self> {
        let listing = runner
            .run(host, &shell::ls_abs(&layout.releases_dir))
            .await?;
        let link = runner.run(host, &shell::read_link(&layout.current_link)).await?;
        let cache = runner
            .run(host, &format!("cat {}", shell::quote(&layout.json_path)))
            .await?;

        let entries: Vec<&str> = listing.stdout.lines().collect();
        let current = if link.ok() { Some(link.stdout.as_str()) } else { None };
        let cache = if cache.ok() && !cache.stdout.trim().is_empty() {
            Some(cache.stdout.as_str())
        } else {
            None
        };

        Ok(Self::from_listing(layout, &entries, current, cache))
    }

    pub fn layout(&self) -> &ReleasesLayout {
        &self.layout
    }

    /// Path the current link points to
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_release(&self) -> Option<&Release> {
        self.current.as_ref().and_then(|path| self.known.get(path))
    }

    pub fn pending(&self) -> Option<&Release> {
        self.known.get(&self.layout.pending_path())
    }

    /// Activated releases, oldest first
    pub fn releases(&self) -> Vec<&Release> {
        self.release_folders()
            .filter_map(|folder| self.known.get(folder))
            .collect()
    }

    pub fn last(&self) -> Option<&str> {
        self.release_folders().last().map(String::as_str)
    }

    /// Release activated just before the current one
    pub fn previous(&self) -> Option<&str> {
        let current = self.current.as_deref()?;
        if !self.folders.contains(current) {
            return None;
        }
        self.release_folders()
            .take_while(|folder| folder.as_str() != current)
            .last()
            .map(String::as_str)
    }

    pub fn find(&self, reference: &ReleaseRef) -> Option<&Release> {
        let path = match reference {
            ReleaseRef::Label(label) => self.layout.release_path(label),
            ReleaseRef::Path(path) => path.clone(),
        };
        self.known.get(&path)
    }

    /// Start preparing a new release in the pending folder
    pub fn new_pending(&mut self) -> Result<Vec<String>> {
        let path = self.layout.pending_path();
        let mut commands = Vec::new();
        if self.layout.clean_pending {
            commands.push(shell::sudo(&shell::rm_glob(
                &self.layout.releases_dir,
                &self.layout.pending_name,
            )));
        }
        commands.push(shell::mkdirs([path.as_str()]));

        let mut release = Release::at(path.clone(), ReleaseStatus::Pending);
        release.created_at = Some(Utc::now());
        self.folders.insert(path.clone());
        self.known.insert(path, release);

        commands.push(self.save_json_command()?);
        info!("New pending release in {}", self.layout.pending_path());
        Ok(commands)
    }

    /// Record revision metadata on the pending release
    pub fn describe_pending(
        &mut self,
        revision: Option<String>,
        author: Option<String>,
        comment: Option<String>,
    ) -> Result<()> {
        let path = self.layout.pending_path();
        let pending = self
            .known
            .get_mut(&path)
            .ok_or_else(|| BearError::release("there is no pending release"))?;
        pending.revision = revision;
        pending.author = author;
        pending.comment = comment;
        Ok(())
    }

    /// Move the pending release into a folder named after `now`, point the
    /// current link at it and clean up old releases.
    pub fn activate_pending(&mut self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let pending_path = self.layout.pending_path();
        let mut release = self
            .known
            .remove(&pending_path)
            .ok_or_else(|| BearError::release("there is no pending release to activate"))?;

        let release_path = self
            .layout
            .release_path(&now.format(RELEASE_NAME_FORMAT).to_string());
        if self.folders.contains(&release_path) {
            self.known.insert(pending_path, release);
            return Err(BearError::release(format!(
                "release {} already exists",
                release_path
            )));
        }
        info!("Activating release {}", release_path);

        self.folders.remove(&pending_path);
        release.path = release_path.clone();
        release.created_at = Some(now);
        self.folders.insert(release_path.clone());
        self.known.insert(release_path.clone(), release);

        let mut commands = vec![shell::mv(&pending_path, &release_path)];
        commands.push(self.switch_link_to(&release_path));
        commands.extend(self.cleanup()?);
        Ok(commands)
    }

    pub fn rollback_to(&mut self, reference: &ReleaseRef) -> Result<Vec<String>> {
        let path = self
            .find(reference)
            .map(|release| release.path.clone())
            .ok_or_else(|| BearError::release(format!("no such release: {}", reference)))?;
        if self.layout.is_pending(&path) {
            return Err(BearError::release("cannot roll back to a pending release"));
        }

        info!("Rolling back to {}", path);
        Ok(vec![self.switch_link_to(&path), self.save_json_command()?])
    }

    pub fn rollback_to_previous(&mut self) -> Result<Vec<String>> {
        let previous = self.previous().map(str::to_string).ok_or_else(|| {
            BearError::release("could not roll back because there is no prior release")
        })?;
        self.rollback_to(&ReleaseRef::path(previous))
    }

    /// Remove one release. The current release is never deleted.
    pub fn delete_release(&mut self, reference: &ReleaseRef) -> Result<Vec<String>> {
        let path = self
            .find(reference)
            .map(|release| release.path.clone())
            .ok_or_else(|| BearError::release(format!("no such release: {}", reference)))?;
        if self.current.as_deref() == Some(path.as_str()) {
            return Err(BearError::release(format!(
                "won't delete current release: {}",
                reference
            )));
        }

        self.remove(&path);
        Ok(vec![shell::sudo(&shell::rm([path.as_str()])), self.save_json_command()?])
    }

    /// Releases cleanup would delete to keep `keep` of them, oldest first.
    ///
    /// The current release is never listed: if it is among the oldest, it
    /// is spared and the next oldest release is taken in its place.
    pub fn list_to_delete(&self, keep: usize) -> Vec<String> {
        let folders: Vec<&String> = self.release_folders().collect();
        if folders.len() <= keep {
            return Vec::new();
        }

        let cut = folders.len() - keep;
        let mut to_delete: Vec<String> = folders[..cut].iter().map(|f| f.to_string()).collect();

        if let Some(current) = self.current.as_deref() {
            if let Some(position) = to_delete.iter().position(|f| f == current) {
                to_delete.remove(position);
                if let Some(next) = folders.get(cut) {
                    to_delete.push(next.to_string());
                }
            }
        }

        to_delete
    }

    /// Drop abandoned pending folders and releases beyond `keep_releases`
    pub fn cleanup(&mut self) -> Result<Vec<String>> {
        let mut commands = Vec::new();

        if self.layout.clean_pending {
            let pending: Vec<String> = self
                .folders
                .iter()
                .filter(|folder| self.layout.is_pending(folder))
                .cloned()
                .collect();
            for folder in &pending {
                self.remove(folder);
            }
            commands.push(shell::sudo(&shell::rm_glob(
                &self.layout.releases_dir,
                &self.layout.pending_name,
            )));
        }

        let to_delete = self.list_to_delete(self.layout.keep_releases);
        if !to_delete.is_empty() {
            debug!("Deleting old releases: {:?}", to_delete);
            for folder in &to_delete {
                self.remove(folder);
            }
            commands.push(shell::sudo(&shell::rm(to_delete.iter().map(String::as_str))));
        }

        commands.push(self.save_json_command()?);
        Ok(commands)
    }

    /// The JSON cache as written to the host
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.known)?)
    }

    /// Human-readable table of the activated releases
    pub fn show(&self) -> String {
        let header = ["Name", "Revision", "Author", "Comment", "Active?"];
        let rows: Vec<[String; 5]> = self
            .releases()
            .into_iter()
            .map(|release| {
                [
                    release.name().to_string(),
                    truncate(release.revision.as_deref().unwrap_or(""), 10),
                    release.author.clone().unwrap_or_default(),
                    truncate(release.comment.as_deref().unwrap_or(""), 50),
                    if release.is_active() { "Y" } else { "" }.to_string(),
                ]
            })
            .collect();

        let mut widths = header.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let line = |cells: &[String]| {
            let padded: Vec<String> = cells
                .iter()
                .zip(widths.iter())
                .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
                .collect();
            format!("| {} |", padded.join(" | "))
        };
        let separator = format!(
            "+{}+",
            widths
                .iter()
                .map(|w| "-".repeat(w + 2))
                .collect::<Vec<_>>()
                .join("+")
        );

        let mut table = vec![
            separator.clone(),
            line(&header.map(str::to_string)[..]),
            separator.clone(),
        ];
        table.extend(rows.iter().map(|row| line(&row[..])));
        table.push(separator);
        table.join("\n")
    }

    fn release_folders(&self) -> impl Iterator<Item = &String> {
        self.folders
            .iter()
            .filter(move |folder| !self.layout.is_pending(folder))
    }

    fn switch_link_to(&mut self, path: &str) -> String {
        self.current = Some(path.to_string());
        self.mark_current();
        shell::sudo(&shell::symlink(path, &self.layout.current_link))
    }

    fn mark_current(&mut self) {
        let current = self.current.clone();
        for (path, release) in self.known.iter_mut() {
            if release.status == ReleaseStatus::Pending {
                continue;
            }
            release.status = if current.as_deref() == Some(path.as_str()) {
                ReleaseStatus::Active
            } else {
                ReleaseStatus::Inactive
            };
        }
    }

    fn remove(&mut self, path: &str) {
        self.folders.remove(path);
        self.known.remove(path);
    }

    fn save_json_command(&self) -> Result<String> {
        Ok(shell::write_file(&self.layout.json_path, &self.to_json()?, None))
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
