//! In-memory depot for testing.

use crate::error::{ErrorKind, Result};
use crate::models::{
    ChangelistDescription, ChangelistQuery, ChangelistStatus, ChangelistSummary, Credentials, FileAction, FileKind,
    FileRecord, FileSpec, FileType, LabelSummary, Revision,
};
use crate::path::{local_path_for, relative};
use crate::remote::Depot;
use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// How long a stalled command sleeps; far beyond any sensible deadline.
const STALL: Duration = Duration::from_secs(60 * 60);

/// In-memory depot for testing.
///
/// Keeps a full revision history per file, labels, a workspace have-table and
/// pending changelists behind a [`RwLock`], so all trait methods operate on
/// `&self`. When constructed with [`with_workspace`](Self::with_workspace),
/// syncs, deletes and submits touch real files under the workspace's local
/// root, which lets tests compare local content against depot metadata.
///
/// Records queried at a fixed revision (a label, changelist or revision
/// number) report that revision as their `have_revision`: it is the revision
/// the workspace would have after syncing to that point.
///
/// Failures can be injected with [`fail_next`](Self::fail_next) (the next
/// commands return the given errors), [`fail_on`](Self::fail_on) (the next
/// call of one command fails) and [`stall_next`](Self::stall_next)
/// (the next commands never complete). Session commands are never affected.
/// An injected [`SessionDropped`](ErrorKind::SessionDropped) also ends the
/// session and forgets the selected workspace, as a real drop would.
///
/// # Examples
///
/// ```
/// use depotsync_depot::remote::MockDepot;
/// use depotsync_depot::{Credentials, Depot, FileKind, FileSpec, Revision};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let depot = MockDepot::default()
///     .with_change("initial import", [("//depot/main/a.txt", FileKind::Text, Some(&b"hello\n"[..]))]);
/// depot.connect(&Credentials::new("mock:1666", "alice", "")).await?;
/// let records = depot.get_metadata(&[FileSpec::new("//depot/main/...", Revision::Head)]).await?;
/// assert_eq!(records[0].size, Some(6));
/// # Ok(())
/// # }
/// ```
pub struct MockDepot {
    name: String,
    workspace: Option<Workspace>,
    state: RwLock<State>,
}

struct Workspace {
    name: String,
    depot_root: String,
    local_root: PathBuf,
}

struct Rev {
    change: u32,
    action: FileAction,
    file_type: FileType,
    content: Option<Vec<u8>>,
}

struct Change {
    summary: ChangelistSummary,
    /// Pending: files opened in the change. Submitted: files and the revision
    /// the change created.
    files: BTreeMap<String, (FileAction, u32)>,
}

struct Label {
    summary: LabelSummary,
    revisions: BTreeMap<String, u32>,
}

#[derive(Default)]
struct State {
    session: Option<Credentials>,
    working_set: Option<String>,
    history: BTreeMap<String, Vec<Rev>>,
    labels: BTreeMap<String, Label>,
    have: BTreeMap<String, u32>,
    changes: BTreeMap<u32, Change>,
    next_change: u32,
    failures: VecDeque<ErrorKind>,
    targeted: BTreeMap<String, ErrorKind>,
    stalls: usize,
    calls: Vec<String>,
    connects: usize,
    selections: usize,
}

impl MockDepot {
    /// Change the name of the mock depot.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Map `depot_root` (a branch root ending in `/`) onto `local_root`.
    pub fn with_workspace(mut self, name: impl Into<String>, depot_root: &str, local_root: impl Into<PathBuf>) -> Self {
        self.workspace = Some(Workspace {
            name: name.into(),
            depot_root: crate::path::branch_root(depot_root),
            local_root: local_root.into(),
        });
        self
    }

    /// Record a submitted change. A `None` content deletes the file.
    ///
    /// Panics if a path fails validation or deletes a file that has no live
    /// revision. If test setup is wrong, then test should not pass.
    pub fn with_change<'a>(
        mut self,
        description: &str,
        files: impl IntoIterator<Item = (&'a str, FileKind, Option<&'a [u8]>)>,
    ) -> Self {
        let state = self.state.get_mut();
        state.next_change += 1;
        let id = state.next_change;
        let mut touched = BTreeMap::new();
        for (path, kind, content) in files {
            if crate::path::validate(path).is_err() {
                panic!("MockDepot::with_change: invalid path {path}");
            }
            let history = state.history.entry(path.to_string()).or_default();
            let live = history.last().is_some_and(|r| r.content.is_some());
            let action = match (&content, live) {
                (None, true) => FileAction::Delete,
                (None, false) => panic!("MockDepot::with_change: deleting missing file {path}"),
                (Some(_), true) => FileAction::Edit,
                (Some(_), false) => FileAction::Add,
            };
            history.push(Rev { change: id, action, file_type: kind.into(), content: content.map(<[u8]>::to_vec) });
            touched.insert(path.to_string(), (action, history.len() as u32));
        }
        let summary = ChangelistSummary {
            id,
            user: "mock".to_string(),
            workspace: self.workspace.as_ref().map(|w| w.name.clone()).unwrap_or_default(),
            description: description.to_string(),
            status: ChangelistStatus::Submitted,
            shelved: false,
            submitted_at: Some(OffsetDateTime::UNIX_EPOCH),
        };
        state.changes.insert(id, Change { summary, files: touched });
        self
    }

    /// Change the file type of the latest revision of a file (e.g. to add the
    /// `+w` modifier).
    pub fn with_file_type(mut self, path: &str, file_type: FileType) -> Self {
        if let Some(rev) = self.state.get_mut().history.get_mut(path).and_then(|h| h.last_mut()) {
            rev.file_type = file_type;
        }
        self
    }

    /// Label the latest live revision of every file under `prefix`.
    pub fn with_label(mut self, name: &str, prefix: &str) -> Self {
        let state = self.state.get_mut();
        let revisions = state
            .history
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .filter_map(|(path, history)| {
                let rev = history.len();
                history.last().filter(|r| r.content.is_some()).map(|_| (path.clone(), rev as u32))
            })
            .collect();
        let summary = LabelSummary {
            name: name.to_string(),
            owner: "mock".to_string(),
            description: format!("Created by mock for {prefix}"),
            updated_at: Some(OffsetDateTime::UNIX_EPOCH),
        };
        state.labels.insert(name.to_string(), Label { summary, revisions });
        self
    }

    /// Sync every live head file under `prefix` into the have-table, writing
    /// its content into the local workspace.
    ///
    /// Panics if the local write fails.
    pub fn with_synced(mut self, prefix: &str) -> Self {
        let workspace = self.workspace.as_ref();
        let state = self.state.get_mut();
        let heads: Vec<(String, u32)> = state
            .history
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .filter(|(_, history)| history.last().is_some_and(|r| r.content.is_some()))
            .map(|(path, history)| (path.clone(), history.len() as u32))
            .collect();
        for (path, rev) in heads {
            if let Some(workspace) = workspace
                && let Err(e) = write_local(workspace, &path, &state.history[&path][rev as usize - 1])
            {
                panic!("MockDepot::with_synced: {e}");
            }
            state.have.insert(path, rev);
        }
        self
    }

    /// Set the have-revision of a single file without touching local files.
    pub fn with_have(mut self, path: &str, revision: u32) -> Self {
        self.state.get_mut().have.insert(path.to_string(), revision);
        self
    }

    /// Create a pending changelist with the given files opened in it.
    pub fn with_pending<'a>(
        mut self,
        id: u32,
        description: &str,
        files: impl IntoIterator<Item = (&'a str, FileAction)>,
    ) -> Self {
        let workspace = self.workspace.as_ref().map(|w| w.name.clone()).unwrap_or_default();
        let state = self.state.get_mut();
        let files = files
            .into_iter()
            .map(|(path, action)| (path.to_string(), (action, state.have.get(path).copied().unwrap_or(0))))
            .collect();
        let summary = ChangelistSummary {
            id,
            user: "mock".to_string(),
            workspace,
            description: description.to_string(),
            status: ChangelistStatus::Pending,
            shelved: false,
            submitted_at: None,
        };
        state.changes.insert(id, Change { summary, files });
        state.next_change = state.next_change.max(id);
        self
    }

    /// Mark a pending changelist as having shelved files.
    pub fn with_shelved(mut self, id: u32) -> Self {
        if let Some(change) = self.state.get_mut().changes.get_mut(&id) {
            change.summary.shelved = true;
        }
        self
    }

    /// The next `kinds.len()` non-session commands fail with these errors.
    pub async fn fail_next(&self, kinds: impl IntoIterator<Item = ErrorKind>) {
        self.state.write().await.failures.extend(kinds);
    }

    /// The next call of `command` fails with `kind`. Other commands are
    /// unaffected.
    pub async fn fail_on(&self, command: &str, kind: ErrorKind) {
        self.state.write().await.targeted.insert(command.to_string(), kind);
    }

    /// The next `count` non-session commands never complete.
    pub async fn stall_next(&self, count: usize) {
        self.state.write().await.stalls += count;
    }

    /// Names of every non-session command issued so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    /// Number of successful [`connect`](Depot::connect) calls.
    pub async fn connect_count(&self) -> usize {
        self.state.read().await.connects
    }

    /// Number of successful [`set_working_set`](Depot::set_working_set) calls.
    pub async fn workspace_selections(&self) -> usize {
        self.state.read().await.selections
    }

    /// The workspace's have-revision of a file.
    pub async fn have(&self, path: &str) -> Option<u32> {
        self.state.read().await.have.get(path).copied()
    }

    /// `true` if the changelist exists (pending or submitted).
    pub async fn has_changelist(&self, id: u32) -> bool {
        self.state.read().await.changes.contains_key(&id)
    }

    /// Opened files of a pending changelist, with the action they are opened for.
    pub async fn opened_in(&self, id: u32) -> Vec<(String, FileAction)> {
        self.state
            .read()
            .await
            .changes
            .get(&id)
            .map(|c| c.files.iter().map(|(p, (a, _))| (p.clone(), *a)).collect())
            .unwrap_or_default()
    }

    /// Records every command, then applies any injected failure or stall.
    async fn begin(&self, command: &str) -> Result<()> {
        let stall = {
            let mut state = self.state.write().await;
            state.calls.push(command.to_string());
            if state.session.is_none() {
                exn::bail!(ErrorKind::NotConnected);
            }
            let injected = match state.targeted.remove(command) {
                Some(kind) => Some(kind),
                None => state.failures.pop_front(),
            };
            if let Some(kind) = injected {
                if matches!(kind, ErrorKind::SessionDropped(_)) {
                    state.session = None;
                    state.working_set = None;
                }
                return Err(exn::Exn::from(kind));
            }
            let stall = state.stalls > 0;
            state.stalls = state.stalls.saturating_sub(1);
            stall
        };
        if stall {
            tokio::time::sleep(STALL).await;
        }
        Ok(())
    }

    /// As [`begin`](Self::begin), for commands that act on the selected
    /// workspace.
    async fn begin_in_workspace(&self, command: &str) -> Result<()> {
        self.begin(command).await?;
        if self.state.read().await.working_set.is_none() {
            exn::bail!(ErrorKind::InvalidRequest(format!("{command}: no workspace selected")));
        }
        Ok(())
    }

    fn local_path(&self, depot_path: &str) -> Option<PathBuf> {
        self.workspace
            .as_ref()
            .and_then(|w| relative(depot_path, &w.depot_root).map(|rel| local_path_for(&w.local_root, rel)))
    }

    fn record(&self, state: &State, path: &str, rev: u32, have: Option<u32>) -> FileRecord {
        let history = &state.history[path];
        let entry = &history[rev as usize - 1];
        let mut record = FileRecord::new(path, entry.file_type.clone())
            .with_action(entry.action)
            .with_revisions(have, Some(history.len() as u32));
        if let Some(content) = &entry.content {
            record = record.with_size(content.len() as u64).with_digest(digest(content));
        }
        if let Some(local) = self.local_path(path) {
            record = record.with_local_path(local);
        }
        record
    }

    fn workspace_name(state: &State) -> String {
        state.working_set.clone().unwrap_or_default()
    }

    fn pending_mut(state: &mut State, id: u32) -> Result<&mut Change> {
        if id == 0 && !state.changes.contains_key(&0) {
            let summary = ChangelistSummary {
                id: 0,
                user: state.session.as_ref().map(|s| s.user.clone()).unwrap_or_default(),
                workspace: Self::workspace_name(state),
                description: "default".to_string(),
                status: ChangelistStatus::Pending,
                shelved: false,
                submitted_at: None,
            };
            state.changes.insert(0, Change { summary, files: BTreeMap::new() });
        }
        match state.changes.get_mut(&id) {
            Some(change) if change.summary.is_pending() => Ok(change),
            _ => exn::bail!(ErrorKind::NotFound(format!("pending changelist {id}"))),
        }
    }

    fn is_opened(state: &State, path: &str) -> bool {
        state.changes.values().any(|c| c.summary.is_pending() && c.files.contains_key(path))
    }
}
impl Default for MockDepot {
    fn default() -> Self {
        Self { name: "mock".to_string(), workspace: None, state: RwLock::new(State::default()) }
    }
}

/// Uppercase hex MD5, the digest notation used by depot metadata.
fn digest(content: &[u8]) -> String {
    Md5::digest(content).iter().fold(String::with_capacity(32), |mut acc, b| {
        let _ = write!(acc, "{b:02X}");
        acc
    })
}

/// Paths in `history` matched by a spec's path (exact, `dir/*` or `dir/...`).
fn matching<'a>(history: &'a BTreeMap<String, Vec<Rev>>, pattern: &'a str) -> impl Iterator<Item = &'a String> + 'a {
    history.keys().filter(move |path| match (pattern.strip_suffix("..."), pattern.strip_suffix('*')) {
        (Some(prefix), _) => path.starts_with(prefix),
        (None, Some(prefix)) => path.strip_prefix(prefix).is_some_and(|rest| !rest.contains('/')),
        (None, None) => path.as_str() == pattern,
    })
}

/// Resolves a revision to a revision number of `path`, plus the have-revision
/// a record at that point should report.
fn resolve(state: &State, path: &str, revision: &Revision) -> Option<(u32, Option<u32>)> {
    let history = state.history.get(path)?;
    let have = state.have.get(path).copied();
    match revision {
        Revision::Head => Some((history.len() as u32, have)),
        Revision::Have => have.map(|h| (h, Some(h))),
        Revision::None => None,
        Revision::Number(n) => (*n >= 1 && *n as usize <= history.len()).then_some((*n, Some(*n))),
        Revision::Label(name) => state.labels.get(name)?.revisions.get(path).map(|r| (*r, Some(*r))),
        Revision::Changelist(id) => {
            let index = history.iter().rposition(|r| r.change <= *id)?;
            let rev = index as u32 + 1;
            Some((rev, Some(rev)))
        },
    }
}

/// Client-side bytes for a revision: UTF-16 files are written little-endian
/// with a byte-order mark, everything else verbatim.
fn client_bytes(rev: &Rev) -> Vec<u8> {
    let content = rev.content.as_deref().unwrap_or_default();
    match rev.file_type.kind() {
        FileKind::Utf16 => {
            let text = String::from_utf8_lossy(content);
            let mut bytes = vec![0xFF, 0xFE];
            bytes.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
            bytes
        },
        _ => content.to_vec(),
    }
}

/// Depot-side (canonical) bytes for client content.
fn canonical_bytes(kind: FileKind, content: Vec<u8>) -> Vec<u8> {
    match kind {
        FileKind::Binary => content,
        FileKind::Text | FileKind::UnicodeMultibyte => {
            let mut out = Vec::with_capacity(content.len());
            let mut iter = content.iter().peekable();
            while let Some(b) = iter.next() {
                if *b == b'\r' && iter.peek() == Some(&&b'\n') {
                    continue;
                }
                out.push(*b);
            }
            out
        },
        FileKind::Utf16 => {
            let units: Vec<u16> =
                content.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            let text = String::from_utf16_lossy(&units);
            let text = text.strip_prefix('\u{feff}').unwrap_or(&text).replace("\r\n", "\n");
            text.into_bytes()
        },
    }
}

fn write_local(workspace: &Workspace, depot_path: &str, rev: &Rev) -> std::io::Result<()> {
    let Some(rel) = relative(depot_path, &workspace.depot_root) else {
        return Ok(());
    };
    let target = local_path_for(&workspace.local_root, rel);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, client_bytes(rev))
}

fn remove_local(path: Option<&Path>) -> std::io::Result<()> {
    match path {
        Some(path) if path.exists() => std::fs::remove_file(path),
        _ => Ok(()),
    }
}

#[async_trait]
impl Depot for MockDepot {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, credentials: &Credentials) -> Result<()> {
        let mut state = self.state.write().await;
        state.session = Some(credentials.clone());
        state.connects += 1;
        Ok(())
    }

    async fn set_working_set(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.session.is_none() {
            exn::bail!(ErrorKind::NotConnected);
        }
        state.working_set = Some(name.to_string());
        state.selections += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.session = None;
        state.working_set = None;
        Ok(())
    }

    async fn get_metadata(&self, specs: &[FileSpec]) -> Result<Vec<FileRecord>> {
        self.begin("get_metadata").await?;
        let state = self.state.read().await;
        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        for spec in specs {
            for path in matching(&state.history, &spec.path) {
                if !seen.insert(path.clone()) {
                    continue;
                }
                if let Some((rev, have)) = resolve(&state, path, &spec.revision) {
                    records.push(self.record(&state, path, rev, have));
                }
            }
        }
        Ok(records)
    }

    async fn list_subdirectories(&self, spec: &FileSpec, include_deleted: bool) -> Result<Vec<String>> {
        self.begin("list_subdirectories").await?;
        let state = self.state.read().await;
        let Some(dir) = spec.path.strip_suffix('*') else {
            exn::bail!(ErrorKind::InvalidRequest(format!("directory spec must end in '*': {spec}")));
        };
        let mut directories = BTreeSet::new();
        for path in state.history.keys() {
            let Some((child, _)) = path.strip_prefix(dir).and_then(|rest| rest.split_once('/')) else {
                continue;
            };
            let live = resolve(&state, path, &spec.revision)
                .is_some_and(|(rev, _)| state.history[path][rev as usize - 1].content.is_some());
            if live || include_deleted {
                directories.insert(format!("{dir}{child}"));
            }
        }
        Ok(directories.into_iter().collect())
    }

    async fn sync_files(&self, specs: &[FileSpec], force: bool) -> Result<Vec<String>> {
        self.begin_in_workspace("sync_files").await?;
        let mut state = self.state.write().await;
        let mut updated = Vec::new();
        for spec in specs {
            let paths: Vec<String> = matching(&state.history, &spec.path).cloned().collect();
            for path in paths {
                let current = state.have.get(&path).copied();
                let target = match spec.revision {
                    Revision::Have => current,
                    ref revision => resolve(&state, &path, revision).map(|(rev, _)| rev),
                };
                let target = target.filter(|rev| state.history[&path][*rev as usize - 1].content.is_some());
                if target == current && !force {
                    continue;
                }
                match target {
                    Some(rev) => {
                        if let Some(workspace) = &self.workspace {
                            write_local(workspace, &path, &state.history[&path][rev as usize - 1])
                                .map_err(ErrorKind::from)?;
                        }
                        state.have.insert(path.clone(), rev);
                    },
                    None => {
                        remove_local(self.local_path(&path).as_deref()).map_err(ErrorKind::from)?;
                        state.have.remove(&path);
                    },
                }
                updated.push(path);
            }
        }
        Ok(updated)
    }

    async fn create_changelist(&self, description: &str) -> Result<u32> {
        self.begin("create_changelist").await?;
        let mut state = self.state.write().await;
        state.next_change += 1;
        let id = state.next_change;
        let summary = ChangelistSummary {
            id,
            user: state.session.as_ref().map(|s| s.user.clone()).unwrap_or_default(),
            workspace: Self::workspace_name(&state),
            description: description.to_string(),
            status: ChangelistStatus::Pending,
            shelved: false,
            submitted_at: None,
        };
        state.changes.insert(id, Change { summary, files: BTreeMap::new() });
        Ok(id)
    }

    async fn reopen_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>> {
        self.begin("reopen_files").await?;
        let mut state = self.state.write().await;
        Self::pending_mut(&mut state, changelist)?;
        let mut moved = Vec::new();
        for path in paths {
            let source = state
                .changes
                .iter_mut()
                .filter(|(id, c)| **id != changelist && c.summary.is_pending())
                .find_map(|(_, c)| c.files.remove(path));
            if let Some(entry) = source {
                Self::pending_mut(&mut state, changelist)?.files.insert(path.clone(), entry);
                moved.push(path.clone());
            }
        }
        Ok(moved)
    }

    async fn add_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>> {
        self.begin("add_files").await?;
        let mut state = self.state.write().await;
        Self::pending_mut(&mut state, changelist)?;
        let mut opened = Vec::new();
        for path in paths {
            let live = state.history.get(path).and_then(|h| h.last()).is_some_and(|r| r.content.is_some());
            if live || Self::is_opened(&state, path) {
                tracing::debug!(path, "Mock depot skipping add of existing or opened file");
                continue;
            }
            Self::pending_mut(&mut state, changelist)?.files.insert(path.clone(), (FileAction::Add, 0));
            opened.push(path.clone());
        }
        Ok(opened)
    }

    async fn edit_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>> {
        self.begin("edit_files").await?;
        let mut state = self.state.write().await;
        Self::pending_mut(&mut state, changelist)?;
        let mut opened = Vec::new();
        for path in paths {
            let Some(have) = state.have.get(path).copied() else {
                tracing::debug!(path, "Mock depot skipping edit of file not in workspace");
                continue;
            };
            if Self::is_opened(&state, path) {
                continue;
            }
            Self::pending_mut(&mut state, changelist)?.files.insert(path.clone(), (FileAction::Edit, have));
            opened.push(path.clone());
        }
        Ok(opened)
    }

    async fn delete_files(&self, paths: &[String], changelist: u32) -> Result<Vec<String>> {
        self.begin("delete_files").await?;
        let mut state = self.state.write().await;
        Self::pending_mut(&mut state, changelist)?;
        let mut opened = Vec::new();
        for path in paths {
            let Some(have) = state.have.get(path).copied() else {
                continue;
            };
            if Self::is_opened(&state, path) {
                continue;
            }
            remove_local(self.local_path(path).as_deref()).map_err(ErrorKind::from)?;
            Self::pending_mut(&mut state, changelist)?.files.insert(path.clone(), (FileAction::Delete, have));
            opened.push(path.clone());
        }
        Ok(opened)
    }

    async fn submit_changelist(&self, changelist: u32) -> Result<u32> {
        self.begin("submit_changelist").await?;
        let mut state = self.state.write().await;
        let change = Self::pending_mut(&mut state, changelist)?;
        if change.files.is_empty() {
            exn::bail!(ErrorKind::InvalidRequest(format!("changelist {changelist} has no files")));
        }
        if change.summary.shelved {
            exn::bail!(ErrorKind::InvalidRequest(format!("changelist {changelist} has shelved files")));
        }
        let files = std::mem::take(&mut change.files);
        let mut summary = change.summary.clone();
        state.next_change += 1;
        let id = state.next_change;
        let mut submitted = BTreeMap::new();
        for (path, (action, _)) in files {
            let previous_type = state.history.get(&path).and_then(|h| h.last()).map(|r| r.file_type.clone());
            let content = match action.class() {
                crate::ActionClass::Delete => None,
                _ => {
                    let local = self.local_path(&path);
                    let bytes = match &local {
                        Some(local) => std::fs::read(local).map_err(ErrorKind::from)?,
                        None => Vec::new(),
                    };
                    Some(bytes)
                },
            };
            let file_type = previous_type.unwrap_or_else(|| match content.as_deref().map(std::str::from_utf8) {
                Some(Ok(_)) => FileType::new(FileKind::Text),
                _ => FileType::new(FileKind::Binary),
            });
            let content = content.map(|c| canonical_bytes(file_type.kind(), c));
            let live = content.is_some();
            let history = state.history.entry(path.clone()).or_default();
            history.push(Rev { change: id, action, file_type, content });
            let rev = history.len() as u32;
            match live {
                true => state.have.insert(path.clone(), rev),
                false => state.have.remove(&path),
            };
            submitted.insert(path, (action, rev));
        }
        state.changes.remove(&changelist);
        summary.id = id;
        summary.status = ChangelistStatus::Submitted;
        summary.submitted_at = Some(OffsetDateTime::UNIX_EPOCH);
        state.changes.insert(id, Change { summary, files: submitted });
        Ok(id)
    }

    async fn get_opened_files(&self, paths: &[String], changelist: Option<u32>) -> Result<Vec<FileRecord>> {
        self.begin("get_opened_files").await?;
        let state = self.state.read().await;
        let records = state
            .changes
            .iter()
            .filter(|(id, c)| c.summary.is_pending() && changelist.is_none_or(|wanted| wanted == **id))
            .flat_map(|(_, c)| c.files.iter())
            .filter(|(path, _)| paths.is_empty() || paths.contains(path))
            .map(|(path, (action, have))| {
                let file_type = state.history.get(path).and_then(|h| h.last()).map(|r| r.file_type.clone());
                let mut record = FileRecord::new(path.clone(), file_type.unwrap_or_default())
                    .with_action(*action)
                    .with_revisions((*have > 0).then_some(*have), state.history.get(path).map(|h| h.len() as u32));
                if let Some(local) = self.local_path(path) {
                    record = record.with_local_path(local);
                }
                record
            })
            .collect();
        Ok(records)
    }

    async fn list_labels(&self, filter: Option<&str>) -> Result<Vec<LabelSummary>> {
        self.begin("list_labels").await?;
        let state = self.state.read().await;
        let prefix = filter.map(|f| f.trim_end_matches("...").to_string());
        Ok(state
            .labels
            .values()
            .filter(|label| match &prefix {
                Some(prefix) => label.revisions.keys().any(|p| p.starts_with(prefix.as_str())),
                None => true,
            })
            .map(|label| label.summary.clone())
            .collect())
    }

    async fn list_changelists(&self, query: &ChangelistQuery) -> Result<Vec<ChangelistSummary>> {
        self.begin("list_changelists").await?;
        let state = self.state.read().await;
        let prefix = query.path.as_deref().map(|p| p.trim_end_matches("..."));
        Ok(state
            .changes
            .values()
            .rev()
            .filter(|c| c.summary.id != 0 && c.summary.status == query.status)
            .filter(|c| query.user.as_ref().is_none_or(|u| *u == c.summary.user))
            .filter(|c| query.workspace.as_ref().is_none_or(|w| *w == c.summary.workspace))
            .filter(|c| prefix.is_none_or(|p| c.files.keys().any(|f| f.starts_with(p))))
            .take(query.max)
            .map(|c| c.summary.clone())
            .collect())
    }

    async fn describe_changelist(&self, changelist: u32) -> Result<ChangelistDescription> {
        self.begin("describe_changelist").await?;
        let state = self.state.read().await;
        let Some(change) = state.changes.get(&changelist) else {
            exn::bail!(ErrorKind::NotFound(format!("changelist {changelist}")));
        };
        let files = change
            .files
            .iter()
            .filter_map(|(path, (action, rev))| match change.summary.is_pending() {
                true => {
                    let have = state.have.get(path).copied();
                    let mut record = match have {
                        Some(have) => self.record(&state, path, have, Some(have)),
                        None => {
                            let mut record = FileRecord::new(path.clone(), FileType::default());
                            if let Some(local) = self.local_path(path) {
                                record = record.with_local_path(local);
                            }
                            record
                        },
                    };
                    record.head_action = *action;
                    Some(record)
                },
                false => state.history.get(path).map(|_| self.record(&state, path, *rev, Some(*rev))),
            })
            .map(|mut record| {
                if !change.summary.is_pending() {
                    record.head_revision = change.files.get(&record.depot_path).map(|(_, rev)| *rev);
                }
                record
            })
            .collect();
        Ok(ChangelistDescription { summary: change.summary.clone(), files })
    }

    async fn delete_changelist(&self, changelist: u32) -> Result<()> {
        self.begin("delete_changelist").await?;
        let mut state = self.state.write().await;
        let change = Self::pending_mut(&mut state, changelist)?;
        if !change.files.is_empty() || change.summary.shelved {
            exn::bail!(ErrorKind::InvalidRequest(format!("changelist {changelist} is not empty")));
        }
        state.changes.remove(&changelist);
        Ok(())
    }

    async fn delete_shelved_files(&self, changelist: u32) -> Result<()> {
        self.begin("delete_shelved_files").await?;
        let mut state = self.state.write().await;
        Self::pending_mut(&mut state, changelist)?.summary.shelved = false;
        Ok(())
    }

    async fn map_to_local(&self, depot_path: &str) -> Result<PathBuf> {
        self.begin_in_workspace("map_to_local").await?;
        let Some(workspace) = &self.workspace else {
            exn::bail!(ErrorKind::NotFound(format!("no workspace mapping for {depot_path}")));
        };
        let root = crate::path::branch_root(depot_path);
        if root == workspace.depot_root {
            return Ok(workspace.local_root.clone());
        }
        match relative(depot_path.trim_end_matches('/'), &workspace.depot_root) {
            Some(rel) => Ok(local_path_for(&workspace.local_root, rel)),
            None => exn::bail!(ErrorKind::NotFound(format!("{depot_path} is not mapped in {}", workspace.name))),
        }
    }
}
