//! Depot models.
//!
//! Value types exchanged with the depot: file records, file types, head
//! actions, revision specifiers and the changelist/label summaries used when
//! browsing history.

use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;

/// How a file's content is normalized before it is sized and checksummed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileKind {
    /// Single-byte text; CRLF is stored as LF.
    Text,
    /// Multi-byte (UTF-8) text; CRLF is stored as LF.
    UnicodeMultibyte,
    /// UTF-16 on the client, canonical UTF-8 (without BOM) in the depot.
    Utf16,
    #[default]
    Binary,
}
impl FileKind {
    pub fn is_text(&self) -> bool {
        !matches!(self, Self::Binary)
    }
}

/// A depot file type: the base [`FileKind`] plus its modifiers.
///
/// Parsed from and displayed as the depot's own notation, e.g. `text`,
/// `binary+w`, `utf16+kx`. Base types the engine does not normalize
/// (`symlink`, `apple`, `resource`, ...) are treated as [`FileKind::Binary`]
/// but round-trip through [`Display`] unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileType {
    base: String,
    modifiers: String,
}
impl FileType {
    pub fn new(kind: FileKind) -> Self {
        let base = match kind {
            FileKind::Text => "text",
            FileKind::UnicodeMultibyte => "unicode",
            FileKind::Utf16 => "utf16",
            FileKind::Binary => "binary",
        };
        Self { base: base.to_string(), modifiers: String::new() }
    }

    /// Adds the "always writable on the client" (`+w`) modifier.
    pub fn writable(mut self) -> Self {
        if !self.is_writable() {
            self.modifiers.push('w');
        }
        self
    }

    pub fn kind(&self) -> FileKind {
        match self.base.as_str() {
            "text" => FileKind::Text,
            "unicode" => FileKind::UnicodeMultibyte,
            "utf16" => FileKind::Utf16,
            _ => FileKind::Binary,
        }
    }

    /// `true` when the client copy is expected to be modified locally without
    /// being opened, so a local difference is not evidence of corruption.
    pub fn is_writable(&self) -> bool {
        self.modifiers.contains('w')
    }
}
impl Default for FileType {
    fn default() -> Self {
        Self::new(FileKind::Binary)
    }
}
impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.modifiers.is_empty() {
            true => write!(f, "{}", self.base),
            false => write!(f, "{}+{}", self.base, self.modifiers),
        }
    }
}
impl FromStr for FileType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (base, modifiers) = s.split_once('+').unwrap_or((s, ""));
        let base = match base.is_empty() {
            true => "binary".to_string(),
            false => base.to_ascii_lowercase(),
        };
        Ok(Self { base, modifiers: modifiers.to_string() })
    }
}
impl From<FileKind> for FileType {
    fn from(kind: FileKind) -> Self {
        Self::new(kind)
    }
}
impl Serialize for FileType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
impl<'de> Deserialize<'de> for FileType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        // Infallible: every string is a (possibly unrecognised) file type.
        Ok(s.parse().unwrap_or_default())
    }
}

/// The action recorded against a file revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    #[default]
    None,
    Add,
    Edit,
    Delete,
    Branch,
    Integrate,
    Import,
    MoveAdd,
    MoveDelete,
    DeleteFrom,
    DeleteInto,
    EditFrom,
    EditInto,
    Purge,
    Archive,
}

/// What replaying an action against another branch requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    Add,
    Edit,
    Delete,
    /// Actions that cannot be replayed (purged or archived revisions).
    Unhandled,
}

impl FileAction {
    pub fn class(&self) -> ActionClass {
        match self {
            Self::Delete | Self::MoveDelete | Self::DeleteFrom | Self::DeleteInto => ActionClass::Delete,
            Self::Add | Self::MoveAdd | Self::Branch | Self::Import => ActionClass::Add,
            Self::Edit | Self::Integrate | Self::EditFrom | Self::EditInto => ActionClass::Edit,
            Self::None | Self::Purge | Self::Archive => ActionClass::Unhandled,
        }
    }

    /// `true` when the revision has no content to archive.
    pub fn removes_content(&self) -> bool {
        matches!(self.class(), ActionClass::Delete) || matches!(self, Self::Purge | Self::Archive)
    }
}

/// Immutable description of one depot file at one revision.
///
/// Equality deliberately ignores the depot path and revision numbers: two
/// records are equal when their normalized size, kind and digest agree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRecord {
    pub depot_path: String,
    /// Client-side location, only meaningful during the pass that produced it.
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
    /// Uppercase hex MD5 of the normalized content; empty until computed.
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub file_type: FileType,
    #[serde(default)]
    pub head_action: FileAction,
    #[serde(default)]
    pub have_revision: Option<u32>,
    /// Re-derived on every query, never trusted from disk.
    #[serde(skip)]
    pub head_revision: Option<u32>,
    /// Normalized size in bytes; `None` when the revision has no content
    /// (deleted at the queried revision).
    #[serde(default)]
    pub size: Option<u64>,
}
impl FileRecord {
    pub fn new(depot_path: impl Into<String>, file_type: impl Into<FileType>) -> Self {
        Self { depot_path: depot_path.into(), file_type: file_type.into(), ..Default::default() }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = digest.into();
        self
    }

    pub fn with_action(mut self, action: FileAction) -> Self {
        self.head_action = action;
        self
    }

    pub fn with_revisions(mut self, have: Option<u32>, head: Option<u32>) -> Self {
        self.have_revision = have;
        self.head_revision = head;
        self
    }

    pub fn with_local_path(mut self, local_path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(local_path.into());
        self
    }

    pub fn kind(&self) -> FileKind {
        self.file_type.kind()
    }

    /// `true` when the record describes content that exists in the depot.
    pub fn is_live(&self) -> bool {
        self.size.is_some()
    }
}
impl PartialEq for FileRecord {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.kind() == other.kind() && self.digest == other.digest
    }
}
impl Eq for FileRecord {}

/// A point in a file's history, in the depot's `#`/`@` notation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum Revision {
    #[display("#head")]
    Head,
    #[display("#have")]
    Have,
    /// Syncing to `#none` removes the file from the client.
    #[display("#none")]
    None,
    #[display("#{_0}")]
    Number(u32),
    #[display("@{_0}")]
    Label(String),
    #[display("@{_0}")]
    Changelist(u32),
}
impl Revision {
    /// Builds a label revision, accepting names with or without the leading `@`.
    pub fn label(name: impl AsRef<str>) -> Self {
        Self::Label(name.as_ref().trim_start_matches('@').to_string())
    }

    /// `true` for revisions that name a fixed point in history (labels and
    /// changelists), as opposed to the moving `#head`/`#have` markers.
    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Label(_) | Self::Changelist(_) | Self::Number(_))
    }
}

/// A depot path (possibly ending in a `*` or `...` wildcard) at a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{path}{revision}")]
pub struct FileSpec {
    pub path: String,
    pub revision: Revision,
}
impl FileSpec {
    pub fn new(path: impl Into<String>, revision: Revision) -> Self {
        Self { path: path.into(), revision }
    }

    pub fn all(paths: impl IntoIterator<Item = impl Into<String>>, revision: &Revision) -> Vec<Self> {
        paths.into_iter().map(|p| Self::new(p, revision.clone())).collect()
    }
}

/// Credentials used to (re-)establish a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub server: String,
    pub user: String,
    pub ticket: String,
}
impl Credentials {
    pub fn new(server: impl Into<String>, user: impl Into<String>, ticket: impl Into<String>) -> Self {
        Self { server: server.into(), user: user.into(), ticket: ticket.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangelistStatus {
    Pending,
    Submitted,
}

/// Summary of a changelist, as listed by the depot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelistSummary {
    /// `0` is the workspace's default changelist.
    pub id: u32,
    pub user: String,
    pub workspace: String,
    pub description: String,
    pub status: ChangelistStatus,
    pub shelved: bool,
    pub submitted_at: Option<OffsetDateTime>,
}
impl ChangelistSummary {
    pub fn is_pending(&self) -> bool {
        self.status == ChangelistStatus::Pending
    }
}

/// A changelist together with the files it touches.
#[derive(Debug, Clone)]
pub struct ChangelistDescription {
    pub summary: ChangelistSummary,
    pub files: Vec<FileRecord>,
}

/// Filter for [`list_changelists`](crate::Depot::list_changelists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelistQuery {
    /// Depot path (with wildcard) the changelists must touch; `None` for all.
    pub path: Option<String>,
    pub status: ChangelistStatus,
    pub user: Option<String>,
    pub workspace: Option<String>,
    pub max: usize,
}
impl ChangelistQuery {
    pub fn pending(max: usize) -> Self {
        Self { path: None, status: ChangelistStatus::Pending, user: None, workspace: None, max }
    }

    pub fn submitted(path: impl Into<String>, max: usize) -> Self {
        Self { path: Some(path.into()), status: ChangelistStatus::Submitted, user: None, workspace: None, max }
    }

    pub fn for_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn for_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

/// Summary of a label, as listed by the depot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSummary {
    pub name: String,
    pub owner: String,
    pub description: String,
    pub updated_at: Option<OffsetDateTime>,
}
