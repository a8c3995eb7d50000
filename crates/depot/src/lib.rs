pub mod error;
mod models;
pub mod path;
pub mod remote;

pub use crate::models::{
    ActionClass, ChangelistDescription, ChangelistQuery, ChangelistStatus, ChangelistSummary, Credentials, FileAction,
    FileKind, FileRecord, FileSpec, FileType, LabelSummary, Revision,
};
pub use crate::path::validate as validate_path;
pub use crate::remote::Depot;
use std::sync::Arc;

pub type DepotHandle = Arc<dyn Depot + Send + Sync>;
