//! CLI Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not read `{}`", _0.display())]
    Read(#[error(not(source))] PathBuf),
    #[display("could not check `{}`", _0.display())]
    Check(#[error(not(source))] PathBuf),
    #[display("could not write output")]
    Output,
}
