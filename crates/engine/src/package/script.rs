//! Transfer scripts shipped inside a package.
//!
//! Each script takes the destination depot path and local folder as its two
//! positional parameters and replays the package's deletes, adds and edits
//! with nothing but `mkdir`, a copy command and the depot command line
//! client. The server, user and workspace lines are placeholders for the
//! person running the script to fill in.

use crate::package::error::{ErrorKind, Result};
use crate::reconcile::ReconcilePlan;
use depotsync_depot::path::relative;
use exn::ResultExt;
use serde::Serialize;
use upon::{Engine, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Windows `cmd` batch file, CRLF line endings.
    Bat,
    /// POSIX shell script, LF line endings.
    Bash,
}
impl ScriptKind {
    pub fn entry_name(self) -> &'static str {
        match self {
            ScriptKind::Bat => super::BAT_ENTRY,
            ScriptKind::Bash => super::BASH_ENTRY,
        }
    }
}

const BAT: &str = r#"@echo off

p4 set P4PORT=P4Server:1666
p4 set P4USER=Authed.User
p4 set P4CLIENT=WORKSPACE

rem DepotRemotePath is the depot location of the destination branch e.g. //depot/Branch
set DepotRemotePath=%1
rem LocalDestFilePath is the local folder of the destination branch e.g. d:\depot\Branch
set LocalDestFilePath=%2
set DepotRemotePath=%DepotRemotePath:"=%
set LocalDestFilePath=%LocalDestFilePath:"=%
{% for file in deletes %}
p4 delete "%DepotRemotePath%/{{ file.path }}"{% endfor %}
{% for file in adds %}
mkdir "%LocalDestFilePath%{{ file.dir|windows }}"
xcopy /S /F /Y /I "{{ file.path|windows }}" "%LocalDestFilePath%{{ file.dir|windows }}"
p4 add "%DepotRemotePath%/{{ file.path }}"
{% endfor %}{% for file in edits %}
mkdir "%LocalDestFilePath%{{ file.dir|windows }}"
p4 edit "%DepotRemotePath%/{{ file.path }}"
xcopy /S /F /Y /I "{{ file.path|windows }}" "%LocalDestFilePath%{{ file.dir|windows }}"
{% endfor %}"#;

const BASH: &str = r#"#!/bin/bash

p4 set P4PORT=P4Server:1666
p4 set P4USER=Authed.User
p4 set P4CLIENT=WORKSPACE

#DepotRemotePath is the depot location of the destination branch e.g. //depot/Branch
DepotRemotePath=$1
#LocalDestFilePath is the local folder of the destination branch e.g. /Documents/depot/Branch
LocalDestFilePath=$2
DepotRemotePath=${DepotRemotePath//\"/}
LocalDestFilePath=${LocalDestFilePath//\"/}
{% for file in deletes %}
p4 delete "${DepotRemotePath}/{{ file.path }}"{% endfor %}
{% for file in adds %}
mkdir -p "${LocalDestFilePath}{{ file.dir }}"
cp "./{{ file.path }}" "${LocalDestFilePath}/{{ file.path }}"
p4 add "${DepotRemotePath}/{{ file.path }}"
{% endfor %}{% for file in edits %}
mkdir -p "${LocalDestFilePath}{{ file.dir }}"
p4 edit "${DepotRemotePath}/{{ file.path }}"
cp "./{{ file.path }}" "${LocalDestFilePath}/{{ file.path }}"
{% endfor %}"#;

/// One file operation as the templates see it.
#[derive(Serialize)]
struct Operation<'a> {
    /// Path below the branch root, `/`-separated.
    path: &'a str,
    /// Parent directory of `path` with a leading `/`, or empty at the root.
    dir: String,
}
impl<'a> Operation<'a> {
    fn new(path: &'a str) -> Self {
        let dir = match path.rsplit_once('/') {
            Some((dir, _)) => format!("/{dir}"),
            None => String::new(),
        };
        Self { path, dir }
    }
}

#[derive(Serialize)]
struct Operations<'a> {
    deletes: Vec<Operation<'a>>,
    adds: Vec<Operation<'a>>,
    edits: Vec<Operation<'a>>,
}
impl<'a> Operations<'a> {
    fn new(plan: &'a ReconcilePlan) -> Self {
        let operations = |paths: &'a [String]| -> Vec<Operation<'a>> {
            paths.iter().filter_map(|p| relative(p, &plan.branch_root)).map(Operation::new).collect()
        };
        Self {
            deletes: operations(&plan.files_to_delete),
            adds: operations(&plan.files_to_add),
            edits: operations(&plan.files_to_edit),
        }
    }
}

/// Renders both transfer scripts from a [`ReconcilePlan`].
pub struct ScriptGenerator {
    engine: Engine<'static>,
    bat: Template<'static>,
    bash: Template<'static>,
}
impl ScriptGenerator {
    pub fn new() -> Result<Self> {
        let mut engine = Engine::new();
        addons::configure(&mut engine);
        let bat = engine.compile(BAT).or_raise(|| ErrorKind::Template)?;
        let bash = engine.compile(BASH).or_raise(|| ErrorKind::Template)?;
        Ok(Self { engine, bat, bash })
    }

    pub fn render(&self, kind: ScriptKind, plan: &ReconcilePlan) -> Result<String> {
        let template = match kind {
            ScriptKind::Bat => &self.bat,
            ScriptKind::Bash => &self.bash,
        };
        let script =
            template.render(&self.engine, Operations::new(plan)).to_string().or_raise(|| ErrorKind::Template)?;
        Ok(match kind {
            ScriptKind::Bat => script.replace('\n', "\r\n"),
            ScriptKind::Bash => script,
        })
    }
}

mod addons {
    use std::fmt::Write;
    use upon::{Engine, Value, fmt as upon_fmt};

    /// Writes a `/`-separated path with Windows separators.
    fn windows_formatter(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        match value {
            Value::String(s) => write!(f, "{}", s.replace('/', "\\"))?,
            v => upon_fmt::default(f, v)?,
        };
        Ok(())
    }

    pub(crate) fn configure(engine: &mut Engine<'_>) {
        engine.add_formatter("windows", windows_formatter);
    }
}
