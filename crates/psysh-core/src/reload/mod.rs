//! Live reloading of modified source files.
//!
//! Before each input line the [`LiveReloader`] checks every file the session
//! has loaded. Files whose modification time moved are parsed and handed to
//! a [`ReloadVisitor`], which patches function, method and constant
//! definitions into the running program without restarting the session.

mod ledger;
mod patcher;
mod visitor;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::paths::pretty_path;
use crate::shell::{Notice, Shell};
use crate::syntax::{self, Stmt};

pub use ledger::{FileState, ReloadLedger};
pub use patcher::{
    AppliedPatch, Callable, ClassShape, CodePatcher, PatchError, PatchReport, UnsupportedPatcher,
};
pub use visitor::ReloadVisitor;

/// What one reload pass did, per file.
#[derive(Debug, Default)]
pub struct ReloadSummary {
    pub files: Vec<(PathBuf, PatchReport)>,
}

impl ReloadSummary {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn report(&self, path: &Path) -> Option<&PatchReport> {
        self.files.iter().find(|(p, _)| p == path).map(|(_, report)| report)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .flat_map(|(_, report)| report.warnings.iter().map(String::as_str))
    }
}

/// A modified file that parsed cleanly.
struct PendingFile {
    path: PathBuf,
    mtime: SystemTime,
    source: String,
    stmts: Vec<Stmt>,
}

/// Reloads modified files at the start of every input cycle.
#[derive(Debug, Default)]
pub struct LiveReloader {
    ledger: ReloadLedger,
    force: bool,
}

impl LiveReloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ReloadLedger {
        &self.ledger
    }

    pub fn is_force_reload(&self) -> bool {
        self.force
    }

    /// Toggle force mode. Turning it on immediately reloads every file
    /// whose last reload skipped conditional definitions.
    pub fn set_force_reload(&mut self, force: bool, shell: &mut dyn Shell) -> ReloadSummary {
        self.force = force;
        let mut summary = ReloadSummary::default();
        if !force || self.ledger.skipped_count() == 0 {
            return summary;
        }

        let skipped = self.ledger.take_skipped();
        let paths: Vec<PathBuf> = skipped.iter().map(|(path, _)| path.clone()).collect();
        self.announce(shell, &paths);

        for (path, mtime) in skipped {
            match read_and_parse(&path) {
                Ok((source, stmts)) => {
                    let report = self.apply(shell, &path, &source, &stmts);
                    summary.files.push((path.clone(), report));
                }
                Err(e) => report_failure(shell, &path, &e),
            }
            self.ledger.record(&path, mtime);
        }
        summary
    }

    /// Check every loaded file and reload the ones that changed.
    pub fn reload(&mut self, shell: &mut dyn Shell) -> ReloadSummary {
        let mut pending = Vec::new();

        for path in shell.loaded_files() {
            let Ok(mtime) = fs::metadata(&path).and_then(|m| m.modified()) else {
                continue;
            };
            match self.ledger.check(&path, mtime) {
                FileState::Unseen => {
                    self.ledger.record(&path, mtime);
                    continue;
                }
                FileState::Unchanged => continue,
                FileState::Modified => {}
            }

            match read_and_parse(&path) {
                Ok((source, stmts)) => pending.push(PendingFile {
                    path,
                    mtime,
                    source,
                    stmts,
                }),
                Err(Error::Io(e)) => report_failure(shell, &path, &Error::Io(e)),
                Err(_) => shell.write_exception(&Error::Reload {
                    message: format!(
                        "Modified file \"{}\" has syntax errors and cannot be reloaded",
                        pretty_path(&path)
                    ),
                    file: path,
                }),
            }
        }

        let mut summary = ReloadSummary::default();
        if pending.is_empty() {
            return summary;
        }

        let paths: Vec<PathBuf> = pending.iter().map(|file| file.path.clone()).collect();
        self.announce(shell, &paths);

        for file in pending {
            let report = self.apply(shell, &file.path, &file.source, &file.stmts);
            self.ledger.record(&file.path, file.mtime);
            if report.has_skips {
                self.ledger.mark_skipped(&file.path, file.mtime);
            } else {
                self.ledger.clear_skipped(&file.path);
            }
            summary.files.push((file.path, report));
        }
        summary
    }

    fn announce(&self, shell: &mut dyn Shell, paths: &[PathBuf]) {
        let target = match paths {
            [single] => pretty_path(single),
            _ => format!("{} files", paths.len()),
        };
        let message = if self.force {
            format!("YOLO: Force-reloading {}", target)
        } else {
            format!("Reloading {}", target)
        };
        shell.write_notice(&Notice::Info(message));
    }

    fn apply(
        &self,
        shell: &mut dyn Shell,
        path: &Path,
        source: &str,
        stmts: &[Stmt],
    ) -> PatchReport {
        debug!("Reloading {}", path.display());
        let report =
            ReloadVisitor::new(shell.code_patcher(), path, source, self.force).visit(stmts);
        debug!(
            "Reloaded {}: {} patches, {} warnings",
            path.display(),
            report.applied.len(),
            report.warnings.len()
        );
        for warning in &report.warnings {
            shell.write_notice(&Notice::Warning(warning.clone()));
        }
        report
    }
}

impl Listener for LiveReloader {
    fn on_input(&mut self, shell: &mut dyn Shell, _input: &str) -> Result<Option<String>> {
        self.reload(shell);
        Ok(None)
    }
}

fn read_and_parse(path: &Path) -> Result<(String, Vec<Stmt>)> {
    let source = fs::read_to_string(path)?;
    let stmts = syntax::parse(&source)?;
    Ok((source, stmts))
}

fn report_failure(shell: &mut dyn Shell, path: &Path, error: &Error) {
    shell.write_exception(&Error::Reload {
        file: path.to_path_buf(),
        message: format!("Failed to reload {}: {}", pretty_path(path), error),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeImage, UserFunction};
    use crate::shell::ScopeVariables;
    use crate::syntax::{NameContext, StmtKind};
    use std::fs::File;
    use std::rc::Rc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct TestShell {
        image: RuntimeImage,
        files: Vec<PathBuf>,
        notices: Vec<Notice>,
        errors: Vec<String>,
    }

    impl Shell for TestShell {
        fn scope_variables(&self, _include_special: bool) -> ScopeVariables {
            ScopeVariables::new()
        }

        fn set_scope_variables(&mut self, _vars: ScopeVariables) {}

        fn write_exception(&mut self, error: &Error) {
            self.errors.push(error.to_string());
        }

        fn write_notice(&mut self, notice: &Notice) {
            self.notices.push(notice.clone());
        }

        fn loaded_files(&self) -> Vec<PathBuf> {
            self.files.clone()
        }

        fn code_patcher(&mut self) -> &mut dyn CodePatcher {
            &mut self.image
        }
    }

    impl TestShell {
        /// Declare the file's functions the way an include would.
        fn load(&mut self, path: &Path) {
            let stmts = syntax::parse(&fs::read_to_string(path).unwrap()).unwrap();
            let mut pending: Vec<&Stmt> = stmts.iter().collect();
            while let Some(stmt) = pending.pop() {
                match &stmt.kind {
                    StmtKind::Function(decl) => {
                        let names = Rc::new(NameContext::new());
                        let function =
                            UserFunction::from_function(decl, decl.name.clone(), names, None);
                        self.image.declare_function(Rc::new(function)).unwrap();
                    }
                    StmtKind::Control(flow) => pending.extend(flow.bodies().into_iter().flatten()),
                    _ => {}
                }
            }
            self.files.push(path.to_path_buf());
        }

        fn warnings(&self) -> Vec<&str> {
            self.notices
                .iter()
                .filter_map(|n| match n {
                    Notice::Warning(w) => Some(w.as_str()),
                    Notice::Info(_) => None,
                })
                .collect()
        }
    }

    /// Rewrite a file and push its mtime forward so the change is visible
    /// regardless of filesystem timestamp resolution.
    fn rewrite(path: &Path, contents: &str, bump: u64) {
        fs::write(path, contents).unwrap();
        let mtime = SystemTime::now() + Duration::from_secs(bump);
        File::options().write(true).open(path).unwrap().set_modified(mtime).unwrap();
    }

    #[test]
    fn test_unchanged_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.php");
        fs::write(&path, "<?php function greet() { return 'hello'; }").unwrap();

        let mut shell = TestShell::default();
        shell.load(&path);
        let mut reloader = LiveReloader::new();

        assert!(reloader.reload(&mut shell).is_empty());
        assert!(reloader.ledger().timestamp(&path).is_some());
        assert!(reloader.reload(&mut shell).is_empty());
        assert!(shell.notices.is_empty());
        assert!(shell.errors.is_empty());
    }

    #[test]
    fn test_modified_file_is_reloaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.php");
        fs::write(&path, "<?php function greet() { return 'hello'; }").unwrap();

        let mut shell = TestShell::default();
        shell.load(&path);
        let mut reloader = LiveReloader::new();
        reloader.reload(&mut shell);

        rewrite(&path, "<?php function greet() { return 'goodbye'; }", 5);
        let summary = reloader.reload(&mut shell);
        let report = summary.report(&path).unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.applied.len(), 1);
        assert!(matches!(&shell.notices[0], Notice::Info(m) if m.starts_with("Reloading ")));

        // The new timestamp is recorded.
        assert!(reloader.reload(&mut shell).is_empty());
    }

    #[test]
    fn test_syntax_error_leaves_ledger_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.php");
        fs::write(&path, "<?php function greet() { return 1; }").unwrap();

        let mut shell = TestShell::default();
        shell.load(&path);
        let mut reloader = LiveReloader::new();
        reloader.reload(&mut shell);
        let before = reloader.ledger().timestamp(&path);

        rewrite(&path, "<?php function greet( { ", 5);
        assert!(reloader.reload(&mut shell).is_empty());
        assert_eq!(shell.errors.len(), 1);
        assert!(shell.errors[0].contains("has syntax errors and cannot be reloaded"));
        assert_eq!(reloader.ledger().timestamp(&path), before);

        // Reported again until fixed.
        reloader.reload(&mut shell);
        assert_eq!(shell.errors.len(), 2);

        rewrite(&path, "<?php function greet() { return 2; }", 10);
        assert_eq!(reloader.reload(&mut shell).files.len(), 1);
    }

    #[test]
    fn test_force_reload_processes_skipped_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lib.php");
        fs::write(&path, "<?php if (true) { function conditional() { return 1; } }").unwrap();

        let mut shell = TestShell::default();
        shell.load(&path);
        let mut reloader = LiveReloader::new();
        reloader.reload(&mut shell);

        rewrite(&path, "<?php if (true) { function conditional() { return 2; } }", 5);
        let summary = reloader.reload(&mut shell);
        assert!(summary.report(&path).unwrap().has_skips);
        assert!(reloader.ledger().is_skipped(&path));
        assert_eq!(shell.warnings().len(), 1);
        assert!(shell.warnings()[0].contains("conditional"));

        let summary = reloader.set_force_reload(true, &mut shell);
        let report = summary.report(&path).unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!(!reloader.ledger().is_skipped(&path));
        assert_eq!(
            shell.warnings()[1],
            "YOLO: Force-reloaded if (...) { function conditional() ... }"
        );
        let forcing = format!("YOLO: Force-reloading {}", pretty_path(&path));
        assert!(shell.notices.contains(&Notice::Info(forcing)));

        // Nothing left to force, and the file is up to date.
        reloader.set_force_reload(false, &mut shell);
        assert!(reloader.set_force_reload(true, &mut shell).is_empty());
        assert!(reloader.reload(&mut shell).is_empty());
    }

    #[test]
    fn test_deleted_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.php");
        fs::write(&path, "<?php function gone() {}").unwrap();

        let mut shell = TestShell::default();
        shell.load(&path);
        fs::remove_file(&path).unwrap();

        let mut reloader = LiveReloader::new();
        assert!(reloader.reload(&mut shell).is_empty());
        assert!(shell.errors.is_empty());
    }
}
