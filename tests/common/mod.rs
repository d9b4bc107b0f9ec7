//! Test helpers for integration tests.
//!
//! Provides a [`Harness`] that wires a local host and a script manager over a
//! temporary scripts directory.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use lodestone::host::local::LocalServer;
use lodestone::{CommandSource, LoadReport, ScriptManager, ScriptingConfig};

/// A scripts directory, a local host and a manager bound to both.
///
/// Fields drop in order: the manager stops before the directory goes away.
pub struct Harness {
    pub manager: ScriptManager,
    pub server: LocalServer,
    pub dir: TempDir,
}

impl Harness {
    /// Create a harness with default scripting settings.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Create a harness, adjusting the scripting settings first.
    ///
    /// `scripts_dir` is always pointed at the temporary directory.
    pub fn with_config(adjust: impl FnOnce(&mut ScriptingConfig)) -> Self {
        Self::with_files(&[], adjust)
    }

    /// Create a harness whose scripts directory already holds `files`.
    ///
    /// Shared modules are read when the manager loads a script, so files
    /// written here are visible to the first load.
    pub fn with_files(files: &[(&str, &str)], adjust: impl FnOnce(&mut ScriptingConfig)) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        for (name, content) in files {
            write_file(&dir, name, content);
        }

        let mut config = ScriptingConfig::default();
        adjust(&mut config);
        config.scripts_dir = dir.path().to_string_lossy().into_owned();

        let server = LocalServer::new();
        let manager =
            ScriptManager::new(config, server.services()).expect("failed to start manager");
        Self {
            manager,
            server,
            dir,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a script file into the scripts directory.
    pub fn write(&self, name: &str, content: &str) {
        write_file(&self.dir, name, content);
    }

    /// Write and load a script, panicking if the load failed.
    pub fn load(&self, name: &str, content: &str) -> LoadReport {
        self.write(name, content);
        let report = self.manager.load_script(name, None).expect("load failed");
        assert!(report.success, "script {name} failed to load: {}", report.stderr);
        report
    }

    pub fn console(&self) -> Arc<dyn CommandSource> {
        self.server.console().clone()
    }
}

fn write_file(dir: &TempDir, name: &str, content: &str) {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create script dir");
    }
    fs::write(path, content).expect("failed to write script");
}
