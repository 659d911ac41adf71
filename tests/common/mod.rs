//! Shared fixtures for mender integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use mender::config::Settings;
use mender::host::{HostError, PermissionController, PortController, ServiceController};

/// Host double that records every call instead of touching the system.
#[derive(Debug, Default)]
pub struct FakeHost {
    pub calls: Mutex<Vec<String>>,
    pub fail_restart: bool,
    pub fail_chown: bool,
    pub fail_port_lookup: bool,
    pub port_in_use: bool,
    pub pids: Vec<u32>,
}

impl FakeHost {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

fn failure(program: &str) -> HostError {
    HostError::Failed {
        program: program.to_owned(),
        code: Some(1),
        stderr: "simulated failure".to_owned(),
    }
}

#[async_trait]
impl ServiceController for FakeHost {
    async fn restart(&self, service: &str) -> Result<(), HostError> {
        self.record(format!("restart {service}"));
        if self.fail_restart {
            return Err(failure("systemctl"));
        }
        Ok(())
    }
}

#[async_trait]
impl PortController for FakeHost {
    async fn port_in_use(&self, port: u16) -> Result<bool, HostError> {
        self.record(format!("port {port}"));
        if self.fail_port_lookup {
            return Err(failure("lsof"));
        }
        Ok(self.port_in_use)
    }

    async fn pids_on_port(&self, port: u16) -> Result<Vec<u32>, HostError> {
        self.record(format!("pids {port}"));
        if self.fail_port_lookup {
            return Err(failure("lsof"));
        }
        Ok(self.pids.clone())
    }

    async fn kill(&self, pid: u32) -> Result<(), HostError> {
        self.record(format!("kill {pid}"));
        Ok(())
    }
}

#[async_trait]
impl PermissionController for FakeHost {
    async fn chown_recursive(&self, path: &Path, owner: &str) -> Result<(), HostError> {
        self.record(format!("chown {} {owner}", path.display()));
        if self.fail_chown {
            return Err(failure("chown"));
        }
        Ok(())
    }

    async fn chmod_recursive(&self, path: &Path, mode: &str) -> Result<(), HostError> {
        self.record(format!("chmod {} {mode}", path.display()));
        Ok(())
    }
}

/// Settings for tests: health phase off, given log sources, alert log in `dir`.
pub fn test_settings(dir: &Path, sources: Vec<PathBuf>) -> Settings {
    let mut settings = Settings::default();
    settings.health.enabled = false;
    settings.logs.sources = sources;
    settings.alerts.log_path = dir.join("alerts.log");
    settings.state.db_path = dir.join("state.db");
    settings
}

/// Write `contents` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write file");
    path
}
