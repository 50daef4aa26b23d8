#![allow(dead_code)]

use assert_cmd::Command;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// A private home directory plus a command preconfigured to use it.
pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// Another command sharing the same home.
    pub fn new_cmd(&self) -> Command {
        command_for(self.home.path())
    }

    pub fn std_cmd(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_berth"));
        cmd.arg("--home").arg(self.home.path());
        cmd.env_remove("BERTH_INDEXES");
        cmd
    }
}

pub fn berth() -> TestContext {
    let home = TempDir::new().expect("create test home");
    TestContext {
        cmd: command_for(home.path()),
        home,
    }
}

fn command_for(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_berth"));
    // You can override this with .timeout(Duration::from_secs(N))
    cmd.timeout(Duration::from_secs(60));
    cmd.env_remove("BERTH_INDEXES");
    cmd.arg("--home").arg(home);
    cmd
}
