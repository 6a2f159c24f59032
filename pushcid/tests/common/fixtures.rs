use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Isolated config, workspace root, and payload files for one test.
pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn workspaces(&self) -> PathBuf {
        self.dir.path().join("workspaces")
    }

    /// Write `config.toml` with the given `[job]` body and a workspace root
    /// inside the temp dir. The API URL points at a closed local port.
    pub fn write_config(&self, job: &str) -> PathBuf {
        let path = self.dir.path().join("config.toml");
        let contents = format!(
            "[general]\nbase_path = {:?}\n\n[github]\napi_url = \"http://127.0.0.1:9\"\nrequest_timeout_secs = 2\n\n[job]\n{job}\n",
            self.workspaces().display().to_string()
        );
        std::fs::write(&path, contents).expect("write config");
        path
    }

    pub fn write_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("write file");
        path
    }

    /// Run the binary with `--config <config>` and a clean `PUSHCI_*` env.
    pub fn pushcid(&self, config: &Path, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_pushcid"));
        for (key, _) in std::env::vars() {
            if key.starts_with("PUSHCI_") {
                cmd.env_remove(key);
            }
        }
        cmd.arg("--config")
            .arg(config)
            .args(args)
            .env("RUST_LOG", "warn")
            .output()
            .expect("failed to run pushcid")
    }
}
