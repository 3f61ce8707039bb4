//! Kubo repository setup.
//!
//! Prepares a throwaway repository for a verification run: fresh init with
//! alternate ports, provide settings, optional fixed identity, then content
//! import. Every command runs with `IPFS_PATH` pointing at the repository.

use crate::config::{KuboConfig, KuboIdentity, VerifierConfig};
use crate::daemon::NodeCommand;
use crate::error::{Result, VerifyError};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Content imported with `ipfs add -r`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddedContent {
    /// CIDs of every imported block except the top-level directory.
    pub files: Vec<String>,
    /// CID of the top-level directory.
    pub directory: Option<String>,
}

/// A Kubo repository driven through the `ipfs` CLI.
#[derive(Debug, Clone)]
pub struct KuboRepo {
    config: KuboConfig,
}

impl KuboRepo {
    /// Wrap repository settings.
    pub fn new(config: KuboConfig) -> Self {
        Self { config }
    }

    fn config_file(&self) -> PathBuf {
        self.config.repo.join("config")
    }

    async fn ipfs<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let rendered = std::iter::once(self.config.binary.as_os_str())
            .chain(args.iter().map(|a| a.as_ref()))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Running {}", rendered);

        let output = Command::new(&self.config.binary)
            .args(&args)
            .env("IPFS_PATH", &self.config.repo)
            .output()
            .await
            .map_err(|e| VerifyError::Spawn {
                program: self.config.binary.display().to_string(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(VerifyError::NodeCommand {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Identity stored in an existing repository, if any.
    ///
    /// # Errors
    ///
    /// Fails when the config file exists but cannot be read or parsed.
    pub async fn read_identity(&self) -> Result<Option<KuboIdentity>> {
        let path = self.config_file();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let text = tokio::fs::read_to_string(&path).await?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| VerifyError::Config(format!("{}: {e}", path.display())))?;
        Ok(value
            .get("Identity")
            .cloned()
            .and_then(|identity| serde_json::from_value(identity).ok()))
    }

    /// Remove the repository directory.
    pub async fn reset(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.config.repo).await? {
            info!("Removing {}", self.config.repo.display());
            tokio::fs::remove_dir_all(&self.config.repo).await?;
        }
        Ok(())
    }

    /// Wipe and initialise the repository with the configured settings.
    ///
    /// # Errors
    ///
    /// Fails when any `ipfs` invocation fails or the identity cannot be written.
    pub async fn init(&self) -> Result<()> {
        self.reset().await?;
        self.ipfs(["init", "--empty-repo"]).await?;

        let settings = [
            ("Provide.DHT.Interval", &self.config.provide_interval),
            ("Provide.Strategy", &self.config.provide_strategy),
            ("Addresses.API", &self.config.api_addr),
            ("Addresses.Gateway", &self.config.gateway_addr),
        ];
        for (key, value) in settings {
            self.ipfs(["config", key, value.as_str()]).await?;
        }

        let swarm = serde_json::to_string(&self.config.swarm_addrs)
            .map_err(|e| VerifyError::Config(e.to_string()))?;
        self.ipfs(["config", "--json", "Addresses.Swarm", swarm.as_str()]).await?;

        if self.config.disable_telemetry {
            self.ipfs(["config", "Plugins.Plugins.telemetry.Config.Mode", "off"])
                .await?;
        }

        if let Some(identity) = &self.config.identity {
            self.write_identity(identity).await?;
        }
        info!("Initialised repository at {}", self.config.repo.display());
        Ok(())
    }

    /// Overwrite `Identity` in the repository config file.
    ///
    /// `ipfs config` refuses to touch private keys, so the JSON is edited
    /// directly.
    pub async fn write_identity(&self, identity: &KuboIdentity) -> Result<()> {
        let path = self.config_file();
        let text = tokio::fs::read_to_string(&path).await?;
        let mut value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| VerifyError::Config(format!("{}: {e}", path.display())))?;

        let object = value
            .as_object_mut()
            .ok_or_else(|| VerifyError::Config(format!("{}: not a JSON object", path.display())))?;
        object.insert(
            "Identity".to_string(),
            serde_json::to_value(identity).map_err(|e| VerifyError::Config(e.to_string()))?,
        );

        let text =
            serde_json::to_string_pretty(&value).map_err(|e| VerifyError::Config(e.to_string()))?;
        tokio::fs::write(&path, text).await?;
        info!("Using fixed peer identity {}", identity.peer_id);
        Ok(())
    }

    /// `ipfs add -r` a directory. The last CID printed is the directory itself.
    pub async fn add_dir(&self, dir: &Path) -> Result<AddedContent> {
        let output = self
            .ipfs([
                OsStr::new("add"),
                OsStr::new("-r"),
                OsStr::new("-q"),
                OsStr::new("--cid-version=1"),
                OsStr::new("--raw-leaves"),
                dir.as_os_str(),
            ])
            .await?;

        let mut files: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let directory = files.pop();
        info!(
            "Imported {} items from {} (directory {})",
            files.len(),
            dir.display(),
            directory.as_deref().unwrap_or("-")
        );
        Ok(AddedContent { files, directory })
    }

    /// Every block in the local store. An empty list when the listing fails.
    pub async fn refs_local(&self) -> Vec<String> {
        match self.ipfs(["refs", "local"]).await {
            Ok(output) => output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!("Could not list local blocks, tracking no other items: {}", e);
                Vec::new()
            }
        }
    }

    /// Every locally held item of an import: the local block listing, plus
    /// the imported directory in case the listing came back empty.
    pub async fn local_items(&self, added: &AddedContent) -> Vec<String> {
        let mut locals = self.refs_local().await;
        if let Some(directory) = &added.directory {
            if !locals.contains(directory) {
                locals.push(directory.clone());
            }
        }
        locals
    }

    /// Remove a pin.
    pub async fn unpin(&self, cid: &str) -> Result<()> {
        self.ipfs(["pin", "rm", cid]).await?;
        Ok(())
    }

    /// Command that starts the daemon against this repository.
    pub fn daemon_command(&self, config: &VerifierConfig) -> NodeCommand {
        NodeCommand::new(&self.config.binary)
            .arg("daemon")
            .env("IPFS_PATH", self.config.repo.display().to_string())
            .env(&config.log_level_env, config.log_level_directive())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Install a fake `ipfs` that logs its arguments and answers a few commands.
    fn fake_ipfs(dir: &Path) -> PathBuf {
        let script = r#"#!/bin/sh
echo "$IPFS_PATH $*" >> "$IPFS_PATH.calls"
case "$1" in
  init) mkdir -p "$IPFS_PATH" && echo '{"Identity":{"PeerID":"old","PrivKey":"old"},"Addresses":{}}' > "$IPFS_PATH/config" ;;
  add) printf 'bafyfile1\nbafyfile2\nbafydir\n' ;;
  refs) echo "repo locked" >&2; exit 1 ;;
esac
exit 0
"#;
        let path = dir.join("ipfs");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn repo(dir: &Path) -> KuboRepo {
        KuboRepo::new(KuboConfig {
            binary: fake_ipfs(dir),
            repo: dir.join("repo"),
            identity: Some(KuboIdentity {
                peer_id: "12D3KooWfixed".to_string(),
                priv_key: "CAESfixed".to_string(),
            }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_init_configures_repo_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        repo.init().await.unwrap();

        let calls = std::fs::read_to_string(dir.path().join("repo.calls")).unwrap();
        assert!(calls.contains("init --empty-repo"));
        assert!(calls.contains("config Provide.DHT.Interval 10m"));
        assert!(calls.contains("config Provide.Strategy pinned"));
        assert!(calls.contains("config --json Addresses.Swarm [\"/ip4/0.0.0.0/tcp/4401\""));
        assert!(calls.contains("Plugins.Plugins.telemetry.Config.Mode off"));

        let identity = repo.read_identity().await.unwrap().unwrap();
        assert_eq!(identity.peer_id, "12D3KooWfixed");
        assert_eq!(identity.priv_key, "CAESfixed");
    }

    #[tokio::test]
    async fn test_add_dir_splits_directory_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let added = repo(dir.path()).add_dir(dir.path()).await.unwrap();
        assert_eq!(added.files, vec!["bafyfile1", "bafyfile2"]);
        assert_eq!(added.directory.as_deref(), Some("bafydir"));
    }

    #[tokio::test]
    async fn test_refs_local_failure_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(repo(dir.path()).refs_local().await.is_empty());
    }

    #[tokio::test]
    async fn test_local_items_include_imported_directory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let added = repo.add_dir(dir.path()).await.unwrap();
        assert_eq!(repo.local_items(&added).await, vec!["bafydir"]);
    }

    #[tokio::test]
    async fn test_missing_repo_has_no_identity() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(repo(dir.path()).read_identity().await.unwrap(), None);
    }

    #[test]
    fn test_daemon_command_environment() {
        let repo = KuboRepo::new(KuboConfig {
            repo: PathBuf::from("/tmp/repo"),
            ..Default::default()
        });
        let cmd = repo.daemon_command(&VerifierConfig::default());
        assert_eq!(cmd.display(), "ipfs daemon");
        assert!(cmd.env.contains(&("IPFS_PATH".to_string(), "/tmp/repo".to_string())));
        assert!(cmd.env.contains(&(
            "GOLOG_LOG_LEVEL".to_string(),
            "dht=debug,dht/provider=debug".to_string()
        )));
    }
}
