//! Plain-file key-value store.
//!
//! Values live as one JSON document per leaf under the configured
//! directory, with intermediate path segments becoming directories.
//! `["discord","api","statsMessageId"]` reads and writes
//! `<dir>/discord/api/statsMessageId.json`.

use crate::config::RunConfig;
use crate::instance::Instance;
use crate::modules::Module;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("invalid db path {0:?}")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct Db {
    root: PathBuf,
}

impl Db {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps path segments onto a file below the root. Segments are
    /// joined and re-split on dots, so `["a.b"]` and `["a","b"]` name
    /// the same leaf. Anything outside `[0-9A-Za-z.]` is refused.
    fn leaf(&self, path: &[&str]) -> Result<PathBuf, DbError> {
        let joined = path.join(".");
        if !joined.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
            return Err(DbError::InvalidPath(joined));
        }
        let segments: Vec<&str> = joined.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, dirs)) = segments.split_last() else {
            return Err(DbError::InvalidPath(joined));
        };
        let mut full = self.root.clone();
        for dir in dirs {
            full.push(dir);
        }
        full.push(format!("{last}.json"));
        Ok(full)
    }

    pub async fn get(&self, path: &[&str]) -> Result<Option<Value>, DbError> {
        let leaf = self.leaf(path)?;
        match tokio::fs::read(&leaf).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn put(&self, path: &[&str], value: &Value) -> Result<(), DbError> {
        let leaf = self.leaf(path)?;
        if let Some(parent) = leaf.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&leaf, serde_json::to_vec(value)?).await?;
        Ok(())
    }
}

pub struct DbModule;

#[async_trait]
impl Module for DbModule {
    fn name(&self) -> &'static str {
        "db"
    }

    async fn init(self: Arc<Self>, instance: &Arc<Instance>) -> Result<bool> {
        let logger = instance.bus.logger("DB");
        let Some(dir) = instance.config.db.dir.clone() else {
            logger.debug("Init (load: false)").await;
            return Ok(false);
        };
        logger.debug("Init (load: true)").await;
        prepare_dir(&dir, &instance.config.run).await?;
        instance.set_db(Db::new(dir));
        Ok(true)
    }
}

/// Creates the store directory if needed and, while still root, hands
/// it to the run user with mode 0770.
async fn prepare_dir(dir: &Path, run: &RunConfig) -> Result<()> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => bail!("{} exists and is not a directory", dir.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("cannot create db directory {}", dir.display()))?;
        }
        Err(err) => {
            return Err(err).with_context(|| format!("cannot stat {}", dir.display()));
        }
    }

    if nix::unistd::Uid::effective().is_root() {
        use std::os::unix::fs::PermissionsExt;
        crate::http::chown_to_run_user(dir, run)?;
        let mut perms = std::fs::metadata(dir)?.permissions();
        perms.set_mode(0o770);
        std::fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrip_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::new(dir.path());

        db.put(&["discord", "api", "statsMessageId"], &json!("123"))
            .await
            .unwrap();
        assert!(dir.path().join("discord/api/statsMessageId.json").is_file());

        let value = db.get(&["discord", "api", "statsMessageId"]).await.unwrap();
        assert_eq!(value, Some(json!("123")));
    }

    #[tokio::test]
    async fn missing_keys_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::new(dir.path());
        assert_eq!(db.get(&["nothing", "here"]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dotted_segments_alias_nested_segments() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::new(dir.path());
        db.put(&["a.b"], &json!(1)).await.unwrap();
        assert_eq!(db.get(&["a", "b"]).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn hostile_segments_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::new(dir.path());
        assert!(matches!(
            db.put(&["../escape"], &json!(1)).await,
            Err(DbError::InvalidPath(_))
        ));
        assert!(matches!(
            db.get(&[]).await,
            Err(DbError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn puts_overwrite_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::new(dir.path());
        db.put(&["k"], &json!("old")).await.unwrap();
        db.put(&["k"], &json!("new")).await.unwrap();
        assert_eq!(db.get(&["k"]).await.unwrap(), Some(json!("new")));
    }

    #[tokio::test]
    async fn module_activates_only_with_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[http]\nhost = \"::\"\nport = 8000\n[db]\ndir = \"{}\"\n",
            dir.path().join("store").display()
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let instance = Instance::new(config).unwrap();
        let loaded = Arc::new(DbModule).init(&instance).await.unwrap();
        assert!(loaded);
        assert!(instance.db().is_some());
        assert!(dir.path().join("store").is_dir());

        let config: Config = toml::from_str("[http]\nhost = \"::\"\nport = 8000\n").unwrap();
        let instance = Instance::new(config).unwrap();
        let loaded = Arc::new(DbModule).init(&instance).await.unwrap();
        assert!(!loaded);
        assert!(instance.db().is_none());
    }
}
