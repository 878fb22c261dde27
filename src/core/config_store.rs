// Config store: live config behind a lock, admin updates persisted as override diffs.
use crate::core::config::{self, load_base_config_value, load_config_from, Config};
use anyhow::{Context, Result};
use serde_yaml::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Config>>,
    base_path: PathBuf,
    override_path: PathBuf,
    version: Arc<AtomicU64>,
}

impl ConfigStore {
    pub fn new(base_path: PathBuf, override_path: PathBuf) -> Self {
        let config = load_config_from(
            &base_path.to_string_lossy(),
            &override_path.to_string_lossy(),
        );
        Self::with_config(config, base_path, override_path)
    }

    pub fn with_config(config: Config, base_path: PathBuf, override_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            base_path,
            override_path,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_env() -> Self {
        Self::new(Self::base_path_default(), Self::override_path_default())
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    pub async fn read<T, F>(&self, reader: F) -> T
    where
        F: FnOnce(&Config) -> T,
    {
        let guard = self.inner.read().await;
        reader(&guard)
    }

    pub async fn update<F>(&self, updater: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().await;
        updater(&mut guard);
        let updated = guard.clone();
        drop(guard);
        self.version.fetch_add(1, Ordering::SeqCst);
        self.persist(&updated).await?;
        Ok(updated)
    }

    async fn persist(&self, config: &Config) -> Result<()> {
        let updated_value = serde_yaml::to_value(config).unwrap_or(Value::Null);
        let base_value = load_base_config_value(&self.base_path.to_string_lossy());
        let diff_value = diff_yaml(&base_value, &updated_value);
        let target = self.override_path.clone();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("create config override dir failed: {}", parent.display())
            })?;
        }
        match diff_value {
            Some(value) => {
                let text = serde_yaml::to_string(&value).unwrap_or_default();
                tokio::fs::write(&target, text).await.with_context(|| {
                    format!("write override config failed: {}", target.display())
                })?;
            }
            None => {
                if let Err(err) = tokio::fs::remove_file(&target).await {
                    if err.kind() != ErrorKind::NotFound {
                        return Err(err).with_context(|| {
                            format!("remove override config failed: {}", target.display())
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn base_path_default() -> PathBuf {
        Path::new(&config::config_path()).to_path_buf()
    }

    pub fn override_path_default() -> PathBuf {
        Path::new(&config::override_path()).to_path_buf()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

fn diff_yaml(base: &Value, updated: &Value) -> Option<Value> {
    if base == updated {
        return None;
    }
    match (base, updated) {
        (Value::Mapping(base_map), Value::Mapping(updated_map)) => {
            let mut diff_map = serde_yaml::Mapping::new();
            for (key, updated_value) in updated_map {
                let base_value = base_map.get(key).unwrap_or(&Value::Null);
                if let Some(value) = diff_yaml(base_value, updated_value) {
                    diff_map.insert(key.clone(), value);
                }
            }
            if diff_map.is_empty() {
                None
            } else {
                Some(Value::Mapping(diff_map))
            }
        }
        _ => Some(updated.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TenantPolicyConfig;

    #[tokio::test]
    async fn update_bumps_version_and_writes_override_diff() {
        let dir = tempfile::tempdir().expect("temp dir");
        let base_path = dir.path().join("relay.yaml");
        let override_path = dir.path().join("data").join("override.yaml");
        std::fs::write(&base_path, "server:\n  host: 127.0.0.1\n  port: 8080\n")
            .expect("write base");

        let store = ConfigStore::new(base_path, override_path.clone());
        assert_eq!(store.version(), 0);

        let updated = store
            .update(|config| {
                config.tenants.policies.push(TenantPolicyConfig {
                    tenant_id: "t1".to_string(),
                    automation_enabled: true,
                    batch_wait_ms: 300,
                });
            })
            .await
            .expect("update config");
        assert_eq!(store.version(), 1);
        assert!(updated.find_policy("t1").is_some());

        let text = std::fs::read_to_string(&override_path).expect("override written");
        assert!(text.contains("t1"));
        assert!(!text.contains("127.0.0.1"));

        let reloaded = load_config_from(
            &dir.path().join("relay.yaml").to_string_lossy(),
            &override_path.to_string_lossy(),
        );
        assert_eq!(
            reloaded.find_policy("t1").map(|policy| policy.batch_wait_ms),
            Some(300)
        );
    }
}
