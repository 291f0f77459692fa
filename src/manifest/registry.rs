use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::error::{Result, RouterError};
use crate::core::reasons;

use super::model::StrategyManifest;

/// 清单查找失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMiss {
    UnknownStrategy,
    UnknownInstrument,
}

impl LookupMiss {
    pub fn reason(&self) -> &'static str {
        match self {
            LookupMiss::UnknownStrategy => reasons::UNKNOWN_STRATEGY,
            LookupMiss::UnknownInstrument => reasons::UNKNOWN_INSTRUMENT,
        }
    }

    pub fn into_error(self, strategy_id: &str, instrument: &str, mode: &str) -> RouterError {
        RouterError::NotFound {
            strategy_id: strategy_id.to_string(),
            instrument: instrument.to_string(),
            mode: mode.to_string(),
        }
    }
}

/// 策略清单注册表，加载后只读；重新加载需要新建实例
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    manifests: HashMap<String, Arc<StrategyManifest>>,
}

impl ManifestRegistry {
    /// 从文件或目录加载全部清单，任何一份校验失败则整体失败
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut files = Vec::new();
        for path in paths {
            collect_manifest_files(path.as_ref(), &mut files)?;
        }
        files.sort();

        let mut manifests = Vec::with_capacity(files.len());
        for file in files {
            let contents = fs::read_to_string(&file).map_err(|e| {
                RouterError::manifest(file.display().to_string(), format!("读取失败: {}", e))
            })?;
            let manifest = StrategyManifest::from_yaml_str(&contents, file.clone())?;
            log::info!(
                "📄 加载策略清单: {} ({}, {} 个品种) <- {}",
                manifest.id,
                manifest.category,
                manifest.instruments.len(),
                file.display()
            );
            manifests.push(manifest);
        }

        Self::from_manifests(manifests)
    }

    pub fn from_manifests(manifests: Vec<StrategyManifest>) -> Result<Self> {
        let mut map: HashMap<String, Arc<StrategyManifest>> = HashMap::new();
        for manifest in manifests {
            if let Some(existing) = map.get(&manifest.id) {
                return Err(RouterError::manifest(
                    manifest.source.display().to_string(),
                    format!(
                        "策略 id 重复: {} (已由 {} 定义)",
                        manifest.id,
                        existing.source.display()
                    ),
                ));
            }
            map.insert(manifest.id.clone(), Arc::new(manifest));
        }
        Ok(Self { manifests: map })
    }

    pub fn lookup(
        &self,
        strategy_id: &str,
        instrument: &str,
        mode: &str,
    ) -> std::result::Result<Arc<StrategyManifest>, LookupMiss> {
        let manifest = self
            .manifests
            .get(strategy_id)
            .ok_or(LookupMiss::UnknownStrategy)?;
        if manifest.find_instrument(instrument, mode).is_none() {
            return Err(LookupMiss::UnknownInstrument);
        }
        Ok(manifest.clone())
    }

    pub fn get(&self, strategy_id: &str) -> Option<&Arc<StrategyManifest>> {
        self.manifests.get(strategy_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.manifests.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StrategyManifest>> {
        self.manifests.values()
    }

    pub fn archive_namespace(&self, strategy_id: &str) -> String {
        self.manifests
            .get(strategy_id)
            .map(|m| m.archive_namespace())
            .unwrap_or_else(|| strategy_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

fn collect_manifest_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry_path = entry?.path();
            if entry_path.is_dir() {
                collect_manifest_files(&entry_path, out)?;
            } else if is_manifest_file(&entry_path) {
                out.push(entry_path);
            }
        }
        Ok(())
    } else if path.is_file() {
        out.push(path.to_path_buf());
        Ok(())
    } else {
        Err(RouterError::manifest(
            path.display().to_string(),
            "路径不存在",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::model::tests::SAMPLE;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_directory_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "scalp.yml", SAMPLE);
        write(
            dir.path(),
            "swing.yaml",
            &SAMPLE
                .replace("id: scalp_btc", "id: swing_eth")
                .replace("category: scalping", "category: swing"),
        );
        write(dir.path(), "README.md", "not a manifest");

        let registry = ManifestRegistry::load(&[dir.path()]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["scalp_btc", "swing_eth"]);

        let m = registry.lookup("scalp_btc", "BTCUSDT", "live").unwrap();
        assert_eq!(m.id, "scalp_btc");
        assert_eq!(
            registry.lookup("nope", "BTCUSDT", "live").unwrap_err(),
            LookupMiss::UnknownStrategy
        );
        assert_eq!(
            registry.lookup("scalp_btc", "SOLUSDT", "live").unwrap_err(),
            LookupMiss::UnknownInstrument
        );
        assert_eq!(registry.archive_namespace("scalp_btc"), "scalp_v1");
        assert_eq!(registry.archive_namespace("unknown"), "unknown");
    }

    #[test]
    fn test_duplicate_ids_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.yml", SAMPLE);
        write(dir.path(), "b.yml", SAMPLE);

        let err = ManifestRegistry::load(&[dir.path()]).unwrap_err();
        assert!(matches!(err, RouterError::ManifestValidation { .. }));
    }

    #[test]
    fn test_one_bad_manifest_fails_whole_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good.yml", SAMPLE);
        write(dir.path(), "bad.yml", "meta:\n  id: x\n  category: day\n");

        let err = ManifestRegistry::load(&[dir.path()]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_path_is_error() {
        let err = ManifestRegistry::load(&["/definitely/not/here.yml"]).unwrap_err();
        assert!(matches!(err, RouterError::ManifestValidation { .. }));
    }

    #[test]
    fn test_bundled_manifests_are_valid() {
        let registry = ManifestRegistry::load(&["manifests"]).unwrap();
        assert_eq!(registry.ids(), vec!["scalp_btc", "swing_eth"]);
        assert!(registry.lookup("swing_eth", "ETHUSDT", "paper").is_ok());
        assert_eq!(registry.archive_namespace("swing_eth"), "swing_eth");
    }
}
