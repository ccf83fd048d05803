//! Layered configuration for timekeep.
//!
//! Values are merged, later sources winning:
//! 1. Built-in defaults.
//! 2. A config file: either given explicitly, or `timekeep.toml` in the
//!    platform config directory (`.toml`, `.yaml`/`.yml` and `.json` are
//!    understood).
//! 3. Environment variables prefixed `TIMEKEEP_`, e.g.
//!    `TIMEKEEP_STORAGE_ROOT=/mnt/backups`.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use timekeep_storage::HashAlgorithm;

pub const ENV_PREFIX: &str = "TIMEKEEP_";
pub const CONFIG_FILE: &str = "timekeep.toml";
const CATALOG_FILE: &str = "catalog.db";
const RESTORE_DIR: &str = "restored";
const DEFAULT_CONCURRENCY: usize = 4;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "timekeep")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `backups/`.
    pub storage_root: PathBuf,
    /// SQLite catalog; defaults to `{storage_root}/catalog.db`.
    pub catalog: Option<PathBuf>,
    /// Where backups are reconstructed; defaults to `{storage_root}/restored`.
    pub restore_root: Option<PathBuf>,
    /// Digest used for new full backups. Differentials keep their parent's.
    pub hash_algorithm: HashAlgorithm,
    /// Files hashed or copied at the same time within one backup.
    pub concurrency: usize,
    /// Treat content missing from an ancestor backup as an error instead of
    /// skipping the file.
    pub strict_reconstruction: bool,
    /// Symbolic links are skipped unless this is set.
    pub follow_symlinks: bool,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            // An empty path fails validation; only hit without a home directory.
            storage_root: project_dirs().map(|d| d.data_dir().to_path_buf()).unwrap_or_default(),
            catalog: None,
            restore_root: None,
            hash_algorithm: HashAlgorithm::default(),
            concurrency: DEFAULT_CONCURRENCY,
            strict_reconstruction: true,
            follow_symlinks: false,
        }
    }
}

impl Config {
    /// Defaults rooted at `storage_root`, ignoring files and environment.
    pub fn for_root(storage_root: impl Into<PathBuf>) -> Self {
        Self { storage_root: storage_root.into(), ..Self::default() }
    }

    /// Location of the default config file, if the platform has a config
    /// directory.
    pub fn default_file() -> Option<PathBuf> {
        project_dirs().map(|d| d.config_dir().join(CONFIG_FILE))
    }

    /// Build the layered provider without extracting it.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        match file {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                figment = Self::merge_file(figment, path)?;
            },
            None => {
                if let Some(path) = Self::default_file().filter(|p| p.is_file()) {
                    tracing::debug!(path = %path.display(), "Using default config file");
                    figment = Self::merge_file(figment, &path)?;
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
        let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        Ok(match extension.as_deref() {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
        })
    }

    /// Load and validate configuration from every layer.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::from_figment(&Self::figment(file)?)
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.storage_root.is_absolute() {
            exn::bail!(ErrorKind::Invalid(format!(
                "storage_root must be an absolute path, got `{}`",
                self.storage_root.display()
            )));
        }
        for (key, path) in [("catalog", &self.catalog), ("restore_root", &self.restore_root)] {
            if let Some(path) = path
                && !path.is_absolute()
            {
                exn::bail!(ErrorKind::Invalid(format!("{key} must be an absolute path, got `{}`", path.display())));
            }
        }
        if self.concurrency == 0 {
            exn::bail!(ErrorKind::Invalid("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog.clone().unwrap_or_else(|| self.storage_root.join(CATALOG_FILE))
    }

    pub fn restore_path(&self) -> PathBuf {
        self.restore_root.clone().unwrap_or_else(|| self.storage_root.join(RESTORE_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = Config::for_root("/var/lib/timekeep");
        assert_eq!(config.concurrency, 4);
        assert!(config.strict_reconstruction);
        assert!(!config.follow_symlinks);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.catalog_path(), Path::new("/var/lib/timekeep/catalog.db"));
        assert_eq!(config.restore_path(), Path::new("/var/lib/timekeep/restored"));
        config.validate().unwrap();
    }

    #[rstest]
    #[case(Config::for_root("relative/root"))]
    #[case(Config { concurrency: 0, ..Config::for_root("/data") })]
    #[case(Config { catalog: Some(PathBuf::from("catalog.db")), ..Config::for_root("/data") })]
    fn test_invalid(#[case] config: Config) {
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_file_then_environment() {
        Jail::expect_with(|jail| {
            let root = jail.directory().join("store");
            jail.create_file(
                "timekeep.toml",
                &format!("storage_root = {:?}\nhash_algorithm = \"blake3\"\nconcurrency = 8\n", root.display().to_string()),
            )?;
            jail.set_env("TIMEKEEP_CONCURRENCY", "2");
            jail.set_env("TIMEKEEP_STRICT_RECONSTRUCTION", "false");
            let config = Config::load(Some(&jail.directory().join("timekeep.toml"))).unwrap();
            assert_eq!(config.storage_root, root);
            assert_eq!(config.hash_algorithm, HashAlgorithm::Blake3);
            assert_eq!(config.concurrency, 2);
            assert!(!config.strict_reconstruction);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_and_json() {
        Jail::expect_with(|jail| {
            jail.create_file("timekeep.yaml", "storage_root: /srv/yaml\n")?;
            jail.create_file("timekeep.json", r#"{"storage_root": "/srv/json", "follow_symlinks": true}"#)?;
            let yaml = Config::load(Some(&jail.directory().join("timekeep.yaml"))).unwrap();
            assert_eq!(yaml.storage_root, Path::new("/srv/yaml"));
            let json = Config::load(Some(&jail.directory().join("timekeep.json"))).unwrap();
            assert_eq!(json.storage_root, Path::new("/srv/json"));
            assert!(json.follow_symlinks);
            Ok(())
        });
    }

    #[test]
    fn test_missing_and_unsupported_files() {
        let temp = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&temp.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        let ini = temp.path().join("timekeep.ini");
        std::fs::write(&ini, "storage_root=/x").unwrap();
        let err = Config::load(Some(&ini)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[test]
    fn test_bad_values_fail_to_parse() {
        Jail::expect_with(|jail| {
            jail.create_file("timekeep.toml", "storage_root = \"/data\"\nhash_algorithm = \"md5\"\n")?;
            let err = Config::load(Some(&jail.directory().join("timekeep.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Parse));
            Ok(())
        });
    }
}
