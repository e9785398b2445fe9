use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use etcetera::BaseStrategy;
use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;

pub const DEFAULT_MIGRATION_NAME: &str = "squashed";
const CONFIG_FILE_NAME: &str = "squasher.toml";
const PYPROJECT_FILE_NAME: &str = "pyproject.toml";

/// Where an app keeps its migrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub migrations: PathBuf,
    /// Dotted module path of the migrations package. Derived from
    /// `migrations` when not configured.
    pub module: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    /// Additional roots searched when resolving module paths.
    pub src: Vec<PathBuf>,
    pub apps: IndexMap<String, AppConfig>,
    pub ignore_apps: Vec<String>,
    pub migration_name: String,
    pub rename_template: Option<String>,
    /// Values of settings referenced by swappable dependencies, for example
    /// `AUTH_USER_MODEL = "auth.User"`.
    pub settings: IndexMap<String, String>,
    /// Known-good digests of the framework's migration writer module.
    pub writer_fingerprints: Vec<String>,
    pub include_header: bool,
    pub virtualenv: Option<PathBuf>,
    /// Minor version of Python 3 used for standard library detection.
    pub python_version: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            src: Vec::new(),
            apps: IndexMap::new(),
            ignore_apps: Vec::new(),
            migration_name: DEFAULT_MIGRATION_NAME.to_owned(),
            rename_template: None,
            settings: IndexMap::new(),
            writer_fingerprints: Vec::new(),
            include_header: false,
            virtualenv: None,
            python_version: 12,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct AppConfigFile {
    migrations: PathBuf,
    module: Option<String>,
}

/// One configuration layer as written on disk. Every key is optional so a
/// layer only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    project_root: Option<PathBuf>,
    src: Option<Vec<PathBuf>>,
    #[serde(default)]
    apps: IndexMap<String, AppConfigFile>,
    ignore_apps: Option<Vec<String>>,
    migration_name: Option<String>,
    rename_template: Option<String>,
    #[serde(default)]
    settings: IndexMap<String, String>,
    writer_fingerprints: Option<Vec<String>>,
    include_header: Option<bool>,
    virtualenv: Option<PathBuf>,
    python_version: Option<u8>,
}

impl Config {
    /// Loads every configuration layer for the project at `project_root`.
    ///
    /// Later layers win: user config, project config (`squasher.toml` or
    /// `[tool.squasher]` in `pyproject.toml`), the explicit `config_file`,
    /// then environment variables.
    pub fn load(project_root: Option<&Path>, config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(root) = project_root {
            config.project_root = root.to_path_buf();
        }

        if let Some(user_config) = user_config_path()
            && user_config.is_file()
        {
            config.merge_file(&user_config)?;
        }

        let project_config = config.project_root.join(CONFIG_FILE_NAME);
        let pyproject = config.project_root.join(PYPROJECT_FILE_NAME);
        if project_config.is_file() {
            config.merge_file(&project_config)?;
        } else if pyproject.is_file() {
            config.merge_pyproject(&pyproject)?;
        }

        if let Some(path) = config_file {
            config.merge_file(path)?;
        }

        config.apply_env_overrides();
        config.absolutize();
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        debug!("Loading configuration from {}", path.display());
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let layer: ConfigFile = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        self.merge(layer);
        Ok(())
    }

    fn merge_pyproject(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut document: toml::Table = toml::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let Some(toml::Value::Table(mut tool)) = document.remove("tool") else {
            return Ok(());
        };
        let Some(section) = tool.remove("squasher") else {
            return Ok(());
        };
        debug!("Loading configuration from [tool.squasher] in {}", path.display());
        let layer: ConfigFile = section
            .try_into()
            .with_context(|| format!("Invalid [tool.squasher] table in {}", path.display()))?;
        self.merge(layer);
        Ok(())
    }

    fn merge(&mut self, layer: ConfigFile) {
        if let Some(project_root) = layer.project_root {
            self.project_root = project_root;
        }
        if let Some(src) = layer.src {
            self.src = src;
        }
        for (label, app) in layer.apps {
            self.apps.insert(
                label,
                AppConfig {
                    migrations: app.migrations,
                    module: app.module,
                },
            );
        }
        if let Some(ignore_apps) = layer.ignore_apps {
            self.ignore_apps = ignore_apps;
        }
        if let Some(migration_name) = layer.migration_name {
            self.migration_name = migration_name;
        }
        if layer.rename_template.is_some() {
            self.rename_template = layer.rename_template;
        }
        self.settings.extend(layer.settings);
        if let Some(fingerprints) = layer.writer_fingerprints {
            self.writer_fingerprints = fingerprints;
        }
        if let Some(include_header) = layer.include_header {
            self.include_header = include_header;
        }
        if layer.virtualenv.is_some() {
            self.virtualenv = layer.virtualenv;
        }
        if let Some(python_version) = layer.python_version {
            self.python_version = python_version;
        }
    }

    /// `SQUASHER_IGNORE_APPS`, `SQUASHER_MIGRATION_NAME` and
    /// `SQUASHER_RENAME_TEMPLATE` override file configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(ignore_apps) = std::env::var("SQUASHER_IGNORE_APPS") {
            self.ignore_apps = ignore_apps
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
        if let Ok(migration_name) = std::env::var("SQUASHER_MIGRATION_NAME") {
            self.migration_name = migration_name;
        }
        if let Ok(template) = std::env::var("SQUASHER_RENAME_TEMPLATE") {
            self.rename_template = (!template.is_empty()).then_some(template);
        }
    }

    /// Makes every configured path absolute, relative to the project root.
    fn absolutize(&mut self) {
        if self.project_root.is_relative()
            && let Ok(current_dir) = std::env::current_dir()
        {
            self.project_root = current_dir.join(&self.project_root);
        }
        self.project_root = normalize_path(&self.project_root);

        let root = self.project_root.clone();
        let join = |path: &Path| normalize_path(&root.join(path));
        self.src = self.src.iter().map(|path| join(path)).collect();
        for app in self.apps.values_mut() {
            app.migrations = join(&app.migrations);
        }
        self.virtualenv = self.virtualenv.as_deref().map(join);
    }

    /// Directories module paths are resolved against, configured roots
    /// first and the project root last.
    pub fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.src.clone();
        if !roots.contains(&self.project_root) {
            roots.push(self.project_root.clone());
        }
        roots
    }

    /// Dotted module path of an app's migrations package.
    pub fn migrations_module(&self, label: &str) -> Option<String> {
        let app = self.apps.get(label)?;
        if let Some(module) = &app.module {
            return Some(module.clone());
        }
        self.search_roots().iter().find_map(|root| {
            let relative = app.migrations.strip_prefix(root).ok()?;
            let parts: Vec<&str> = relative
                .components()
                .map(|component| component.as_os_str().to_str())
                .collect::<Option<_>>()?;
            (!parts.is_empty()).then(|| parts.join("."))
        })
    }
}

/// `<config-dir>/squasher/squasher.toml` for the current user.
pub fn user_config_path() -> Option<PathBuf> {
    let strategy = etcetera::choose_base_strategy().ok()?;
    Some(strategy.config_dir().join("squasher").join(CONFIG_FILE_NAME))
}

/// Lexically removes `.` and `..` components.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
