use std::{
    cell::RefCell,
    path::{Path, PathBuf},
};

use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};
use ruff_python_stdlib::sys;

use crate::config::Config;

/// Check if a module is part of the Python standard library using ruff_python_stdlib
fn is_stdlib_module(module_name: &str, python_version: u8) -> bool {
    if sys::is_known_standard_library(python_version, module_name) {
        return true;
    }

    // Submodules of a stdlib package
    module_name
        .split('.')
        .next()
        .is_some_and(|top_level| sys::is_known_standard_library(python_version, top_level))
}

/// Where a module lives, which decides whether its code may be rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleLocation {
    /// Inside the project's own source tree.
    Project(PathBuf),
    /// Installed into a virtual environment.
    SitePackages(PathBuf),
    StandardLibrary,
    Unresolved,
}

impl ModuleLocation {
    /// Code outside the project is referenced, never copied or rewritten.
    pub fn is_read_only(&self) -> bool {
        !matches!(self, Self::Project(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Project(path) | Self::SitePackages(path) => Some(path),
            Self::StandardLibrary | Self::Unresolved => None,
        }
    }
}

/// Module descriptor for module resolution
#[derive(Debug)]
struct ModuleDescriptor {
    /// Module name parts (e.g., ["foo", "bar"] for "foo.bar")
    name_parts: Vec<String>,
}

impl ModuleDescriptor {
    fn from_module_name(name: &str) -> Self {
        let name_parts = name
            .split('.')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Self { name_parts }
    }
}

/// Locates Python modules on disk without importing them.
#[derive(Debug)]
pub struct ModuleResolver {
    config: Config,
    /// Cache of module classifications
    location_cache: RefCell<IndexMap<String, ModuleLocation>>,
    /// Site-packages directories of the detected virtual environments
    site_packages_cache: RefCell<Option<Vec<PathBuf>>>,
}

impl ModuleResolver {
    /// Canonicalize a path, handling errors gracefully
    fn canonicalize_path(path: PathBuf) -> PathBuf {
        match path.canonicalize() {
            Ok(canonical) => canonical,
            Err(e) => {
                // Log warning but don't fail - return the original path
                warn!("Failed to canonicalize path {}: {}", path.display(), e);
                path
            }
        }
    }

    pub fn new(config: Config) -> Self {
        Self {
            config,
            location_cache: RefCell::new(IndexMap::new()),
            site_packages_cache: RefCell::new(None),
        }
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Project directories searched for modules, deduplicated and
    /// canonicalized.
    pub fn get_search_directories(&self) -> Vec<PathBuf> {
        let mut unique_dirs = IndexSet::new();
        for dir in self.config.search_roots() {
            if let Ok(canonical) = dir.canonicalize() {
                unique_dirs.insert(canonical);
            } else {
                unique_dirs.insert(dir);
            }
        }
        unique_dirs.into_iter().collect()
    }

    /// Classifies a dotted module path, caching the answer.
    pub fn locate(&self, module_name: &str) -> ModuleLocation {
        if let Some(cached) = self.location_cache.borrow().get(module_name) {
            return cached.clone();
        }
        let location = self.compute_location(module_name);
        debug!("Module {module_name} located at {location:?}");
        self.location_cache
            .borrow_mut()
            .insert(module_name.to_owned(), location.clone());
        location
    }

    fn compute_location(&self, module_name: &str) -> ModuleLocation {
        let descriptor = ModuleDescriptor::from_module_name(module_name);
        let site_packages = self.site_packages_directories();

        for search_dir in self.get_search_directories() {
            if let Some(path) = Self::resolve_in_directory(&search_dir, &descriptor) {
                // A virtualenv living inside the project is still not project code
                if site_packages.iter().any(|dir| path.starts_with(dir)) {
                    return ModuleLocation::SitePackages(path);
                }
                return ModuleLocation::Project(path);
            }
        }

        if is_stdlib_module(module_name, self.config.python_version) {
            return ModuleLocation::StandardLibrary;
        }

        for dir in &site_packages {
            if let Some(path) = Self::resolve_in_directory(dir, &descriptor) {
                return ModuleLocation::SitePackages(path);
            }
        }

        ModuleLocation::Unresolved
    }

    /// Resolve a module to its file path
    pub fn resolve_module_path(&self, module_name: &str) -> Option<PathBuf> {
        self.locate(module_name).path().map(Path::to_path_buf)
    }

    /// Whether code in `module_name` must be referenced rather than copied.
    pub fn is_read_only(&self, module_name: &str) -> bool {
        self.locate(module_name).is_read_only()
    }

    /// Whether a path belongs to the project rather than an environment.
    pub fn is_project_path(&self, path: &Path) -> bool {
        let path = Self::canonicalize_path(path.to_path_buf());
        let root = Self::canonicalize_path(self.config.project_root.clone());
        path.starts_with(&root)
            && !self
                .site_packages_directories()
                .iter()
                .any(|dir| path.starts_with(dir))
    }

    /// Splits `package.module.Class.attr` into the longest importable module
    /// prefix and the qualified name inside it.
    ///
    /// When no prefix can be located the first capitalized segment is taken
    /// as the start of the qualified name, falling back to the last segment.
    pub fn split_module_path(&self, full_name: &str) -> (String, String) {
        let parts: Vec<&str> = full_name.split('.').collect();
        for split in (1..parts.len()).rev() {
            let module = parts[..split].join(".");
            if !matches!(self.locate(&module), ModuleLocation::Unresolved) {
                return (module, parts[split..].join("."));
            }
        }

        let split = parts
            .iter()
            .position(|part| part.starts_with(|c: char| c.is_ascii_uppercase()))
            .filter(|&index| index > 0)
            .unwrap_or(parts.len().saturating_sub(1));
        (parts[..split].join("."), parts[split..].join("."))
    }

    /// Resolve a module within a specific directory
    ///
    /// For the last part, check in order: package (`foo/__init__.py`), module
    /// file (`foo.py`), namespace package (`foo/`).
    fn resolve_in_directory(root: &Path, descriptor: &ModuleDescriptor) -> Option<PathBuf> {
        let (last, parents) = descriptor.name_parts.split_last()?;

        let mut current_path = root.to_path_buf();
        for part in parents {
            // Intermediate parts must be packages, regular or namespace
            let package_dir = current_path.join(part);
            if !package_dir.is_dir() {
                return None;
            }
            current_path = package_dir;
        }

        let package_init = current_path.join(last).join("__init__.py");
        if package_init.is_file() {
            return Some(Self::canonicalize_path(package_init));
        }

        let module_file = current_path.join(format!("{last}.py"));
        if module_file.is_file() {
            return Some(Self::canonicalize_path(module_file));
        }

        let namespace_dir = current_path.join(last);
        if namespace_dir.is_dir() {
            return Some(Self::canonicalize_path(namespace_dir));
        }

        None
    }

    /// Site-packages directories of the configured or detected virtual
    /// environments.
    pub fn site_packages_directories(&self) -> Vec<PathBuf> {
        if let Ok(cache_ref) = self.site_packages_cache.try_borrow()
            && let Some(cached) = cache_ref.as_ref()
        {
            return cached.clone();
        }

        let virtualenv_paths = if let Some(configured) = &self.config.virtualenv {
            vec![configured.clone()]
        } else if let Ok(explicit) = std::env::var("VIRTUAL_ENV") {
            vec![PathBuf::from(explicit)]
        } else {
            self.detect_fallback_virtualenv_paths()
        };

        let directories: Vec<PathBuf> = virtualenv_paths
            .iter()
            .flat_map(|venv_path| Self::get_virtualenv_site_packages_directories(venv_path))
            .map(Self::canonicalize_path)
            .collect();

        if let Ok(mut cache_ref) = self.site_packages_cache.try_borrow_mut() {
            *cache_ref = Some(directories.clone());
        }
        directories
    }

    /// Detect common virtual environment directory names
    fn detect_fallback_virtualenv_paths(&self) -> Vec<PathBuf> {
        let common_venv_names = [".venv", "venv", "env", ".virtualenv", "virtualenv"];
        let mut venv_paths = Vec::new();

        for venv_name in &common_venv_names {
            let venv_path = self.config.project_root.join(venv_name);
            if venv_path.is_dir() {
                // Check if it looks like a virtual environment
                let has_bin = venv_path.join("bin").is_dir() || venv_path.join("Scripts").is_dir();
                let has_lib = venv_path.join("lib").is_dir();

                if has_bin || has_lib {
                    venv_paths.push(venv_path);
                }
            }
        }

        venv_paths
    }

    /// Get site-packages directories for a virtual environment
    fn get_virtualenv_site_packages_directories(venv_path: &Path) -> Vec<PathBuf> {
        let mut site_packages_dirs = Vec::new();

        // Unix-style virtual environment
        let lib_dir = venv_path.join("lib");
        if lib_dir.is_dir()
            && let Ok(entries) = std::fs::read_dir(&lib_dir)
        {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    let site_packages = path.join("site-packages");
                    if site_packages.is_dir() {
                        site_packages_dirs.push(site_packages);
                    }
                }
            }
        }

        // Windows-style virtual environment
        let lib_site_packages = venv_path.join("Lib").join("site-packages");
        if lib_site_packages.is_dir() {
            site_packages_dirs.push(lib_site_packages);
        }

        site_packages_dirs
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    /// Sets `VIRTUAL_ENV` for the life of the guard.
    #[must_use = "the variable is restored when the guard is dropped"]
    struct VirtualEnvGuard {
        original_value: Option<String>,
    }

    impl VirtualEnvGuard {
        fn new(new_value: &str) -> Self {
            let original_value = std::env::var("VIRTUAL_ENV").ok();
            // SAFETY: tests touching the environment run under `#[serial]`.
            unsafe {
                std::env::set_var("VIRTUAL_ENV", new_value);
            }
            Self { original_value }
        }
    }

    impl Drop for VirtualEnvGuard {
        fn drop(&mut self) {
            // SAFETY: see `new`
            unsafe {
                match self.original_value.take() {
                    Some(original) => std::env::set_var("VIRTUAL_ENV", original),
                    None => std::env::remove_var("VIRTUAL_ENV"),
                }
            }
        }
    }

    fn create_test_file(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn resolver_for(root: &Path) -> ModuleResolver {
        ModuleResolver::new(Config {
            project_root: root.to_path_buf(),
            virtualenv: Some(root.join(".venv")),
            ..Config::default()
        })
    }

    #[test]
    fn test_package_preferred_over_module() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        create_test_file(&root.join("foo/__init__.py"), "# Package")?;
        create_test_file(&root.join("foo.py"), "# Module")?;

        let resolver = resolver_for(root);
        let expected = root.join("foo/__init__.py").canonicalize()?;
        assert_eq!(resolver.resolve_module_path("foo"), Some(expected));
        Ok(())
    }

    #[test]
    fn test_project_and_site_packages_locations() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        create_test_file(&root.join("app/migrations/0001_initial.py"), "")?;
        create_test_file(
            &root.join(".venv/lib/python3.12/site-packages/django/db/migrations/__init__.py"),
            "",
        )?;

        let resolver = resolver_for(root);
        assert!(matches!(
            resolver.locate("app.migrations.0001_initial"),
            ModuleLocation::Project(_)
        ));
        assert!(matches!(
            resolver.locate("django.db.migrations"),
            ModuleLocation::SitePackages(_)
        ));
        assert_eq!(resolver.locate("itertools"), ModuleLocation::StandardLibrary);
        assert_eq!(resolver.locate("nowhere.to.be.found"), ModuleLocation::Unresolved);
        assert!(resolver.is_read_only("django.db.migrations"));
        assert!(!resolver.is_read_only("app.migrations.0001_initial"));
        Ok(())
    }

    #[test]
    fn test_split_module_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        create_test_file(&root.join("app/operations.py"), "")?;

        let resolver = resolver_for(root);
        assert_eq!(
            resolver.split_module_path("app.operations.IncrementNumbers"),
            ("app.operations".to_owned(), "IncrementNumbers".to_owned())
        );
        assert_eq!(
            resolver.split_module_path("thirdparty.utils.Helper.run"),
            ("thirdparty.utils".to_owned(), "Helper.run".to_owned())
        );
        assert_eq!(
            resolver.split_module_path("thirdparty.utils.run"),
            ("thirdparty.utils".to_owned(), "run".to_owned())
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn test_virtual_env_variable_is_searched() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let venv = root.join("elsewhere");
        create_test_file(&venv.join("lib/python3.11/site-packages/vendored.py"), "")?;

        let _guard = VirtualEnvGuard::new(&venv.to_string_lossy());
        let resolver = ModuleResolver::new(Config {
            project_root: root.join("project"),
            ..Config::default()
        });
        assert!(matches!(
            resolver.locate("vendored"),
            ModuleLocation::SitePackages(_)
        ));
        Ok(())
    }
}
