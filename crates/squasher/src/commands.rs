//! The `squash` and `delete-squashed` commands.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::{Context, Result};
use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use rustc_hash::FxHashSet;

use crate::{
    autodetector::{SquashAutodetector, SquashedHistory},
    changes_file::{ChangeDetector, ChangesFile},
    circular::app_cycles,
    error::SquashError,
    loader::{AppInfo, DiskLoader, MigrationSource, SquashMigrationLoader},
    migration::HistoryNode,
    resolver::ModuleResolver,
    source_utils::file_hash,
    unique_names::TemplateRenamePolicy,
    writer::MigrationWriter,
};

const WRITER_MODULE: &str = "django.db.migrations.writer";

/// How squashed nodes are reported and written.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub dry_run: bool,
    pub verbosity: u8,
    pub include_header: bool,
    /// Paths below this directory are shown relative to it.
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SquashOptions {
    /// Exported diff of the current models.
    pub changes: PathBuf,
    /// Apps to squash; every other app is ignored when non-empty.
    pub only: Vec<String>,
    pub ignore_apps: Vec<String>,
    pub squashed_name: Option<String>,
    pub write: WriteOptions,
}

/// Squashes every selected app and writes the result.
pub fn run_squash(
    resolver: &ModuleResolver,
    options: &SquashOptions,
    out: &mut dyn Write,
) -> Result<()> {
    let config = resolver.config();
    check_writer_fingerprint(resolver);

    let mut ignore_apps = config.ignore_apps.clone();
    ignore_apps.extend(options.ignore_apps.iter().cloned());
    let ignore_apps = select_apps(config.apps.keys(), &options.only, &ignore_apps)?;
    debug!("Ignoring apps: {ignore_apps:?}");

    let real = DiskLoader::load(resolver)?;
    let squash_view = SquashMigrationLoader::new(&real);
    let detector = ChangesFile::load(&options.changes, resolver)?;

    let mut settings = detector.settings().clone();
    settings.extend(config.settings.clone());
    let mut autodetector = SquashAutodetector::new(settings);
    if let Some(template) = &config.rename_template {
        autodetector = autodetector.with_policy(Rc::new(TemplateRenamePolicy::new(template)));
    }

    let squashed_name = options
        .squashed_name
        .as_deref()
        .unwrap_or(&config.migration_name);
    let squashed = autodetector.squash(
        &real,
        &squash_view,
        &detector,
        &ignore_apps,
        Some(squashed_name),
    )?;
    write_migration_files(&squashed, real.apps(), &options.write, out)
}

/// Retires migrations superseded by earlier squashes.
///
/// With `app_labels`, only those apps are cleaned up.
pub fn run_delete_squashed(
    resolver: &ModuleResolver,
    app_labels: &[String],
    exclude_apps: &[String],
    options: &WriteOptions,
    out: &mut dyn Write,
) -> Result<()> {
    let config = resolver.config();
    let ignore_apps = select_apps(config.apps.keys(), app_labels, exclude_apps)?;

    let real = DiskLoader::load(resolver)?;
    let edits = SquashAutodetector::new(config.settings.clone())
        .delete_old_squashed(&real, &ignore_apps)?;
    if edits.is_empty() {
        writeln!(out, "No squashed migrations to clean up.")?;
        return Ok(());
    }
    write_migration_files(&edits, real.apps(), options, out)
}

/// Reports migrations that depend on each other on disk and, given a
/// changes file, apps whose proposed migrations would depend on each other.
///
/// Finding any cycle is an error.
pub fn run_circular(
    resolver: &ModuleResolver,
    changes: Option<&Path>,
    out: &mut dyn Write,
) -> Result<()> {
    let config = resolver.config();
    let real = DiskLoader::load(resolver)?;

    let migration_cycles = real.graph().cycles();
    if !migration_cycles.is_empty() {
        writeln!(out, "Circular migration dependencies:")?;
        for cycle in &migration_cycles {
            let keys: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            writeln!(out, "  {}", keys.join(", "))?;
        }
    }

    let mut found = migration_cycles.len();
    if let Some(path) = changes {
        let squash_view = SquashMigrationLoader::new(&real);
        let detector = ChangesFile::load(path, resolver)?;
        let proposed = detector.changes(squash_view.graph(), &config.ignore_apps)?;
        for cycle in app_cycles(&proposed) {
            found += 1;
            writeln!(
                out,
                "Circular app dependencies in the proposed migrations: {}",
                cycle.apps.join(", ")
            )?;
            for dependency in &cycle.dependencies {
                writeln!(out, "  * {} depends on {}", dependency.from, dependency.to)?;
            }
        }
    }

    if found == 0 {
        writeln!(out, "No circular dependencies found.")?;
        return Ok(());
    }
    Err(SquashError::CircularDependencies(found).into())
}

/// Validates app labels and returns the apps to leave alone.
///
/// Every label in `only` or `ignore` must name a known app, and no label
/// may be in both. A non-empty `only` ignores every app it does not name.
pub fn select_apps<'a>(
    known: impl IntoIterator<Item = &'a String>,
    only: &[String],
    ignore: &[String],
) -> Result<Vec<String>, SquashError> {
    let known: Vec<&String> = known.into_iter().collect();
    let is_known = |label: &String| known.contains(&label);

    let mut invalid: Vec<String> = Vec::new();
    for label in ignore.iter().chain(only) {
        if !is_known(label) && !invalid.contains(label) {
            invalid.push(label.clone());
        }
    }
    if !invalid.is_empty() {
        return Err(SquashError::InvalidApps(invalid));
    }

    let conflicting: Vec<String> = only
        .iter()
        .filter(|label| ignore.contains(label))
        .cloned()
        .collect::<IndexSet<_>>()
        .into_iter()
        .collect();
    if !conflicting.is_empty() {
        return Err(SquashError::ConflictingApps(conflicting));
    }

    let mut ignored: IndexSet<String> = ignore.iter().cloned().collect();
    if !only.is_empty() {
        ignored.extend(
            known
                .iter()
                .filter(|label| !only.contains(label))
                .map(|label| (*label).clone()),
        );
    }
    Ok(ignored.into_iter().collect())
}

/// Reports and writes every node, app by app.
pub fn write_migration_files(
    changes: &SquashedHistory,
    apps: &IndexMap<String, AppInfo>,
    options: &WriteOptions,
    out: &mut dyn Write,
) -> Result<()> {
    let mut prepared: FxHashSet<&str> = FxHashSet::default();
    for (app_label, nodes) in changes {
        let Some(app) = apps.get(app_label) else {
            return Err(SquashError::Internal(format!("no migrations directory for app `{app_label}`")).into());
        };
        writeln!(out, "Migrations for '{app_label}':")?;
        for node in nodes {
            let writer = MigrationWriter::new(node, &app.path, options.include_header);
            let path = writer.path();
            writeln!(out, "  {}", display_path(&path, &options.base_dir).display())?;
            for line in describe(node) {
                writeln!(out, "    - {line}")?;
            }

            if options.dry_run {
                if options.verbosity >= 3
                    && let Some(text) = writer.as_string()?
                {
                    writeln!(out, "Full migrations file '{}':", writer.filename())?;
                    writeln!(out, "{text}")?;
                }
                continue;
            }

            if prepared.insert(app_label.as_str()) {
                prepare_directory(&app.path)?;
            }
            match writer.as_string()? {
                Some(text) => {
                    fs::write(&path, text)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!("Wrote {}", path.display());
                }
                None => {
                    fs::remove_file(&path)
                        .with_context(|| format!("Failed to delete {}", path.display()))?;
                    info!("Deleted {}", path.display());
                }
            }
        }
    }
    Ok(())
}

fn describe(node: &HistoryNode) -> Vec<String> {
    if node.is_migration_level() {
        node.describe()
    } else {
        node.operations.iter().map(|operation| operation.describe()).collect()
    }
}

/// Creates the migrations package if needed.
fn prepare_directory(directory: &Path) -> Result<()> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create {}", directory.display()))?;
    let init = directory.join("__init__.py");
    if !init.is_file() {
        fs::write(&init, "").with_context(|| format!("Failed to create {}", init.display()))?;
    }
    Ok(())
}

/// `path` relative to `base` when it lies below it.
fn display_path(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base)
        .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
}

/// Warns when the framework's migration writer is not a known version:
/// generated modules follow its layout.
fn check_writer_fingerprint(resolver: &ModuleResolver) {
    let fingerprints = &resolver.config().writer_fingerprints;
    if fingerprints.is_empty() {
        return;
    }
    let location = resolver.locate(WRITER_MODULE);
    let Some(path) = location.path() else {
        debug!("{WRITER_MODULE} not found ({location:?}), skipping the version check");
        return;
    };
    match file_hash(path) {
        Ok(digest) if fingerprints.contains(&digest) => {
            debug!("{WRITER_MODULE} matches a known fingerprint");
        }
        Ok(digest) => warn!(
            "{} has fingerprint {digest}, which is not a known version; generated migrations may not match it",
            path.display()
        ),
        Err(error) => warn!("Failed to read {}: {error}", path.display()),
    }
}
