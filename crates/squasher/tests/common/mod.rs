#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use squasher::{
    commands::{SquashOptions, WriteOptions},
    config::{AppConfig, Config},
    resolver::ModuleResolver,
};
use tempfile::TempDir;

pub const MIGRATION_HEADER: &str = "from django.db import migrations, models\n\n\n";

/// A throwaway project with one migrations package per app.
pub struct Project {
    pub dir: TempDir,
    apps: Vec<String>,
}

impl Project {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
            apps: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn migrations_dir(&self, app: &str) -> PathBuf {
        self.root().join(app).join("migrations")
    }

    /// Writes `app/migrations/<name>.py`, registering the app on first use.
    pub fn migration(&mut self, app: &str, name: &str, source: &str) -> Result<&mut Self> {
        let directory = self.migrations_dir(app);
        if !self.apps.iter().any(|known| known == app) {
            fs::create_dir_all(&directory)?;
            fs::write(self.root().join(app).join("__init__.py"), "")?;
            fs::write(directory.join("__init__.py"), "")?;
            self.apps.push(app.to_owned());
        }
        fs::write(directory.join(format!("{name}.py")), source)?;
        Ok(self)
    }

    pub fn changes(&self, json: &str) -> Result<PathBuf> {
        let path = self.root().join("changes.json");
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn resolver(&self) -> ModuleResolver {
        let mut config = Config {
            project_root: self.root().to_path_buf(),
            virtualenv: Some(self.root().join(".venv")),
            ..Config::default()
        };
        for app in &self.apps {
            config.apps.insert(
                app.clone(),
                AppConfig {
                    migrations: self.migrations_dir(app),
                    module: None,
                },
            );
        }
        ModuleResolver::new(config)
    }

    pub fn write_options(&self, dry_run: bool, verbosity: u8) -> WriteOptions {
        WriteOptions {
            dry_run,
            verbosity,
            include_header: false,
            base_dir: self.root().to_path_buf(),
        }
    }

    pub fn squash_options(&self, changes: PathBuf, ignore_apps: &[&str]) -> SquashOptions {
        SquashOptions {
            changes,
            only: Vec::new(),
            ignore_apps: ignore_apps.iter().map(|app| (*app).to_owned()).collect(),
            squashed_name: None,
            write: self.write_options(false, 0),
        }
    }

    /// Sorted file names in an app's migrations directory.
    pub fn files(&self, app: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.migrations_dir(app))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn read(&self, app: &str, name: &str) -> Result<String> {
        Ok(fs::read_to_string(self.migrations_dir(app).join(format!("{name}.py")))?)
    }
}

/// A migration module with the given dependency tuples and operations.
pub fn migration_source(initial: bool, dependencies: &[(&str, &str)], operations: &[&str]) -> String {
    let mut source = MIGRATION_HEADER.to_owned();
    source.push_str("class Migration(migrations.Migration):\n");
    if initial {
        source.push_str("    initial = True\n\n");
    }
    source.push_str("    dependencies = [\n");
    for (app, name) in dependencies {
        source.push_str(&format!("        ('{app}', '{name}'),\n"));
    }
    source.push_str("    ]\n\n    operations = [\n");
    for operation in operations {
        source.push_str(&format!("        {operation},\n"));
    }
    source.push_str("    ]\n");
    source
}

pub const CREATE_PERSON: &str =
    "migrations.CreateModel(name='Person', fields=[('id', models.AutoField(primary_key=True))])";

/// A changes document proposing one initial node per app, each creating
/// `Person` and depending on the given pairs.
pub fn initial_changes(apps: &[(&str, &[(&str, &str)])]) -> String {
    let mut changes = Vec::new();
    for (app, dependencies) in apps {
        let dependencies: Vec<String> = dependencies
            .iter()
            .map(|(dep_app, name)| format!("[\"{dep_app}\", \"{name}\"]"))
            .collect();
        changes.push(format!(
            "\"{app}\": [{{\"name\": \"0001_initial\", \"initial\": true, \"dependencies\": [{}], \"imports\": [\"from django.db import migrations, models\"], \"operations\": [\"{CREATE_PERSON}\"]}}]",
            dependencies.join(", ")
        ));
    }
    let apps_with_models: Vec<String> = apps.iter().map(|(app, _)| format!("\"{app}\"")).collect();
    format!(
        "{{\"apps_with_models\": [{}], \"changes\": {{{}}}}}",
        apps_with_models.join(", "),
        changes.join(", ")
    )
}
