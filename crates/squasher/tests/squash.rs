mod common;

use std::fs;

use anyhow::Result;
use common::{CREATE_PERSON, Project, initial_changes, migration_source};
use pretty_assertions::assert_eq;
use squasher::{
    commands::run_squash,
    error::SquashError,
    loader::{DiskLoader, MigrationSource},
    migration::{Dependency, NodeKey},
    operations::Operation,
};

const ADD_AGE: &str = "migrations.AddField(model_name='person', name='age', field=models.IntegerField(default=0))";
const ADD_NAME: &str =
    "migrations.AddField(model_name='person', name='name', field=models.CharField(max_length=50, default=''))";

fn three_node_app(project: &mut Project) -> Result<()> {
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration(
            "app",
            "0002_person_age",
            &migration_source(false, &[("app", "0001_initial")], &[ADD_AGE]),
        )?
        .migration(
            "app",
            "0003_person_name",
            &migration_source(false, &[("app", "0002_person_age")], &[ADD_NAME]),
        )?;
    Ok(())
}

#[test]
fn test_single_app_squashes_to_one_node() -> Result<()> {
    let mut project = Project::new()?;
    three_node_app(&mut project)?;
    let changes = project.changes(&initial_changes(&[("app", &[])]))?;
    let resolver = project.resolver();

    let mut out = Vec::new();
    run_squash(&resolver, &project.squash_options(changes, &[]), &mut out)?;

    assert_eq!(
        String::from_utf8(out)?,
        "Migrations for 'app':\n  app/migrations/0004_squashed.py\n    - Create model Person\n"
    );

    let loader = DiskLoader::load(&project.resolver())?;
    let squashed = &loader.disk_migrations()[&NodeKey::new("app", "0004_squashed")];
    assert_eq!(
        squashed.replaces,
        vec![
            NodeKey::new("app", "0001_initial"),
            NodeKey::new("app", "0002_person_age"),
            NodeKey::new("app", "0003_person_name"),
        ]
    );
    assert!(squashed.dependencies.is_empty());
    assert!(squashed.initial);
    let classes: Vec<&str> = squashed.operations.iter().map(Operation::class_name).collect();
    assert_eq!(classes, vec!["CreateModel"]);
    assert_eq!(
        loader.graph().leaf_nodes("app"),
        vec![NodeKey::new("app", "0004_squashed")]
    );
    Ok(())
}

#[test]
fn test_excluded_app_is_depended_on_at_its_leaf() -> Result<()> {
    let mut project = Project::new()?;
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration(
            "app",
            "0002_person_age",
            &migration_source(false, &[("app", "0001_initial")], &[ADD_AGE]),
        )?
        .migration(
            "app2",
            "0001_initial",
            &migration_source(true, &[("app", "0002_person_age")], &[CREATE_PERSON]),
        )?;
    let app_before = (
        project.files("app")?,
        project.read("app", "0001_initial")?,
        project.read("app", "0002_person_age")?,
    );
    let changes = project.changes(&initial_changes(&[
        ("app", &[]),
        ("app2", &[("app", "0001_initial")]),
    ]))?;
    let resolver = project.resolver();

    let mut out = Vec::new();
    run_squash(&resolver, &project.squash_options(changes, &["app"]), &mut out)?;

    let output = String::from_utf8(out)?;
    assert!(!output.contains("Migrations for 'app':"));
    assert!(output.contains("Migrations for 'app2':\n  app2/migrations/0002_squashed.py\n"));

    let loader = DiskLoader::load(&project.resolver())?;
    let squashed = &loader.disk_migrations()[&NodeKey::new("app2", "0002_squashed")];
    assert_eq!(
        squashed.dependencies,
        vec![Dependency::Node(NodeKey::new("app", "0002_person_age"))]
    );
    assert_eq!(squashed.replaces, vec![NodeKey::new("app2", "0001_initial")]);

    let app_after = (
        project.files("app")?,
        project.read("app", "0001_initial")?,
        project.read("app", "0002_person_age")?,
    );
    assert_eq!(app_before, app_after);
    Ok(())
}

#[test]
fn test_raw_sql_is_lifted_into_constants() -> Result<()> {
    let mut project = Project::new()?;
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration(
            "app",
            "0002_sql",
            &migration_source(
                false,
                &[("app", "0001_initial")],
                &["migrations.RunSQL(sql='SELECT 1', reverse_sql='SELECT 2')"],
            ),
        )?;
    let changes = project.changes(&initial_changes(&[("app", &[])]))?;
    let resolver = project.resolver();

    let mut out = Vec::new();
    run_squash(&resolver, &project.squash_options(changes, &[]), &mut out)?;
    assert!(String::from_utf8(out)?.contains("    - Create model Person\n    - Raw SQL operation\n"));

    let text = project.read("app", "0003_squashed")?;
    assert!(text.contains("\nSQL_1 = \"\"\"SELECT 1\"\"\"\n"));
    assert!(text.contains("\nSQL_1_ROLLBACK = \"\"\"SELECT 2\"\"\"\n"));
    assert!(text.contains("            sql=SQL_1,\n            reverse_sql=SQL_1_ROLLBACK,\n"));
    assert_eq!(text.matches("migrations.RunSQL(").count(), 1);
    Ok(())
}

#[test]
fn test_functions_with_the_same_name_are_renamed() -> Result<()> {
    let mut project = Project::new()?;
    let data = |dependency: &str, body: &str| {
        format!(
            "from django.db import migrations\n\n\ndef same_name(apps, schema_editor):\n    {body}\n\n\nclass Migration(migrations.Migration):\n    dependencies = [('app', '{dependency}')]\n\n    operations = [\n        migrations.RunPython(same_name),\n    ]\n"
        )
    };
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration("app", "0002_first", &data("0001_initial", "return 1"))?
        .migration("app", "0003_second", &data("0002_first", "return 2"))?;
    let changes = project.changes(&initial_changes(&[("app", &[])]))?;
    let resolver = project.resolver();

    let mut out = Vec::new();
    run_squash(&resolver, &project.squash_options(changes, &[]), &mut out)?;

    let text = project.read("app", "0004_squashed")?;
    assert!(text.contains("\ndef same_name(apps, schema_editor):\n    return 1\n"));
    assert!(text.contains("\ndef same_name_2(apps, schema_editor):\n    return 2\n"));
    assert!(text.contains("            code=same_name,\n"));
    assert!(text.contains("            code=same_name_2,\n"));
    assert!(
        text.find("code=same_name,") < text.find("code=same_name_2,"),
        "operations keep the order of the replaced migrations"
    );
    Ok(())
}

#[test]
fn test_elidable_operations_are_dropped() -> Result<()> {
    let mut project = Project::new()?;
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration(
            "app",
            "0002_sql",
            &migration_source(
                false,
                &[("app", "0001_initial")],
                &["migrations.RunSQL(sql='SELECT 1', elidable=True)"],
            ),
        )?;
    let changes = project.changes(&initial_changes(&[("app", &[])]))?;
    let resolver = project.resolver();

    run_squash(&resolver, &project.squash_options(changes, &[]), &mut Vec::new())?;

    let text = project.read("app", "0003_squashed")?;
    assert!(!text.contains("RunSQL"));
    assert!(!text.contains("SQL_1"));
    Ok(())
}

#[test]
fn test_elidable_extensions_are_dropped() -> Result<()> {
    let mut project = Project::new()?;
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration(
            "app",
            "0002_extensions",
            "from django.contrib.postgres.operations import CreateExtension, HStoreExtension\nfrom django.db import migrations\n\n\nclass OptionalExtension(CreateExtension):\n    def __init__(self, name, elidable=False):\n        super().__init__(name)\n        self.elidable = elidable\n\n\nclass Migration(migrations.Migration):\n    dependencies = [('app', '0001_initial')]\n\n    operations = [\n        HStoreExtension(),\n        OptionalExtension('citext', elidable=True),\n    ]\n",
        )?;
    let changes = project.changes(&initial_changes(&[("app", &[])]))?;
    let resolver = project.resolver();

    let mut out = Vec::new();
    run_squash(&resolver, &project.squash_options(changes, &[]), &mut out)?;
    assert!(
        String::from_utf8(out)?
            .ends_with("    - Creates extension hstore\n    - Create model Person\n")
    );

    let text = project.read("app", "0003_squashed")?;
    assert!(text.contains("HStoreExtension("));
    assert!(!text.contains("OptionalExtension"));
    assert!(!text.contains("citext"));
    Ok(())
}

#[test]
fn test_dry_run_writes_nothing() -> Result<()> {
    let mut project = Project::new()?;
    three_node_app(&mut project)?;
    let changes = project.changes(&initial_changes(&[("app", &[])]))?;
    let resolver = project.resolver();
    let files_before = project.files("app")?;

    let mut options = project.squash_options(changes, &[]);
    options.write = project.write_options(true, 3);
    options.squashed_name = Some("compact".to_owned());
    let mut out = Vec::new();
    run_squash(&resolver, &options, &mut out)?;

    let output = String::from_utf8(out)?;
    assert!(output.starts_with(
        "Migrations for 'app':\n  app/migrations/0004_compact.py\n    - Create model Person\nFull migrations file '0004_compact.py':\n"
    ));
    assert!(output.contains("    replaces = [('app', '0001_initial'), ('app', '0002_person_age'), ('app', '0003_person_name')]\n"));
    assert_eq!(project.files("app")?, files_before);
    Ok(())
}

#[test]
fn test_invalid_apps_fail_before_any_work() -> Result<()> {
    let mut project = Project::new()?;
    three_node_app(&mut project)?;
    let resolver = project.resolver();
    let mut options = project.squash_options(project.root().join("missing.json"), &["nope"]);
    options.only = vec!["other".to_owned()];

    let error = run_squash(&resolver, &options, &mut Vec::new())
        .expect_err("unknown apps are rejected");
    assert!(matches!(
        error.downcast_ref::<SquashError>(),
        Some(SquashError::InvalidApps(apps)) if apps == &["nope".to_owned(), "other".to_owned()]
    ));
    Ok(())
}

#[test]
fn test_app_without_models_is_replaced_by_an_empty_node() -> Result<()> {
    let mut project = Project::new()?;
    three_node_app(&mut project)?;
    let changes = project.changes("{\"apps_with_models\": [], \"changes\": {}}")?;
    let resolver = project.resolver();

    run_squash(&resolver, &project.squash_options(changes, &[]), &mut Vec::new())?;

    let loader = DiskLoader::load(&project.resolver())?;
    let squashed = &loader.disk_migrations()[&NodeKey::new("app", "0004_squashed")];
    assert!(squashed.operations.is_empty());
    assert_eq!(squashed.replaces.len(), 3);
    Ok(())
}

#[test]
fn test_second_squash_without_drift_is_a_no_op() -> Result<()> {
    let mut project = Project::new()?;
    three_node_app(&mut project)?;
    let changes = project.changes(&initial_changes(&[("app", &[])]))?;
    run_squash(
        &project.resolver(),
        &project.squash_options(changes, &[]),
        &mut Vec::new(),
    )?;

    let empty_diff = project.changes("{\"apps_with_models\": [\"app\"], \"changes\": {}}")?;
    let before = fs::read_to_string(project.migrations_dir("app").join("0004_squashed.py"))?;
    let result = run_squash(
        &project.resolver(),
        &project.squash_options(empty_diff, &[]),
        &mut Vec::new(),
    );
    assert!(matches!(
        result.as_ref().map_err(|error| error.downcast_ref::<SquashError>()),
        Err(Some(SquashError::NothingToSquash))
    ));
    assert_eq!(
        fs::read_to_string(project.migrations_dir("app").join("0004_squashed.py"))?,
        before
    );
    Ok(())
}
