mod common;

use anyhow::Result;
use common::{CREATE_PERSON, Project, initial_changes, migration_source};
use pretty_assertions::assert_eq;
use squasher::{commands::run_circular, error::SquashError};

#[test]
fn test_migration_cycles_are_reported() -> Result<()> {
    let mut project = Project::new()?;
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration(
            "app",
            "0002_auto",
            &migration_source(false, &[("app", "0001_initial"), ("app2", "0001_initial")], &[]),
        )?
        .migration(
            "app2",
            "0001_initial",
            &migration_source(true, &[("app", "0002_auto")], &[CREATE_PERSON]),
        )?;

    let mut out = Vec::new();
    let error = run_circular(&project.resolver(), None, &mut out).expect_err("a cycle is an error");
    assert!(matches!(
        error.downcast_ref::<SquashError>(),
        Some(SquashError::CircularDependencies(1))
    ));
    assert_eq!(
        String::from_utf8(out)?,
        "Circular migration dependencies:\n  app.0002_auto, app2.0001_initial\n"
    );
    Ok(())
}

#[test]
fn test_proposed_app_cycles_are_reported() -> Result<()> {
    let mut project = Project::new()?;
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration("app2", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?;
    let changes = project.changes(&initial_changes(&[
        ("app", &[("app2", "0001_initial")]),
        ("app2", &[("app", "0001_initial")]),
    ]))?;

    let mut out = Vec::new();
    let error = run_circular(&project.resolver(), Some(changes.as_path()), &mut out)
        .expect_err("a cycle is an error");
    assert!(matches!(
        error.downcast_ref::<SquashError>(),
        Some(SquashError::CircularDependencies(1))
    ));
    assert_eq!(
        String::from_utf8(out)?,
        "Circular app dependencies in the proposed migrations: app, app2\n  * app.0001_initial depends on ('app2', '0001_initial')\n  * app2.0001_initial depends on ('app', '0001_initial')\n"
    );
    Ok(())
}

#[test]
fn test_acyclic_history() -> Result<()> {
    let mut project = Project::new()?;
    project
        .migration("app", "0001_initial", &migration_source(true, &[], &[CREATE_PERSON]))?
        .migration(
            "app2",
            "0001_initial",
            &migration_source(true, &[("app", "0001_initial")], &[CREATE_PERSON]),
        )?;
    let changes = project.changes(&initial_changes(&[
        ("app", &[]),
        ("app2", &[("app", "0001_initial")]),
    ]))?;

    let mut out = Vec::new();
    run_circular(&project.resolver(), Some(changes.as_path()), &mut out)?;
    assert_eq!(String::from_utf8(out)?, "No circular dependencies found.\n");
    Ok(())
}
