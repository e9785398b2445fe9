//! Helpers that read and rewrite Python source without executing it.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use regex::{Captures, Regex};
use ruff_python_ast::{Expr, ModModule, Stmt, StmtClassDef};
use ruff_python_parser::parse_module;
use ruff_python_trivia::textwrap::dedent;
use ruff_text_size::{Ranged, TextRange, TextSize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SquashError};

const BLOCK_SIZE: usize = 65536;

/// SHA-256 hex digest of a file's contents.
pub fn file_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Import statements declared at the top level of a module, one `import`
/// line per alias and one `from` line per statement. `__future__` imports
/// are dropped.
pub fn collect_imports(module: &ModModule) -> Vec<String> {
    let mut imports = Vec::new();
    for stmt in &module.body {
        match stmt {
            Stmt::Import(import) => {
                for alias in &import.names {
                    match &alias.asname {
                        Some(asname) => imports.push(format!("import {} as {asname}", alias.name)),
                        None => imports.push(format!("import {}", alias.name)),
                    }
                }
            }
            Stmt::ImportFrom(import_from) => {
                let module_name = import_from
                    .module
                    .as_ref()
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                if module_name == "__future__" {
                    continue;
                }
                let names = import_from
                    .names
                    .iter()
                    .map(|alias| match &alias.asname {
                        Some(asname) => format!("{} as {asname}", alias.name),
                        None => alias.name.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let dots = ".".repeat(import_from.level as usize);
                imports.push(format!("from {dots}{module_name} import {names}"));
            }
            _ => {}
        }
    }
    imports
}

/// Turns an arbitrary qualified name into something usable as a top-level
/// function name.
pub fn normalize_function_name(name: &str) -> String {
    let (_, function_name) = name.rsplit_once('.').unwrap_or(("", name));
    let mut normalized: String = function_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if normalized.is_empty() {
        normalized.push('_');
    }
    if normalized.starts_with(|c: char| c.is_ascii_digit()) {
        // Functions cannot start with a number
        normalized.insert_str(0, "f_");
    }
    normalized
}

/// Start of the line containing `offset`.
fn line_start(source: &str, offset: TextSize) -> usize {
    let offset = offset.to_usize();
    source[..offset].rfind('\n').map_or(0, |index| index + 1)
}

/// Source of a definition statement, dedented and newline terminated.
///
/// `from` selects where the copied text starts, which lets callers drop
/// decorators by passing the position of the definition's name.
pub fn definition_source(source: &str, definition: TextRange, from: TextSize) -> String {
    let start = line_start(source, from.min(definition.start()));
    let end = definition.end().to_usize();
    let mut text = dedent(&source[start..end]).into_owned();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Rewrites the first `def <original>` header to `def <new>`, leaving the
/// body untouched.
pub fn rename_function_header(source: &str, original: &str, new: &str) -> String {
    if original == new {
        return source.to_owned();
    }
    let pattern = format!(r"(def\s+){}\b", regex::escape(original));
    match Regex::new(&pattern) {
        Ok(header) => header
            .replacen(source, 1, |caps: &Captures<'_>| format!("{}{new}", &caps[1]))
            .into_owned(),
        Err(_) => source.to_owned(),
    }
}

pub(crate) fn find_migration_class(module: &ModModule) -> Option<&StmtClassDef> {
    module.body.iter().find_map(|stmt| match stmt {
        Stmt::ClassDef(class_def) if class_def.name.as_str() == "Migration" => Some(class_def),
        _ => None,
    })
}

/// Replaces every `attr = ...` statement in the body of `class Migration`
/// with `attr = <value>`, leaving the rest of the file byte for byte.
///
/// Returns `None` when the file has no migration class or the class never
/// assigns `attr`.
pub fn replace_migration_attribute(
    path: &Path,
    source: &str,
    attr: &str,
    value: &str,
) -> Result<Option<String>> {
    let parsed = parse_module(source).map_err(|error| SquashError::Parse {
        path: path.to_path_buf(),
        message: error.to_string(),
    })?;
    let Some(migration) = find_migration_class(parsed.syntax()) else {
        return Ok(None);
    };

    let mut ranges: Vec<TextRange> = migration
        .body
        .iter()
        .filter_map(|stmt| match stmt {
            Stmt::Assign(assign) => assign
                .targets
                .iter()
                .any(|target| matches!(target, Expr::Name(name) if name.id.as_str() == attr))
                .then(|| assign.range()),
            Stmt::AnnAssign(assign) => matches!(
                assign.target.as_ref(),
                Expr::Name(name) if name.id.as_str() == attr
            )
            .then(|| assign.range()),
            _ => None,
        })
        .collect();
    if ranges.is_empty() {
        return Ok(None);
    }

    ranges.sort_by_key(|range| std::cmp::Reverse(range.start()));
    let mut output = source.to_owned();
    for range in ranges {
        output.replace_range(
            range.start().to_usize()..range.end().to_usize(),
            &format!("{attr} = {value}"),
        );
    }
    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const SQUASHED: &str = r#"from django.db import migrations, models


class Migration(migrations.Migration):

    replaces = [
        ('app', '0001_initial'),
        ('app', '0002_person_age'),
    ]  # trailing comment

    initial = True

    dependencies = [
        ('app2', '0001_initial'),
    ]

    operations = []
"#;

    #[test]
    fn test_replace_multiline_attribute() -> Result<()> {
        let path = PathBuf::from("0003_squashed.py");
        let output = replace_migration_attribute(&path, SQUASHED, "replaces", "[]")?
            .expect("replaces should be rewritten");

        let expected = r#"from django.db import migrations, models


class Migration(migrations.Migration):

    replaces = []  # trailing comment

    initial = True

    dependencies = [
        ('app2', '0001_initial'),
    ]

    operations = []
"#;
        assert_eq!(output, expected);
        Ok(())
    }

    #[test]
    fn test_replace_missing_attribute() -> Result<()> {
        let path = PathBuf::from("0003_squashed.py");
        assert_eq!(
            replace_migration_attribute(&path, SQUASHED, "run_before", "[]")?,
            None
        );
        assert_eq!(
            replace_migration_attribute(&path, "x = 1\n", "replaces", "[]")?,
            None
        );
        Ok(())
    }

    #[test]
    fn test_replace_ignores_module_level_assignments() -> Result<()> {
        let source = "dependencies = [1]\n\n\nclass Migration:\n    dependencies = [2]\n";
        let path = PathBuf::from("0001_initial.py");
        let output = replace_migration_attribute(&path, source, "dependencies", "[]")?;
        assert_eq!(
            output.as_deref(),
            Some("dependencies = [1]\n\n\nclass Migration:\n    dependencies = []\n")
        );
        Ok(())
    }

    #[test]
    fn test_collect_imports() {
        let source = r"from __future__ import annotations
import itertools
import numpy as np, os
from random import randrange
from . import utils


def f():
    import inner
";
        let parsed = parse_module(source).expect("valid source");
        assert_eq!(
            collect_imports(parsed.syntax()),
            vec![
                "import itertools",
                "import numpy as np",
                "import os",
                "from random import randrange",
                "from . import utils",
            ]
        );
    }

    #[test]
    fn test_rename_function_header_first_occurrence_only() {
        let source = "def same_name(apps, schema_editor):\n    # def same_name\n    return same_name\n";
        assert_eq!(
            rename_function_header(source, "same_name", "same_name_2"),
            "def same_name_2(apps, schema_editor):\n    # def same_name\n    return same_name\n"
        );
    }

    #[test]
    fn test_rename_function_header_requires_whole_word() {
        let source = "def same_name_other():\n    pass\n";
        assert_eq!(rename_function_header(source, "same_name", "x"), source);
    }

    #[test]
    fn test_normalize_function_name() {
        assert_eq!(normalize_function_name("Migration.forwards"), "forwards");
        assert_eq!(normalize_function_name("0002_auto_func"), "f_0002_auto_func");
        assert_eq!(normalize_function_name("app-func"), "app_func");
    }

    #[test]
    fn test_definition_source_dedents_methods() {
        let source = "class Migration:\n    @staticmethod\n    def forwards(apps, schema_editor):\n        return\n";
        let parsed = parse_module(source).expect("valid source");
        let Stmt::ClassDef(class_def) = &parsed.syntax().body[0] else {
            panic!("expected a class");
        };
        let Stmt::FunctionDef(function) = &class_def.body[0] else {
            panic!("expected a function");
        };
        assert_eq!(
            definition_source(source, function.range(), function.name.start()),
            "def forwards(apps, schema_editor):\n    return\n"
        );
        assert_eq!(
            definition_source(source, function.range(), function.start()),
            "@staticmethod\ndef forwards(apps, schema_editor):\n    return\n"
        );
    }

    #[test]
    fn test_file_hash() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("writer.py");
        fs::write(&path, "abc")?;
        assert_eq!(
            file_hash(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }
}
