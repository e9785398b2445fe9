use once_cell::sync::Lazy;
use regex::Regex;

use crate::serializer::{Imports, MIGRATIONS_IMPORT, MODELS_IMPORT};

const COMBINED_IMPORT: &str = "from django.db import migrations, models";

/// `import app.migrations.0001_initial`: the module is about to be deleted.
static MIGRATION_MODULE_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^import (.*)\.\d+[^\s]*$").expect("valid regex"));

/// The import block of a generated module.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSection {
    pub imports: Vec<String>,
    /// Modules referenced by functions that could not be copied.
    pub manual_porting: Vec<String>,
}

impl ImportSection {
    pub fn build(imports: Imports, extra_imports: &[String]) -> Self {
        let mut imports: Imports = imports
            .into_iter()
            .chain(extra_imports.iter().cloned())
            .filter(|line| !line.trim().is_empty())
            .collect();

        let mut manual_porting: Vec<String> = Vec::new();
        imports.retain(|line| match MIGRATION_MODULE_IMPORT.captures(line) {
            Some(_) => {
                manual_porting.push(line.trim_start_matches("import").trim().to_owned());
                false
            }
            None => true,
        });
        manual_porting.sort();

        // Every migration uses `migrations`; `models` joins it on one line.
        if imports.remove(MODELS_IMPORT) || imports.contains(COMBINED_IMPORT) {
            imports.remove(MIGRATIONS_IMPORT);
            imports.insert(COMBINED_IMPORT.to_owned());
        } else {
            imports.insert(MIGRATIONS_IMPORT.to_owned());
        }

        let mut imports: Vec<String> = imports.into_iter().collect();
        imports.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        Self {
            imports,
            manual_porting,
        }
    }

    pub fn needs_manual_porting(&self) -> bool {
        !self.manual_porting.is_empty()
    }

    pub fn render(&self) -> String {
        let mut text = String::new();
        if !self.imports.is_empty() {
            text.push_str(&self.imports.join("\n"));
            text.push('\n');
        }
        if self.needs_manual_porting() {
            text.push_str(
                "\n\n# Functions from the following migrations need manual copying.\n\
                 # Move them and any dependencies into this file, then update the\n\
                 # RunPython operations to refer to the local versions:\n# ",
            );
            text.push_str(&self.manual_porting.join("\n# "));
        }
        text
    }
}

/// Plain imports first, then by imported module.
fn sort_key(line: &str) -> (bool, &str, &str) {
    let mut words = line.split_whitespace();
    let is_from = words.next() == Some("from");
    (is_from, words.next().unwrap_or_default(), line)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_models_import_is_merged() {
        let section = ImportSection::build(
            Imports::from([MODELS_IMPORT.to_owned()]),
            &[
                "from django.db import migrations".to_owned(),
                "import itertools".to_owned(),
                "from random import randrange".to_owned(),
                "import datetime".to_owned(),
            ],
        );
        assert_eq!(
            section.imports,
            vec![
                "import datetime",
                "import itertools",
                COMBINED_IMPORT,
                "from random import randrange",
            ]
        );
        assert!(!section.needs_manual_porting());
    }

    #[test]
    fn test_migrations_import_is_always_present() {
        let section = ImportSection::build(Imports::new(), &[]);
        assert_eq!(section.render(), "from django.db import migrations\n");
    }

    #[test]
    fn test_migration_module_imports_become_comments() {
        let section = ImportSection::build(
            Imports::from([
                "import app.migrations.0002_auto".to_owned(),
                "import app.utils".to_owned(),
            ]),
            &[],
        );
        assert_eq!(section.manual_porting, vec!["app.migrations.0002_auto"]);
        assert_eq!(
            section.render(),
            "import app.utils\n\
             from django.db import migrations\n\
             \n\
             \n\
             # Functions from the following migrations need manual copying.\n\
             # Move them and any dependencies into this file, then update the\n\
             # RunPython operations to refer to the local versions:\n\
             # app.migrations.0002_auto"
        );
    }
}
