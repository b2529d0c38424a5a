//! In-process recipe catalog backed by YAML files

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use super::{merge, ConfigOverride, Recipe, RecipeError, RecipeResolver, ResolvedSpec};

/// Recipes indexed by name
#[derive(Debug, Clone, Default)]
pub struct RecipeCatalog {
    recipes: HashMap<String, Recipe>,
}

/// Parse a single recipe from YAML
pub fn parse_recipe(content: &str) -> Result<Recipe, RecipeError> {
    serde_yaml::from_str(content).map_err(|e| RecipeError::Parse(e.to_string()))
}

impl RecipeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_recipes(recipes: impl IntoIterator<Item = Recipe>) -> Self {
        Self {
            recipes: recipes.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// Load every `*.yaml` / `*.yml` file in a directory.
    ///
    /// A missing directory yields an empty catalog.
    pub fn load_dir(dir: &Path) -> Result<Self, RecipeError> {
        let mut catalog = Self::new();
        if !dir.exists() {
            warn!("Recipe directory {} does not exist", dir.display());
            return Ok(catalog);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let content = std::fs::read_to_string(&path)?;
            let recipe = parse_recipe(&content).map_err(|e| {
                RecipeError::Parse(format!("{}: {}", path.display(), e))
            })?;
            debug!("Loaded recipe '{}' from {}", recipe.name, path.display());
            catalog.insert(recipe);
        }

        Ok(catalog)
    }

    pub fn insert(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.name.clone(), recipe);
    }

    pub fn get(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(name)
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

impl RecipeResolver for RecipeCatalog {
    fn resolve(
        &self,
        name: &str,
        config_override: Option<&ConfigOverride>,
    ) -> Result<ResolvedSpec, RecipeError> {
        let recipe = self
            .recipes
            .get(name)
            .ok_or_else(|| RecipeError::NotFound(name.to_string()))?;
        merge(recipe, config_override)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.recipes.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceKind;

    const QDRANT: &str = r#"
name: qdrant
kind: vector_db
command: qdrant --uri http://0.0.0.0:$SERVICE_PORT
resources:
  cpu: 8
  memory: 32G
"#;

    #[test]
    fn test_parse_recipe_defaults() {
        let recipe = parse_recipe(QDRANT).unwrap();
        assert_eq!(recipe.kind, ServiceKind::VectorDb);
        assert_eq!(recipe.resources.cpu, 8);
        assert_eq!(recipe.resources.nodes, 1);
        assert_eq!(recipe.resources.gpu, 0);
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qdrant.yaml"), QDRANT).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a recipe").unwrap();

        let catalog = RecipeCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.names(), vec!["qdrant".to_string()]);
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let catalog = RecipeCatalog::load_dir(Path::new("/nonexistent/recipes")).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_resolve_unknown_recipe() {
        let catalog = RecipeCatalog::new();
        let result = catalog.resolve("nope", None);
        assert!(matches!(result, Err(RecipeError::NotFound(_))));
    }
}
