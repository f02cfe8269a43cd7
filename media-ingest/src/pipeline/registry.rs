//! Processor registry: rules bound to recipes.
//!
//! Built once at startup from the configuration and never modified. Every
//! input path is owned by at most one rule, the one with the longest
//! matching input subpath.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::processors::{Recipe, RecipeMap, RecipeOptions, builtin_recipes};
use crate::config::{AppConfig, RuleConfig, normalize_subpath};
use crate::{Error, Result};

/// A validated rule with its recipe.
pub struct ProcessorRule {
    pub name: String,
    /// Normalized, relative to the input root.
    pub input_subpath: PathBuf,
    /// Normalized, relative to the output root.
    pub output_subpath: PathBuf,
    pub output_extension: Option<String>,
    pub options: RecipeOptions,
    pub recipe: Arc<dyn Recipe>,
}

impl fmt::Debug for ProcessorRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRule")
            .field("name", &self.name)
            .field("input_subpath", &self.input_subpath)
            .field("recipe", &self.recipe.name())
            .field("output_subpath", &self.output_subpath)
            .field("output_extension", &self.output_extension)
            .finish()
    }
}

/// The rule owning a particular input file.
#[derive(Debug, Clone)]
pub struct ResolvedRule {
    pub rule: Arc<ProcessorRule>,
    /// Path of the file relative to the rule directory.
    pub relative_path: PathBuf,
    /// First directory component below the rule directory, if any.
    pub path_param: Option<String>,
}

impl ResolvedRule {
    pub fn recipe(&self) -> &Arc<dyn Recipe> {
        &self.rule.recipe
    }
}

#[derive(Debug)]
pub struct ProcessorRegistry {
    input_root: PathBuf,
    output_root: PathBuf,
    /// Sorted by descending subpath depth so the first match is the longest.
    rules: Vec<Arc<ProcessorRule>>,
}

impl ProcessorRegistry {
    /// Build the registry from a prepared configuration using the built-in recipes.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::load(
            &config.input_root,
            &config.output_root,
            &config.rules,
            &builtin_recipes(&config.ffmpeg_path),
        )
    }

    /// Validate `rules` and bind each one to its recipe.
    pub fn load(
        input_root: &Path,
        output_root: &Path,
        rules: &[RuleConfig],
        recipes: &RecipeMap,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        let mut subpaths: HashSet<PathBuf> = HashSet::new();
        let mut bound = Vec::with_capacity(rules.len());

        for rule in rules {
            let name = rule.name.trim();
            if name.is_empty() {
                return Err(Error::config("rule name must not be empty"));
            }
            if !names.insert(name.to_string()) {
                return Err(Error::config(format!("duplicate rule name '{}'", name)));
            }

            let input_subpath = normalize_subpath(&rule.input_subpath)
                .map_err(|e| Error::config(format!("rule '{}' input_subpath: {}", name, e)))?;
            if input_subpath.as_os_str().is_empty() {
                return Err(Error::config(format!(
                    "rule '{}' input_subpath must name a directory below input_root",
                    name
                )));
            }
            if !subpaths.insert(input_subpath.clone()) {
                return Err(Error::config(format!(
                    "input_subpath '{}' is claimed by more than one rule",
                    input_subpath.display()
                )));
            }
            let output_subpath = normalize_subpath(&rule.output_subpath)
                .map_err(|e| Error::config(format!("rule '{}' output_subpath: {}", name, e)))?;

            let recipe = recipes.get(rule.recipe.trim()).cloned().ok_or_else(|| {
                let mut known: Vec<&str> = recipes.keys().copied().collect();
                known.sort();
                Error::config(format!(
                    "rule '{}' uses unknown recipe '{}' (known: {})",
                    name,
                    rule.recipe,
                    known.join(", ")
                ))
            })?;
            recipe.validate(&rule.options).map_err(|e| {
                Error::config(format!("rule '{}' has invalid options: {}", name, e))
            })?;

            bound.push(Arc::new(ProcessorRule {
                name: name.to_string(),
                input_subpath,
                output_subpath,
                output_extension: rule.normalized_extension().map(str::to_string),
                options: rule.options.clone(),
                recipe,
            }));
        }

        bound.sort_by(|a, b| {
            b.input_subpath
                .components()
                .count()
                .cmp(&a.input_subpath.components().count())
                .then_with(|| a.input_subpath.cmp(&b.input_subpath))
        });

        for rule in &bound {
            info!(
                rule = %rule.name,
                input = %rule.input_subpath.display(),
                recipe = rule.recipe.name(),
                output = %rule.output_subpath.display(),
                "Registered rule"
            );
        }

        Ok(Self {
            input_root: input_root.to_path_buf(),
            output_root: output_root.to_path_buf(),
            rules: bound,
        })
    }

    /// Find the rule owning `path`.
    pub fn resolve(&self, path: &Path) -> Option<ResolvedRule> {
        let relative = path.strip_prefix(&self.input_root).ok()?;
        let rule = self
            .rules
            .iter()
            .find(|rule| relative.starts_with(&rule.input_subpath) && relative != rule.input_subpath)?;

        let relative_path = relative.strip_prefix(&rule.input_subpath).ok()?.to_path_buf();
        let path_param = relative_path
            .parent()
            .and_then(|parent| parent.components().next())
            .and_then(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            });

        Some(ResolvedRule {
            rule: rule.clone(),
            relative_path,
            path_param,
        })
    }

    /// Where the output of `resolved` is written.
    ///
    /// `output_root / output_subpath / <relative dirs> / <stem>.<ext>`, with the
    /// source extension kept when the rule does not set one.
    pub fn output_path(&self, resolved: &ResolvedRule) -> PathBuf {
        let mut path = self.output_root.join(&resolved.rule.output_subpath);
        if let Some(parent) = resolved.relative_path.parent() {
            path.push(parent);
        }

        let stem = resolved
            .relative_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        let mut file_name = stem;
        let extension = resolved
            .rule
            .output_extension
            .as_deref()
            .map(std::ffi::OsStr::new)
            .or_else(|| resolved.relative_path.extension());
        if let Some(extension) = extension {
            file_name.push(".");
            file_name.push(extension);
        }
        path.push(file_name);
        path
    }

    /// Absolute rule directories, for the scanner.
    pub fn rule_dirs(&self) -> Vec<PathBuf> {
        self.rules
            .iter()
            .map(|rule| self.input_root.join(&rule.input_subpath))
            .collect()
    }

    pub fn rules(&self) -> &[Arc<ProcessorRule>] {
        &self.rules
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(name: &str, input: &str, recipe: &str, output: &str, ext: Option<&str>) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            input_subpath: PathBuf::from(input),
            recipe: recipe.to_string(),
            output_subpath: PathBuf::from(output),
            output_extension: ext.map(str::to_string),
            options: Default::default(),
        }
    }

    fn registry(rules: &[RuleConfig]) -> Result<ProcessorRegistry> {
        ProcessorRegistry::load(
            Path::new("/in"),
            Path::new("/out"),
            rules,
            &builtin_recipes("ffmpeg"),
        )
    }

    #[test]
    fn test_longest_prefix_wins() {
        let reg = registry(&[
            rule("outer", "video/a", "remux", "a", None),
            rule("inner", "video/a/b", "remux", "b", None),
        ])
        .unwrap();

        let resolved = reg.resolve(Path::new("/in/video/a/b/x.mp4")).unwrap();
        assert_eq!(resolved.rule.name, "inner");
        assert_eq!(resolved.relative_path, PathBuf::from("x.mp4"));
        assert_eq!(resolved.path_param, None);

        let resolved = reg.resolve(Path::new("/in/video/a/c/y.mp4")).unwrap();
        assert_eq!(resolved.rule.name, "outer");
        assert_eq!(resolved.path_param.as_deref(), Some("c"));
    }

    #[test]
    fn test_prefix_is_component_wise() {
        let reg = registry(&[rule("a", "video/a", "remux", "a", None)]).unwrap();
        assert!(reg.resolve(Path::new("/in/video/ab/x.mp4")).is_none());
        assert!(reg.resolve(Path::new("/elsewhere/video/a/x.mp4")).is_none());
        assert!(reg.resolve(Path::new("/in/video/a")).is_none());
    }

    #[test]
    fn test_path_param_and_output_path() {
        let reg = registry(&[rule("scale", "scale", "hevc_scale", "scaled", Some("mkv"))]).unwrap();
        let resolved = reg.resolve(Path::new("/in/scale/720/clip.mp4")).unwrap();
        assert_eq!(resolved.path_param.as_deref(), Some("720"));
        assert_eq!(resolved.recipe().name(), "hevc_scale");
        assert_eq!(
            reg.output_path(&resolved),
            PathBuf::from("/out/scaled/720/clip.mkv")
        );
    }

    #[test]
    fn test_output_keeps_source_extension() {
        let reg = registry(&[rule("vol", "volume", "volume_scale", "louder", None)]).unwrap();
        let resolved = reg.resolve(Path::new("/in/volume/clip.mov")).unwrap();
        assert_eq!(reg.output_path(&resolved), PathBuf::from("/out/louder/clip.mov"));
    }

    #[test]
    fn test_duplicate_subpath_is_fatal() {
        let err = registry(&[
            rule("one", "video", "remux", "a", None),
            rule("two", "./video/", "remux", "b", None),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_duplicate_name_is_fatal() {
        let err = registry(&[
            rule("same", "one", "remux", "a", None),
            rule("same", "two", "remux", "b", None),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate rule name"));
    }

    #[test]
    fn test_unknown_recipe_is_fatal() {
        let err = registry(&[rule("x", "x", "av1_magic", "x", None)]).unwrap_err();
        assert!(err.to_string().contains("unknown recipe"));
    }

    #[test]
    fn test_bad_subpaths_are_fatal() {
        assert!(registry(&[rule("x", "", "remux", "x", None)]).is_err());
        assert!(registry(&[rule("x", "/abs", "remux", "x", None)]).is_err());
        assert!(registry(&[rule("x", "ok", "remux", "../up", None)]).is_err());
    }

    #[test]
    fn test_invalid_options_are_fatal() {
        let mut bad = rule("vol", "volume", "volume_scale", "louder", None);
        bad.options = json!({"factor": -1}).as_object().cloned().unwrap();
        let err = registry(&[bad]).unwrap_err();
        assert!(err.to_string().contains("invalid options"));
    }

    #[test]
    fn test_rule_dirs() {
        let reg = registry(&[
            rule("a", "video/a", "remux", "a", None),
            rule("b", "audio", "remux", "b", None),
        ])
        .unwrap();
        let mut dirs = reg.rule_dirs();
        dirs.sort();
        assert_eq!(
            dirs,
            vec![PathBuf::from("/in/audio"), PathBuf::from("/in/video/a")]
        );
    }
}
