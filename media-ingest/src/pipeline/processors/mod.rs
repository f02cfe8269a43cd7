//! Built-in recipes.
//!
//! Every recipe shells out to ffmpeg. Recipes are looked up by name through
//! [`builtin_recipes`]; there is no dynamic loading.

pub mod hevc_scale;
pub mod remux;
pub mod traits;
pub mod utils;
pub mod volume_scale;

use std::collections::HashMap;
use std::sync::Arc;

pub use hevc_scale::HevcScaleRecipe;
pub use remux::RemuxRecipe;
pub use traits::{Recipe, RecipeOptions, RecipeOutcome, RecipeRequest};
pub use volume_scale::VolumeScaleRecipe;

/// Recipes keyed by the identifier rules refer to.
pub type RecipeMap = HashMap<&'static str, Arc<dyn Recipe>>;

/// The statically known recipes, all using `ffmpeg_path`.
pub fn builtin_recipes(ffmpeg_path: &str) -> RecipeMap {
    let recipes: [Arc<dyn Recipe>; 3] = [
        Arc::new(HevcScaleRecipe::new(ffmpeg_path)),
        Arc::new(VolumeScaleRecipe::new(ffmpeg_path)),
        Arc::new(RemuxRecipe::new(ffmpeg_path)),
    ];
    recipes
        .into_iter()
        .map(|recipe| (recipe.name(), recipe))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_recipe_names() {
        let recipes = builtin_recipes("ffmpeg");
        let mut names: Vec<&str> = recipes.keys().copied().collect();
        names.sort();
        assert_eq!(names, vec!["hevc_scale", "remux", "volume_scale"]);
    }
}
