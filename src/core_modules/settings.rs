// THEORY:
// `ProjectSettings` is the tunable-configuration layer, generalizing the
// teacher's `PipelineConfig` (pipeline.rs) from "one frame's worth of grid
// geometry" to the full set of thresholds spec.md §6 lists as external
// inputs. Deserializable with `serde` + loadable from a TOML file with the
// `toml` crate, the way `freddiehaddad-oxidized` loads its editor config
// (see DESIGN.md) -- the teacher itself has no file-based config, so this is
// learned from the rest of the pack rather than imitated from the teacher.

use serde::Deserialize;
use std::collections::HashSet;

/// A per-frame light condition, sourced from a sparse keyframe log
/// (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LightCondition {
    Daylight,
    Nightlight,
    Extralight,
}

/// Thresholds for `find_best_trajectories` (spec.md §4.7, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct FindBestTrajectoriesSettings {
    pub good_score_threshold: f64,
    pub good_for_sure_score_threshold: f64,
    pub might_be_bad_score_threshold: f64,
    pub might_be_bad_sum_good_score_threshold: f64,
    pub framelimit: u64,
}

impl Default for FindBestTrajectoriesSettings {
    fn default() -> Self {
        Self {
            good_score_threshold: 10.0,
            good_for_sure_score_threshold: 20.0,
            might_be_bad_score_threshold: 3.0,
            might_be_bad_sum_good_score_threshold: 5.0,
            framelimit: 1500,
        }
    }
}

/// Method used to score a trajectory (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TrajScoreMethod {
    Method1 = 1,
    Method2 = 2,
}

/// All tunable thresholds the pipeline needs (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSettings {
    pub mchips: usize,
    pub mbase: usize,
    pub max_inrat_dist: f64,
    pub avg_inrat_dist: f64,
    pub max_perframe_dist: f64,
    pub max_perframe_dist_md: f64,
    pub image_width: u32,
    pub image_height: u32,
    pub fps: f64,
    #[serde(default)]
    pub good_light: HashSet<LightCondition>,
    pub find_best_trajectories_settings: FindBestTrajectoriesSettings,
    pub traj_score_method: TrajScoreMethod,
    /// How many frames phase 5/6's stranded-cluster recovery searches
    /// outward for a plausible owner (spec.md §4.5 step 5: "typically 50").
    #[serde(default = "default_stranded_cluster_maxskip")]
    pub stranded_cluster_maxskip: i64,
}

fn default_stranded_cluster_maxskip() -> i64 {
    50
}

impl ProjectSettings {
    /// Parse settings from TOML text (the `[project]`-rooted file a CLI
    /// `-k`/config flag would point at).
    pub fn from_toml_str(text: &str) -> Result<Self, crate::error::TrajognizeError> {
        toml::from_str(text).map_err(|e| crate::error::TrajognizeError::Config(e.to_string()))
    }
}

impl Default for ProjectSettings {
    fn default() -> Self {
        let mut good_light = HashSet::new();
        good_light.insert(LightCondition::Daylight);
        Self {
            mchips: 3,
            mbase: 8,
            max_inrat_dist: 50.0,
            avg_inrat_dist: 30.0,
            max_perframe_dist: 20.0,
            max_perframe_dist_md: 60.0,
            image_width: 1920,
            image_height: 1080,
            fps: 25.0,
            good_light,
            find_best_trajectories_settings: FindBestTrajectoriesSettings::default(),
            traj_score_method: TrajScoreMethod::Method1,
            stranded_cluster_maxskip: default_stranded_cluster_maxskip(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_self_consistent() {
        let s = ProjectSettings::default();
        assert!(s.max_inrat_dist > 0.0);
        assert_eq!(s.mchips, 3);
    }

    #[test]
    fn parses_minimal_toml() {
        let text = r#"
            mchips = 3
            mbase = 8
            max_inrat_dist = 50.0
            avg_inrat_dist = 30.0
            max_perframe_dist = 20.0
            max_perframe_dist_md = 60.0
            image_width = 1920
            image_height = 1080
            fps = 25.0
            traj_score_method = "Method1"

            [find_best_trajectories_settings]
            good_score_threshold = 10.0
            good_for_sure_score_threshold = 20.0
            might_be_bad_score_threshold = 3.0
            might_be_bad_sum_good_score_threshold = 5.0
            framelimit = 1500
        "#;
        let s = ProjectSettings::from_toml_str(text).unwrap();
        assert_eq!(s.mchips, 3);
        assert_eq!(s.find_best_trajectories_settings.framelimit, 1500);
    }
}
