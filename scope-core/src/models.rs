use std::cmp::Ordering;

use regex::Regex;

use crate::config::ModelsCfg;
use crate::error::{CoreResult, ScopeError};
use crate::model::ModelInfo;

/// Narrows the upstream model listing to chat models and orders newest families first.
#[derive(Debug)]
pub struct ModelFilter {
    include: Regex,
    exclude: Option<Regex>,
}

impl ModelFilter {
    /// Build a filter by compiling regexes from config.
    pub fn new(cfg: &ModelsCfg) -> CoreResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                ScopeError::Validation(format!("invalid model filter regex '{pattern}': {e}"))
            })
        };
        let include = compile(&cfg.include)?;
        let exclude = match cfg.exclude.trim() {
            "" => None,
            p => Some(compile(p)?),
        };
        Ok(Self { include, exclude })
    }

    fn keeps(&self, id: &str) -> bool {
        self.include.is_match(id) && !self.exclude.as_ref().is_some_and(|r| r.is_match(id))
    }

    pub fn apply(&self, models: Vec<ModelInfo>) -> Vec<ModelInfo> {
        let mut kept: Vec<ModelInfo> = models.into_iter().filter(|m| self.keeps(&m.id)).collect();
        kept.sort_by(|a, b| compare_ids(&a.id, &b.id));
        kept
    }
}

/// `4o` ids first, then other ids containing `4`, then the rest; ties by id.
fn compare_ids(a: &str, b: &str) -> Ordering {
    fn rank(id: &str) -> u8 {
        if id.contains("4o") {
            0
        } else if id.contains('4') {
            1
        } else {
            2
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
}
