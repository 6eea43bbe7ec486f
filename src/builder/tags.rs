//! Build parameter merging.

use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::api::TagVar;

/// Merges `tagVars` and `tags` into the ordered list passed to the evaluator.
///
/// A name keeps the position of its first occurrence. Within one list the last
/// occurrence wins and a warning is logged; a tag overrides a tag variable of the
/// same name.
#[must_use]
pub fn merge_tags(tags: &[TagVar], tag_vars: &[TagVar]) -> Vec<TagVar> {
    let mut merged: Vec<TagVar> = Vec::with_capacity(tags.len() + tag_vars.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (list, source) in [(tag_vars, "tagVars"), (tags, "tags")] {
        let mut seen_here = HashSet::new();
        for tag in list {
            if !seen_here.insert(tag.name.as_str()) {
                warn!(tag = %tag.name, "Duplicate name in {source}, the last value wins");
            }
            match positions.get(&tag.name) {
                Some(&index) => {
                    if let Some(slot) = merged.get_mut(index) {
                        slot.value.clone_from(&tag.value);
                    }
                }
                None => {
                    positions.insert(tag.name.clone(), merged.len());
                    merged.push(tag.clone());
                }
            }
        }
    }

    merged
}
