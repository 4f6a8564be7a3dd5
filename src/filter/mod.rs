use globset::{Glob, GlobSet, GlobSetBuilder};

/// Glob-based blocklist applied to entity ids before persistence.
///
/// Patterns support `*`, `?`, and character classes. An empty list blocks
/// nothing.
pub struct EntityBlockList {
    set: GlobSet,
}

impl EntityBlockList {
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn should_block(&self, entity_id: &str) -> bool {
        self.set.is_match(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocklist(patterns: &[&str]) -> EntityBlockList {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        EntityBlockList::new(&patterns).unwrap()
    }

    #[test]
    fn empty_list_blocks_nothing() {
        let list = blocklist(&[]);
        assert!(!list.should_block("update.core"));
        assert!(!list.should_block("light.kitchen"));
    }

    #[test]
    fn wildcard_blocks_whole_domain() {
        let list = blocklist(&["update.*"]);
        assert!(list.should_block("update.core"));
        assert!(list.should_block("update.home_assistant"));
        assert!(!list.should_block("light.kitchen"));
    }

    #[test]
    fn exact_pattern_blocks_only_that_entity() {
        let list = blocklist(&["light.kitchen"]);
        assert!(list.should_block("light.kitchen"));
        assert!(!list.should_block("light.kitchen_counter"));
    }

    #[test]
    fn question_mark_matches_single_character() {
        let list = blocklist(&["light.lamp_?"]);
        assert!(list.should_block("light.lamp_1"));
        assert!(!list.should_block("light.lamp_12"));
    }

    #[test]
    fn character_class_matches() {
        let list = blocklist(&["sensor.temp_[ab]"]);
        assert!(list.should_block("sensor.temp_a"));
        assert!(list.should_block("sensor.temp_b"));
        assert!(!list.should_block("sensor.temp_c"));
    }

    #[test]
    fn any_matching_pattern_blocks() {
        let list = blocklist(&["update.*", "sun.sun"]);
        assert!(list.should_block("update.core"));
        assert!(list.should_block("sun.sun"));
        assert!(!list.should_block("light.kitchen"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(EntityBlockList::new(&["[".to_string()]).is_err());
    }
}
