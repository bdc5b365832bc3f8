use indexmap::IndexMap;
use tracing::warn;

/// Rate-limits warnings that can fire every timestep.
///
/// The first occurrence of a key is logged in full. Later occurrences are only counted, with the
/// range of an associated value tracked, and reported once by [`RecurringWarnings::summarise`].
#[derive(Clone, Debug, Default)]
pub struct RecurringWarnings {
    entries: IndexMap<String, RecurringWarning>,
}

#[derive(Clone, Debug, PartialEq)]
struct RecurringWarning {
    message: String,
    count: usize,
    min_value: f64,
    max_value: f64,
}

impl RecurringWarnings {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record one occurrence. `detail` is only evaluated for the first occurrence of `key`.
    pub fn record(
        &mut self,
        key: &str,
        message: &str,
        value: f64,
        detail: impl FnOnce() -> String,
    ) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.count += 1;
                entry.min_value = entry.min_value.min(value);
                entry.max_value = entry.max_value.max(value);
            }
            None => {
                warn!("{message}: {}", detail());
                self.entries.insert(
                    key.to_string(),
                    RecurringWarning {
                        message: message.to_string(),
                        count: 1,
                        min_value: value,
                        max_value: value,
                    },
                );
            }
        }
    }

    pub fn count(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.count)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log a single summary line for every warning that recurred.
    pub fn summarise(&self) {
        for entry in self.entries.values().filter(|entry| entry.count > 1) {
            warn!(
                "{} (occurred {} times; value ranged from {} to {})",
                entry.message, entry.count, entry.min_value, entry.max_value
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use std::cell::Cell;

    #[rstest]
    fn should_only_build_detail_for_first_occurrence() {
        let mut warnings = RecurringWarnings::new();
        let detail_calls = Cell::new(0);

        for value in [3., 1., 7.] {
            warnings.record("tank:cycling", "Heater is cycling excessively", value, || {
                detail_calls.set(detail_calls.get() + 1);
                "first".to_string()
            });
        }

        assert_eq!(detail_calls.get(), 1);
        assert_eq!(warnings.count("tank:cycling"), 3);
        assert_eq!(warnings.entries["tank:cycling"].min_value, 1.);
        assert_eq!(warnings.entries["tank:cycling"].max_value, 7.);
    }

    #[rstest]
    fn should_count_keys_separately() {
        let mut warnings = RecurringWarnings::new();
        warnings.record("a", "A", 0., String::new);
        warnings.record("b", "B", 0., String::new);

        assert_eq!(warnings.count("a"), 1);
        assert_eq!(warnings.count("b"), 1);
        assert_eq!(warnings.count("c"), 0);
    }
}
