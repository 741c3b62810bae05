//! Parameter space expansion.
//!
//! Every sequence-valued parameter is swept; the space is the cartesian
//! product of the swept values merged with the fixed parameters. Iteration
//! is lazy and can be restarted by calling [`ParameterSpace::iter`] again.

use crate::value::{ParameterSet, Value};

/// One fully-resolved parameter assignment for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    index: usize,
    parameters: ParameterSet,
}

impl Configuration {
    /// Position in expansion order, starting at zero.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Render as the `key value` file the simulation reads.
    #[must_use]
    pub fn render(&self) -> String {
        self.parameters.render()
    }
}

/// A parameter set split into fixed and swept entries.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    base: ParameterSet,
    /// Position in `base` and candidate values, in insertion order.
    swept: Vec<(usize, Vec<Value>)>,
}

impl ParameterSpace {
    #[must_use]
    pub fn new(parameters: ParameterSet) -> Self {
        let swept = parameters
            .iter()
            .enumerate()
            .filter_map(|(pos, (_, value))| match value {
                Value::Seq(items) => Some((pos, items.clone())),
                _ => None,
            })
            .collect();
        Self {
            base: parameters,
            swept,
        }
    }

    /// Parameters shared by every configuration.
    pub fn fixed(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.base.iter().filter(|(_, v)| !v.is_swept())
    }

    /// Swept parameters with their candidate values.
    pub fn swept(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.swept.iter().filter_map(|(pos, values)| {
            self.base
                .iter()
                .nth(*pos)
                .map(|(key, _)| (key, values.as_slice()))
        })
    }

    /// Number of configurations, or `None` if it does not fit in a `usize`.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.swept
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
    }

    /// True when some swept parameter has no candidate values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.swept.iter().any(|(_, values)| values.is_empty())
    }

    /// Iterate over configurations from the beginning.
    #[must_use]
    pub fn iter(&self) -> Configurations<'_> {
        Configurations {
            space: self,
            cursor: vec![0; self.swept.len()],
            next_index: 0,
            remaining: self.size(),
            exhausted: self.is_empty(),
        }
    }
}

impl<'a> IntoIterator for &'a ParameterSpace {
    type Item = Configuration;
    type IntoIter = Configurations<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over a [`ParameterSpace`]. The last swept parameter varies fastest.
#[derive(Debug, Clone)]
pub struct Configurations<'a> {
    space: &'a ParameterSpace,
    cursor: Vec<usize>,
    next_index: usize,
    /// `None` when the space is too large to count.
    remaining: Option<usize>,
    exhausted: bool,
}

impl Configurations<'_> {
    /// Step the odometer; true once every digit has wrapped.
    fn advance(&mut self) -> bool {
        for (digit, (_, values)) in self.cursor.iter_mut().zip(&self.space.swept).rev() {
            *digit += 1;
            if *digit < values.len() {
                return false;
            }
            *digit = 0;
        }
        true
    }
}

impl Iterator for Configurations<'_> {
    type Item = Configuration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let mut parameters = self.space.base.clone();
        for ((pos, values), &choice) in self.space.swept.iter().zip(&self.cursor) {
            parameters.set_at(*pos, values[choice].clone());
        }

        let config = Configuration {
            index: self.next_index,
            parameters,
        };
        tracing::trace!("Yielding configuration {}", config.index);

        self.next_index = self.next_index.wrapping_add(1);
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }
        self.exhausted = self.advance();

        Some(config)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.remaining {
            _ if self.exhausted => (0, Some(0)),
            Some(remaining) => (remaining, Some(remaining)),
            None => (usize::MAX, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(values: &[i64]) -> Value {
        Value::Seq(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn test_no_swept_parameters_yields_one() {
        let space = ParameterSpace::new([("x", Value::Int(1)), ("s", Value::from("abc"))].into_iter().collect());
        assert_eq!(space.size(), Some(1));
        let configs: Vec<_> = space.iter().collect();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].index(), 0);
        assert_eq!(configs[0].render(), "x 1\ns abc\n");
    }

    #[test]
    fn test_product_size_and_order() {
        let space = ParameterSpace::new(
            [("a", seq(&[1, 2])), ("fixed", Value::Float(0.5)), ("b", seq(&[10, 20, 30]))]
                .into_iter()
                .collect(),
        );
        assert_eq!(space.size(), Some(6));
        assert_eq!(space.fixed().count(), 1);
        assert_eq!(space.swept().map(|(k, v)| (k, v.len())).collect::<Vec<_>>(), [("a", 2), ("b", 3)]);

        let pairs: Vec<(i64, i64)> = space
            .iter()
            .map(|c| {
                assert_eq!(c.get("fixed"), Some(&Value::Float(0.5)));
                (c.get("a").unwrap().as_i64().unwrap(), c.get("b").unwrap().as_i64().unwrap())
            })
            .collect();
        assert_eq!(pairs, [(1, 10), (1, 20), (1, 30), (2, 10), (2, 20), (2, 30)]);

        let indices: Vec<_> = space.iter().map(|c| c.index()).collect();
        assert_eq!(indices, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_keys_keep_declaration_order() {
        let space = ParameterSpace::new([("a", seq(&[1])), ("b", Value::Int(2))].into_iter().collect());
        let config = space.iter().next().unwrap();
        assert_eq!(config.render(), "a 1\nb 2\n");
    }

    #[test]
    fn test_empty_sweep_yields_nothing() {
        let space = ParameterSpace::new([("a", seq(&[])), ("b", seq(&[1, 2]))].into_iter().collect());
        assert!(space.is_empty());
        assert_eq!(space.size(), Some(0));
        assert_eq!(space.iter().size_hint(), (0, Some(0)));
        assert_eq!(space.iter().count(), 0);
    }

    #[test]
    fn test_restartable_with_exact_hint() {
        let space = ParameterSpace::new([("a", seq(&[1, 2, 3]))].into_iter().collect());
        let mut iter = space.iter();
        assert_eq!(iter.size_hint(), (3, Some(3)));
        iter.next();
        assert_eq!(iter.size_hint(), (2, Some(2)));
        assert_eq!(iter.by_ref().count(), 2);
        assert_eq!(iter.next(), None);

        let first: Vec<_> = space.iter().collect();
        let second: Vec<_> = (&space).into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_nested_sequences_sweep_outer_level() {
        let space = ParameterSpace::new(
            [("pair", Value::Seq(vec![seq(&[1, 2]), seq(&[3, 4])]))].into_iter().collect(),
        );
        let rendered: Vec<_> = space.iter().map(|c| c.render()).collect();
        assert_eq!(rendered, ["pair [1, 2]\n", "pair [3, 4]\n"]);
    }

    #[test]
    fn test_uncountable_space_still_iterates_in_order() {
        // 2^65 configurations
        let params: ParameterSet = (0..65).map(|i| (format!("p{i:02}"), seq(&[0, 1]))).collect();
        let space = ParameterSpace::new(params);
        assert_eq!(space.size(), None);
        assert!(!space.is_empty());

        let mut iter = space.iter();
        assert_eq!(iter.size_hint(), (usize::MAX, None));
        let first: Vec<_> = iter.by_ref().take(4).collect();
        let last_two = |c: &Configuration| {
            (c.get("p63").unwrap().as_i64().unwrap(), c.get("p64").unwrap().as_i64().unwrap())
        };
        assert_eq!(first.iter().map(last_two).collect::<Vec<_>>(), [(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert!(first.iter().all(|c| c.get("p00") == Some(&Value::Int(0))));
        assert_eq!(first[3].index(), 3);
        assert!(iter.next().is_some());
    }
}
