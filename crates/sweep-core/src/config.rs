use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One categorical dimension of the search space: a parameter name and its
/// finite set of admissible values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDomain {
    pub name: String,
    pub choices: Vec<u64>,
}

/// The ordered set of dimensions a study searches over. Dimensions not listed
/// here are pinned by the study's `fixed` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamDomains {
    domains: Vec<ParamDomain>,
}

impl ParamDomains {
    pub fn new(domains: Vec<ParamDomain>) -> Self {
        Self { domains }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamDomain> {
        self.domains.iter()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Number of distinct configurations in the cartesian product.
    /// Zero when the space has no dimensions or any dimension has no choices.
    pub fn cardinality(&self) -> u64 {
        if self.domains.is_empty() {
            return 0;
        }
        self.domains
            .iter()
            .map(|d| d.choices.len() as u64)
            .fold(1u64, |acc, n| acc.saturating_mul(n))
    }
}

/// An immutable assignment of values to searched parameters.
///
/// Two configurations are equal exactly when they assign the same value to
/// the same set of parameter names. A configuration may cover only a subset
/// of the simulator's dimensions; the rest come from the study's fixed map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: BTreeMap<String, u64>,
}

impl Configuration {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        Self {
            values: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, u64)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", name, value)?;
            first = false;
        }
        Ok(())
    }
}
