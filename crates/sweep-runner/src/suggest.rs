use rand::seq::SliceRandom;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use sweep_core::{Configuration, Outcome, ParamDomains};

use crate::study::SamplerKind;

#[derive(Debug, Error)]
pub enum SuggestError {
    #[error("search_space_exhausted: all {total} combinations have been suggested")]
    Exhausted { total: u64 },

    #[error("empty_search_space: no searchable dimensions configured")]
    EmptySpace,
}

/// The sampling-policy seam. The dedup guard calls `suggest` while holding
/// the study lock; the scheduler reports every terminal outcome back through
/// `observe` so model-based implementations can update their state.
pub trait Suggester: Send + Sync {
    fn suggest(&self, domains: &ParamDomains) -> Result<Configuration, SuggestError>;

    fn observe(&self, _configuration: &Configuration, _outcome: &Outcome) {}
}

pub fn build_suggester(kind: SamplerKind) -> Box<dyn Suggester> {
    match kind {
        SamplerKind::Grid => Box::new(GridSuggester::new()),
        SamplerKind::Random => Box::new(RandomSuggester),
    }
}

/// Exhaustive cartesian enumeration. The cursor is decoded mixed-radix with
/// the first domain as the fastest-varying digit; once every combination has
/// been handed out the suggester reports the space exhausted instead of
/// wrapping around.
pub struct GridSuggester {
    cursor: Mutex<u64>,
}

impl GridSuggester {
    pub fn new() -> Self {
        Self {
            cursor: Mutex::new(0),
        }
    }
}

impl Default for GridSuggester {
    fn default() -> Self {
        Self::new()
    }
}

impl Suggester for GridSuggester {
    fn suggest(&self, domains: &ParamDomains) -> Result<Configuration, SuggestError> {
        let total = domains.cardinality();
        if total == 0 {
            return Err(SuggestError::EmptySpace);
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if *cursor >= total {
            return Err(SuggestError::Exhausted { total });
        }
        let mut remainder = *cursor;
        *cursor += 1;
        drop(cursor);

        let mut pairs = Vec::with_capacity(domains.len());
        for domain in domains.iter() {
            let radix = domain.choices.len() as u64;
            let idx = (remainder % radix) as usize;
            remainder /= radix;
            pairs.push((domain.name.clone(), domain.choices[idx]));
        }
        Ok(Configuration::from_pairs(pairs))
    }
}

/// Independent uniform choice per dimension. Duplicate suggestions are
/// expected and handled by the dedup guard, not here.
pub struct RandomSuggester;

impl Suggester for RandomSuggester {
    fn suggest(&self, domains: &ParamDomains) -> Result<Configuration, SuggestError> {
        if domains.is_empty() {
            return Err(SuggestError::EmptySpace);
        }
        let mut rng = rand::thread_rng();
        let mut pairs = Vec::with_capacity(domains.len());
        for domain in domains.iter() {
            let value = domain
                .choices
                .choose(&mut rng)
                .copied()
                .ok_or(SuggestError::EmptySpace)?;
            pairs.push((domain.name.clone(), value));
        }
        Ok(Configuration::from_pairs(pairs))
    }
}
