pub mod dedup;
pub mod invoke;
pub mod parse;
pub mod scheduler;
pub mod study;
pub mod suggest;

pub use dedup::{Claim, ClaimError, DedupGuard};
pub use invoke::{Invoker, ResolvedParams, RunResult};
pub use parse::classify;
pub use scheduler::{stagger_delay, SearchReport, SearchRunner};
pub use study::{SamplerKind, StudyConfig, ValidationCheck};
pub use suggest::{build_suggester, GridSuggester, RandomSuggester, SuggestError, Suggester};
