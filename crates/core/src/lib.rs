pub mod candidate;
pub mod clock;
pub mod config;
pub mod entity;
pub mod gl;
pub mod pattern;
pub mod transaction;

pub use candidate::{Candidate, MatchTier};
pub use clock::{Clock, FrozenClock, SystemClock};
pub use config::{ConfigError, Settings};
pub use entity::{normalize_iban, normalize_name, Entity, EntityMap};
pub use gl::GlEntry;
pub use pattern::{Pattern, PatternKind, TargetKind};
pub use transaction::{
    BankTransaction, CardDetails, Direction, FxDetails, MatchStatus, TransactionKind,
};
