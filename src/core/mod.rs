pub mod admin;
pub mod chain_binding;
pub mod code_registry;
pub mod engine;
pub mod fraud;
pub mod outbox;
pub mod progression;
pub mod registration;
pub mod statistics;
pub mod stats_cache;
pub mod transaction;

pub use crate::domain::model::{Member, MemberStatistics, ReferralCodeRecord};
pub use crate::domain::ports::{ConfigProvider, DocumentStore, Notifier};
pub use crate::utils::error::Result;
