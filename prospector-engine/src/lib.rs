//! # prospector-engine
//!
//! Campaign orchestration engine for multi-phase domain lead-generation
//! pipelines: deterministic domain generation from combinatorial patterns,
//! DNS validation through resolver personas, HTTP keyword validation through
//! rotating proxy/persona pairs, and an analysis step that yields leads.
//!
//! The engine is transport-agnostic: DNS and HTTP probes go through injected
//! clients, persistence goes through the [`store::EngineStore`] trait, and
//! events leave through pluggable sinks. An HTTP adapter sits on top of
//! [`orchestrator::Orchestrator`]; it is not part of this crate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use prospector_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = EngineConfig::load()?;
//!     init_tracing(&config)?;
//!
//!     let engine = Engine::builder(config).start();
//!     let campaign = engine
//!         .orchestrator()
//!         .create_campaign(NewCampaign {
//!             name: "spring-widgets".into(),
//!             owner_id: "ops".into(),
//!             pattern: PatternSpec {
//!                 pattern_type: PatternType::Prefix,
//!                 variable_length: 4,
//!                 character_set: "abcdefghijklmnopqrstuvwxyz".into(),
//!                 constant_string: "widgets".into(),
//!                 tld: "com".into(),
//!             },
//!             requested_count: 10_000,
//!         })
//!         .await?;
//!     engine
//!         .orchestrator()
//!         .start_phase("ops", campaign.id, Phase::Generation)
//!         .await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod clients;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod keywords;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod pattern;
pub mod queue;
pub mod rotation;
pub mod store;
pub mod workers;

#[cfg(feature = "resolver")]
pub mod resolver;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EngineEvent, EventEnvelope};
    pub use crate::model::{
        Campaign, DnsPhaseConfig, GenerationConfig, HttpPhaseConfig, NewCampaign, Persona,
        PersonaConfig, Phase, PhaseStatus, Proxy, RotationStrategy,
    };
    pub use crate::observability::init_tracing;
    pub use crate::orchestrator::{Orchestrator, PhaseConfig};
    pub use crate::pattern::{PatternSpec, PatternType};
    pub use crate::store::{EngineStore, Page};
}
