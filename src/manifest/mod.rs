pub mod model;
pub mod registry;

pub use model::{
    FeatureSet, InstrumentSpec, RiskRules, RouterRules, RunnerSpec, StateSpec, StrategyManifest,
};
pub use registry::{LookupMiss, ManifestRegistry};
