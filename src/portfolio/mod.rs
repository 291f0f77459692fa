pub mod aggregator;
pub mod exporter;

pub use aggregator::{
    PnlTrack, PortfolioAggregator, PortfolioDelta, PortfolioState, SCHEMA_VERSION,
};
pub use exporter::SnapshotExporter;
