pub mod grid;
pub mod region_proposal;
pub mod stub;
pub mod transformer;

pub use grid::{GridDetector, GridDetectorConfig};
pub use region_proposal::{RegionProposalConfig, RegionProposalDetector};
pub use stub::StubBackend;
pub use transformer::{TransformerDetector, TransformerDetectorConfig};
