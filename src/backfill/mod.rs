pub mod merge;
pub mod provider;

pub use merge::MergedProvider;
pub use provider::{PacedFetcher, ProviderError, RestProvider};
