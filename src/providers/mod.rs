pub mod transit;

pub use transit::{ProviderError, TransitClient, TransitProvider};
