//! Profile (kind 0) publish and import.

mod importer;
mod publisher;
mod types;
mod url_safety;

pub use importer::{ImportedProfile, ProfileImporter};
pub use publisher::{next_created_at, ProfilePublishResult, ProfilePublisher};
pub use types::{merge_profiles, ProfileContent};
pub use url_safety::{check_url, validate_url_safety};
