pub mod brand;
pub mod jobs;
pub mod status;

pub use brand::{AspectRatio, BrandIdentity, ColorTriad, ContentBrief, PosterCopy};
pub use jobs::{GenerationJob, JobStatus, JobStore};
pub use status::{FileStatusStore, StatusStore, StatusUpdate};
