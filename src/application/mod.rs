pub mod candidates;
pub mod cluster;
pub mod exif_meta;
pub mod maintenance;
pub mod scheduler;
pub mod worker;

pub use candidates::CandidateSet;
pub use cluster::{ClusterEngine, ReclusterStats};
pub use maintenance::{cleanup, fix_orientation, merge_duplicates, prune, MergeReport, OrientationReport, PruneReport};
pub use scheduler::{IngestOptions, IngestSummary, Scheduler};
pub use worker::{process_image, WorkerOutcome};
