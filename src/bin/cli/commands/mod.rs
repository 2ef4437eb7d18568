pub mod backups;
pub mod queue;
pub mod recovery;
pub mod status;
pub mod sync;
