//! Accounting record assembly, persistence and delivery

mod assembly;
mod outbox;
mod writer;

pub use assembly::{ImageResolver, NoImages, RecordAssembler, StaticImages};
pub use outbox::{DirectoryOutbox, RecordPublisher};
pub use writer::RecordWriter;
