mod args;
mod driver;
mod input;
mod write;

pub use args::*;
pub use driver::{FragTreer, FragTreerError};
pub use input::{CandidateRecord, InputDocument, InstanceRecord};
pub use write::{write_output, ExclusionRecord, InstanceOutput};
