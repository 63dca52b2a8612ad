pub mod artifact;
pub mod vm;

pub use artifact::Artifact;
pub use vm::VmId;
