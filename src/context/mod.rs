pub mod assembler;
pub mod reference;

pub use assembler::{
    AssembledContext, AssembledReference, ContextAssembler, ContextError, ContextReadySummary,
};
pub use reference::{
    ContextReference, EntityType, ReferenceError, ReferenceRepository, ReferenceSource,
};
