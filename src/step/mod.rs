//! The Step Runtime (spec §4.4): turns a Response into zero or more typed
//! yields by invoking the continuation named on the Request.

mod context;
mod registry;
mod yields;

pub use context::{prepare_context, StepContext};
pub use registry::{Capability, StepBuilder, StepDescriptor, StepError, StepRegistry};
pub use yields::{
    resolve_priority, ParsedData, StepHandle, ValidatorRef, Yield, YieldedEstimate,
    YieldedRequest, YieldedResult,
};
