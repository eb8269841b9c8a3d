pub use crate::config::StampedeConfiguration;
pub use crate::logger::LogFormat;
pub use crate::metrics::{ActionFailure, Outcome, RunSummary};
pub use crate::shutdown::StopSignal;
pub use crate::transport::{ReqwestTransport, Response, Transport, TransportError};
pub use crate::workload::{
    ActionDefinition, CheckDefinition, Method, Workload, WorkloadDefinition,
};
pub use crate::{LoadTest, RunPhase, StampedeError};
