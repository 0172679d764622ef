//! RPC subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP/2 request (tonic transport)
//!     → interceptor/metrics.rs (count, start timer)
//!     → interceptor/trace.rs (span, trace context into extensions)
//!     → interceptor/recovery.rs (panic → Internal)
//!     → server.rs routes (by path; unknown → Unimplemented)
//!     → method.rs (tonic framing, size limits) → handler
//! ```

pub mod call;
pub mod health;
pub mod interceptor;
pub mod method;
pub mod server;

pub use call::{MessageStream, MethodInfo, MethodKind, MethodTable};
pub use health::{HealthReporter, ServingStatus};
pub use interceptor::InterceptorChain;
pub use method::PassthroughCodec;
pub use server::{BoundRpcServer, RpcServer, RpcServerError, ServerOptions};
pub use tonic::{Code, Request, Response, Status};
