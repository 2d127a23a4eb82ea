//! Outbox dispatch engine.
//!
//! Delivers queued actions to the remote backend through per-type
//! processors, retrying transient failures with exponential backoff and
//! sweeping terminal records in the background.

pub mod backoff;
pub mod dispatcher;
pub mod error;
pub mod processor;
pub mod remote;
pub mod retention;

pub use backoff::Backoff;
pub use dispatcher::{Dispatcher, PassReport};
pub use error::{DispatchError, ProcessError, RemoteError};
pub use processor::{EndpointShape, Processor, ProcessorRegistry, ResponseClass};
pub use remote::{HttpMethod, HttpRemote, MockRemote, RemoteApi, RemoteRequest, RemoteResponse};
pub use retention::RetentionTask;
