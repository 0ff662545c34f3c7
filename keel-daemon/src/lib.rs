//! keel daemon runtime: source watcher, scheduler loop, drift loop and the
//! control socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_delete, request_status, request_stop, request_sync, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{init_tracing, run, serve, start_blocking, Activity, DaemonContext};
