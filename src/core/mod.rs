//! Connectivity-gated cloud session core.
//!
//! ```text
//! network stack -> LinkEventHandler -> ConnectivitySignal -> SessionWorker
//!                                                                 |
//!                                          Session::pump -> MessageDispatcher -> sink
//! ```

pub mod dispatcher;
pub mod link;
pub mod session;
pub mod signal;
pub mod station;
pub mod worker;
