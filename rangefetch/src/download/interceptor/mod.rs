//! Interceptors composing a block's pipeline.
//!
//! Connect order:
//!
//! ```text
//! Retry → Breakpoint → Redirect → Header → CallServer
//! ```
//!
//! Fetch order:
//!
//! ```text
//! Retry → Breakpoint → FetchData
//! ```
//!
//! The outer interceptors wrap the inner ones by calling back into the
//! chain, so retry sees every failure below it and the breakpoint
//! interceptor sees the response after redirects were followed.

mod breakpoint;
mod call_server;
mod fetch_data;
mod header;
mod redirect;
mod retry;

use std::sync::Arc;

pub use breakpoint::BreakpointInterceptor;
pub use call_server::CallServerInterceptor;
pub use fetch_data::FetchDataInterceptor;
pub use header::HeaderInterceptor;
pub use redirect::{RedirectInterceptor, MAX_REDIRECTS};
pub use retry::RetryInterceptor;

use super::chain::DownloadChain;
use crate::connection::Connected;
use crate::error::DownloadResult;

/// A step of the connect phase.
pub trait ConnectInterceptor: Send + Sync {
    fn intercept_connect(&self, chain: &mut DownloadChain) -> DownloadResult<Box<dyn Connected>>;
}

/// A step of the fetch phase. Returns the bytes handled, `0` at end of body.
pub trait FetchInterceptor: Send + Sync {
    fn intercept_fetch(&self, chain: &mut DownloadChain) -> DownloadResult<u64>;
}

/// The interceptor lists shared by every chain of an engine.
pub struct Interceptors {
    pub connect: Vec<Arc<dyn ConnectInterceptor>>,
    pub fetch: Vec<Arc<dyn FetchInterceptor>>,
}

impl Default for Interceptors {
    fn default() -> Self {
        let retry = Arc::new(RetryInterceptor);
        let breakpoint = Arc::new(BreakpointInterceptor);

        let connect: Vec<Arc<dyn ConnectInterceptor>> = vec![
            retry.clone() as Arc<dyn ConnectInterceptor>,
            breakpoint.clone() as Arc<dyn ConnectInterceptor>,
            Arc::new(RedirectInterceptor) as Arc<dyn ConnectInterceptor>,
            Arc::new(HeaderInterceptor) as Arc<dyn ConnectInterceptor>,
            Arc::new(CallServerInterceptor) as Arc<dyn ConnectInterceptor>,
        ];
        let fetch: Vec<Arc<dyn FetchInterceptor>> = vec![
            retry as Arc<dyn FetchInterceptor>,
            breakpoint as Arc<dyn FetchInterceptor>,
            Arc::new(FetchDataInterceptor) as Arc<dyn FetchInterceptor>,
        ];
        Self { connect, fetch }
    }
}
