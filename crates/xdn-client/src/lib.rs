//! # xdn-client: Requests and callbacks for `xdn`
//!
//! A [`Client`] submits [`Request`]s to a reconfiguration coordinator and
//! receives exactly one [`Response`] per request. Each outstanding request
//! waits on its own single-shot channel in a [`CallbackRegistry`]; waits are
//! bounded, and a timed-out request is unregistered so its late response is
//! dropped.
//!
//! ## Usage
//!
//! ```ignore
//! use xdn_client::{ClusterSpec, Harness, Request};
//!
//! let harness = Harness::new(ClusterSpec::default())?;
//! let client = harness.client();
//!
//! client.request(Request::create("svcA", "init")).await?;
//! client.wait_for_exists(&"svcA".into()).await?;
//! let response = client.request(Request::app("svcA", "put x=1")).await?;
//! ```
//!
//! ## Harness
//!
//! [`Harness`] composes an in-process cluster, its coordinator, and the
//! registry its clients share. It is configured by a [`ClusterSpec`], which
//! can also carry a script of requests to run.

mod client;
mod error;
mod harness;
mod message;

pub use client::{CallbackRegistry, Client, ClientConfig, RequestHandle};
pub use error::{ClientError, ClientResult};
pub use harness::{ClusterSpec, Harness, LocalClient, ScriptStep};
pub use message::{NameAck, NameAndState, Request, Response};
