//! Identity-Aware Proxy authentication for outbound HTTP: single-flight ID token caching,
//! audience resolution, and a one-shot 401 retry shared by blocking and async clients.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod audience;
pub mod auth;
pub mod cache;
pub mod config;
pub mod credential;
pub mod error;
pub mod flow;
pub mod http;
pub mod issuer;
pub mod obs;

pub use cache::TokenCache;
pub use config::IapSettings;
pub use error::{Error, Result};
pub use flow::{AuthFlow, IapAuth};

mod _prelude {
	pub use std::{
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use parking_lot::{Mutex, RwLock};
	pub use reqwest::Error as ReqwestError;
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use oauth2;
pub use reqwest;
pub use url;
#[cfg(test)] use httpmock as _;
