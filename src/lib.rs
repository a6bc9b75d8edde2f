//! Live-chat ingestion under a shared daily quota: per-application OAuth token lifecycles, a
//! DST-correct quota ledger, and a quota-paced polling loop in one crate built for long-running
//! bots.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod oauth;
pub mod obs;
pub mod provider;
pub mod quota;
pub mod registry;
pub mod store;
pub mod stream;
pub mod timer;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and test doubles for unit and integration tests; enabled via
	//! `cfg(test)` or the `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::collections::VecDeque;
	// self
	use crate::{
		auth::{TokenRecord, TokenSecret},
		clock::ManualClock,
		error::UpstreamError,
		events::{BrokerEvent, EventSink},
		lifecycle::{ApplicationCredentials, TokenEndpoint, TokenEndpointFuture},
		registry::{ApplicationRegistry, NewApplication, QuotaSettings},
		store::MemoryStore,
		stream::{MessageBatch, MessageSource, MessageStream, SourceFuture, StreamRequest},
	};

	/// Fixed instant (2025-03-04 12:00:00 UTC) shared by clock-driven tests.
	pub const TEST_NOW_MILLIS: i64 = 1_741_089_600_000;

	/// Event sink that records every emitted event for later inspection.
	#[derive(Debug, Default)]
	pub struct RecordingSink(Mutex<Vec<(String, BrokerEvent)>>);
	impl RecordingSink {
		/// Returns a snapshot of all recorded events.
		pub fn events(&self) -> Vec<BrokerEvent> {
			self.0.lock().iter().map(|(_, event)| event.clone()).collect()
		}

		/// Returns the recorded event names in emission order.
		pub fn names(&self) -> Vec<&'static str> {
			self.0.lock().iter().map(|(_, event)| event.name()).collect()
		}

		/// Drops every recorded event.
		pub fn clear(&self) {
			self.0.lock().clear();
		}
	}
	impl EventSink for RecordingSink {
		fn emit(&self, source_id: &str, event: &BrokerEvent) {
			self.0.lock().push((source_id.to_owned(), event.clone()));
		}
	}

	/// Scripted token endpoint that replays queued refresh outcomes.
	#[derive(Debug, Default)]
	pub struct ScriptedTokenEndpoint {
		refresh_outcomes: Mutex<VecDeque<Result<TokenRecord>>>,
		exchange_outcomes: Mutex<VecDeque<Result<TokenRecord>>>,
		/// Refresh tokens observed by each refresh call, in order.
		pub seen_refresh_tokens: Mutex<Vec<String>>,
	}
	impl ScriptedTokenEndpoint {
		/// Queues a refresh outcome.
		pub fn push_refresh(&self, outcome: Result<TokenRecord>) {
			self.refresh_outcomes.lock().push_back(outcome);
		}

		/// Queues a code exchange outcome.
		pub fn push_exchange(&self, outcome: Result<TokenRecord>) {
			self.exchange_outcomes.lock().push_back(outcome);
		}
	}
	impl TokenEndpoint for ScriptedTokenEndpoint {
		fn exchange_code<'a>(
			&'a self,
			_credentials: &'a ApplicationCredentials,
			_code: &'a str,
		) -> TokenEndpointFuture<'a> {
			let outcome = self.exchange_outcomes.lock().pop_front();

			Box::pin(async move {
				outcome.unwrap_or_else(|| {
					Err(Error::InvalidGrant { reason: "No scripted exchange outcome.".into() })
				})
			})
		}

		fn refresh<'a>(
			&'a self,
			_credentials: &'a ApplicationCredentials,
			refresh_token: &'a TokenSecret,
		) -> TokenEndpointFuture<'a> {
			self.seen_refresh_tokens.lock().push(refresh_token.expose().to_owned());

			let outcome = self.refresh_outcomes.lock().pop_front();

			Box::pin(async move {
				outcome.unwrap_or_else(|| {
					Err(Error::InvalidGrant { reason: "No scripted refresh outcome.".into() })
				})
			})
		}
	}

	/// Scripted message source; each call pops the next queued cycle.
	#[derive(Debug, Default)]
	pub struct ScriptedSource {
		cycles: Mutex<VecDeque<Vec<Result<MessageBatch, UpstreamError>>>>,
		/// Requests observed by the source, in order.
		pub requests: Mutex<Vec<StreamRequest>>,
	}
	impl ScriptedSource {
		/// Queues the batches yielded by one `stream_messages` call.
		pub fn push_cycle(&self, batches: Vec<Result<MessageBatch, UpstreamError>>) {
			self.cycles.lock().push_back(batches);
		}

		/// Number of calls observed so far.
		pub fn calls(&self) -> usize {
			self.requests.lock().len()
		}
	}
	impl MessageSource for ScriptedSource {
		fn stream_messages(&self, request: StreamRequest) -> SourceFuture<'_> {
			self.requests.lock().push(request);

			let batches = self.cycles.lock().pop_front().unwrap_or_default();

			Box::pin(async move {
				let stream: MessageStream = Box::pin(futures::stream::iter(batches));

				Ok(stream)
			})
		}
	}

	/// Builds a token record that expires an hour after `issued_at`.
	pub fn token_record(access: &str, refresh: Option<&str>) -> TokenRecord {
		let mut builder = TokenRecord::builder()
			.access_token(access)
			.issued_at(OffsetDateTime::now_utc())
			.expires_in(Duration::hours(1));

		if let Some(refresh) = refresh {
			builder = builder.refresh_token(refresh);
		}

		builder.build().expect("Token record fixture should build successfully.")
	}

	/// Builds a registry backed by an in-memory store.
	pub fn memory_registry() -> (Arc<ApplicationRegistry>, Arc<MemoryStore>) {
		let store = Arc::new(MemoryStore::default());
		let registry = Arc::new(ApplicationRegistry::new(store.clone(), "applications.json"));

		(registry, store)
	}

	/// Returns a manual clock pinned to [`TEST_NOW_MILLIS`].
	pub fn manual_clock() -> Arc<ManualClock> {
		Arc::new(ManualClock::new(TEST_NOW_MILLIS))
	}

	/// Standard application fixture with a 10 000 unit quota over 8 active hours.
	pub fn new_application(name: &str, client_id: &str) -> NewApplication {
		NewApplication {
			name: name.into(),
			client_id: client_id.into(),
			client_secret: format!("{client_id}-secret"),
			quota_settings: QuotaSettings::default(),
		}
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap, HashSet, hash_map::DefaultHasher},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		hash::{Hash, Hasher},
		pin::Pin,
		str::FromStr,
		sync::{Arc, Weak},
		time::Duration as StdDuration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
