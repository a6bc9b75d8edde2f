//! Strongly typed identifiers shared by the registry, ledger, lifecycle, and stream.

// std
use std::{borrow::Borrow, ops::Deref};
// crates.io
use rand::{Rng, distr::Alphanumeric};
// self
use crate::_prelude::*;

macro_rules! def_id {
	($name:ident, $doc:literal, $kind:literal) => {
		#[doc = $doc]
		#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);
		impl $name {
			/// Creates a new identifier after validation.
			pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
				let view = value.as_ref();

				validate_view($kind, view)?;

				Ok(Self(view.to_owned()))
			}
		}
		impl Deref for $name {
			type Target = str;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}
		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
		impl From<$name> for String {
			fn from(value: $name) -> Self {
				value.0
			}
		}
		impl TryFrom<String> for $name {
			type Error = IdentifierError;

			fn try_from(value: String) -> Result<Self, Self::Error> {
				validate_view($kind, &value)?;

				Ok(Self(value))
			}
		}
		impl Borrow<str> for $name {
			fn borrow(&self) -> &str {
				&self.0
			}
		}
		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				write!(f, concat!($kind, "({})"), self.0)
			}
		}
		impl Display for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				f.write_str(&self.0)
			}
		}
		impl FromStr for $name {
			type Err = IdentifierError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}
	};
}

const IDENTIFIER_MAX_LEN: usize = 128;
const GENERATED_ID_LEN: usize = 20;

/// Error returned when identifier validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum IdentifierError {
	/// The identifier was empty.
	#[error("{kind} identifier cannot be empty.")]
	Empty {
		/// Kind of identifier (application, target, provider).
		kind: &'static str,
	},
	/// The identifier contains whitespace characters.
	#[error("{kind} identifier contains whitespace.")]
	ContainsWhitespace {
		/// Kind of identifier (application, target, provider).
		kind: &'static str,
	},
	/// The identifier exceeded the allowed character count.
	#[error("{kind} identifier exceeds {max} characters.")]
	TooLong {
		/// Kind of identifier (application, target, provider).
		kind: &'static str,
		/// Maximum permitted character count.
		max: usize,
	},
}

def_id! { ApplicationId, "Opaque identifier of a registered upstream OAuth application.", "Application" }
def_id! { TargetId, "Identifier of the upstream live chat a session reads from.", "Target" }
def_id! { ProviderId, "Identifier for an OAuth provider descriptor.", "Provider" }

impl ApplicationId {
	/// Generates a fresh random identifier for a newly registered application.
	pub fn generate() -> Self {
		let suffix: String =
			rand::rng().sample_iter(Alphanumeric).take(GENERATED_ID_LEN).map(char::from).collect();

		Self(format!("app-{}", suffix.to_ascii_lowercase()))
	}
}

fn validate_view(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	if view.is_empty() {
		return Err(IdentifierError::Empty { kind });
	}
	if view.chars().any(char::is_whitespace) {
		return Err(IdentifierError::ContainsWhitespace { kind });
	}
	if view.len() > IDENTIFIER_MAX_LEN {
		return Err(IdentifierError::TooLong { kind, max: IDENTIFIER_MAX_LEN });
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn identifiers_reject_whitespace_and_empty_values() {
		assert!(ApplicationId::new(" app-1").is_err(), "Leading whitespace must be rejected.");
		assert!(TargetId::new("chat 1").is_err());
		assert!(ProviderId::new("").is_err());

		let id = ApplicationId::new("app-1").expect("Application fixture should be valid.");

		assert_eq!(id.as_ref(), "app-1");
		assert_eq!(format!("{id:?}"), "Application(app-1)");
	}

	#[test]
	fn generated_ids_are_unique_and_valid() {
		let first = ApplicationId::generate();
		let second = ApplicationId::generate();

		assert_ne!(first, second);
		assert!(first.starts_with("app-"));
		ApplicationId::new(first.as_ref()).expect("Generated identifiers should validate.");
	}

	#[test]
	fn serde_round_trip_enforces_validation() {
		let id: ApplicationId =
			serde_json::from_str("\"app-42\"").expect("Identifier should deserialize.");

		assert_eq!(id.as_ref(), "app-42");
		assert!(serde_json::from_str::<ApplicationId>("\"with space\"").is_err());

		let exact = "a".repeat(IDENTIFIER_MAX_LEN);

		TargetId::new(&exact).expect("Exact length should succeed.");
		assert!(TargetId::new("a".repeat(IDENTIFIER_MAX_LEN + 1)).is_err());
	}

	#[test]
	fn borrow_supports_fast_lookup() {
		let map: HashMap<ApplicationId, u8> = HashMap::from_iter([(
			ApplicationId::new("app-123").expect("Application used for lookup should be valid."),
			7_u8,
		)]);

		assert_eq!(map.get("app-123"), Some(&7));
	}
}
