//! Strongly-typed identifiers for orders and their broker submissions.
//!
//! The engine order id is stable for the whole lifecycle of an order. Each
//! submission of that order to the broker (the first one and every
//! resubmission) is a separate leg with its own client order id.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner string value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(OrderId, "Engine-generated order identifier, independent of any broker id.");
define_id!(BrokerOrderId, "Broker's identifier for one submitted leg.");
define_id!(
    ClientOrderId,
    "Engine-assigned identifier for one submission leg (`{order_id}.{leg}`)."
);

impl OrderId {
    /// Generate a new unique identifier using UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Client order id of the given submission leg of this order.
    #[must_use]
    pub fn leg(&self, leg: usize) -> ClientOrderId {
        ClientOrderId(format!("{}.{leg}", self.0))
    }
}

impl ClientOrderId {
    /// The engine order this leg belongs to, if the id has the leg format.
    #[must_use]
    pub fn order_id(&self) -> Option<OrderId> {
        self.0
            .rsplit_once('.')
            .filter(|(_, leg)| !leg.is_empty() && leg.bytes().all(|b| b.is_ascii_digit()))
            .map(|(order, _)| OrderId::new(order))
    }
}
