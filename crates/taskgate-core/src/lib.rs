pub mod account;
pub mod core;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod relay;
pub mod response;
pub mod store;
pub mod sync;
pub mod token;

pub use crate::core::{Core, CoreState};
pub use account::AccountService;
pub use error::{AccountError, LedgerError, RelayError, StoreError, TokenError};
pub use ledger::{QuotaLedger, QuotaRates};
pub use relay::{Caller, ChannelLookup, TaskRelay};
pub use store::{MemoryStore, Stores};
pub use token::TokenService;

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
