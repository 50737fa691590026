pub mod adaptor;
pub mod channel;
pub mod error;
pub mod request;
pub mod response;

pub use adaptor::TaskAdaptor;
pub use channel::{ChannelContext, ChannelType, RegisteredChannel, DEFAULT_TIMEOUT};
pub use error::{TaskError, TransportError};
pub use request::{UpstreamRequest, ValidatedRequest};
pub use response::{SubmittedTask, UpstreamResponse};
