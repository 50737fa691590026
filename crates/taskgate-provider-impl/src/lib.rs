pub mod client;
pub mod provider;
pub mod registry;
pub mod upstream;

pub use provider::{ChannelAdaptor, DoubaoAdaptor, DoubaoProtocol};
pub use registry::AdaptorRegistry;
