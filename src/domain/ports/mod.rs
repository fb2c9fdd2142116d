mod edge_transport;
mod origin_dialer;
mod origin_resolver;

pub use edge_transport::{EdgeConnection, EdgeConnector, EdgeStream, InboundStream, TransportError};
pub use origin_dialer::{OriginDialer, OriginError, OriginIo};
pub use origin_resolver::{OriginEndpoint, OriginResolver, ResolveError};
