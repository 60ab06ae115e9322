pub mod error;
pub mod manager;
pub mod negotiator;
pub mod precondition;
pub mod session;

pub use error::{NegotiationError, NegotiationFailure, PreconditionError, SessionError};
pub use manager::ConnectionManager;
pub use negotiator::{BrokerConfig, BrokerNegotiator, Negotiator};
pub use precondition::ProviderKeySource;
pub use session::{
    ConnectionPhase, ConnectionState, ErrorInfo, ErrorKind, SessionCredential, SessionOptions,
    SessionProfile, SessionRequest, TransportParams, Voice,
};
