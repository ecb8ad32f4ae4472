//! Instrument abstraction: typed settings and metrics, the [`Instrument`]
//! driver trait, concrete drivers, and the SCPI transports they run on.

pub mod error;
pub mod generic;
pub mod power_supply;
pub mod retry;
pub mod signal_generator;
pub mod sim;
pub mod trait_def;
pub mod transport;
pub mod types;

pub use error::InstrumentError;
pub use generic::GenericScpi;
pub use power_supply::PowerSupply;
pub use retry::RetryPolicy;
pub use signal_generator::SignalGenerator;
pub use sim::{SimHandle, SimScpi, SimTransportFactory};
pub use trait_def::Instrument;
pub use transport::{ScpiTransport, TcpScpi, TcpTransportFactory, TransportFactory};
pub use types::{
    Capability, CapabilitySet, Endpoint, InstrumentKind, InstrumentState, LevelEdge, Measurement,
    Metric, Setting, Unit,
};
