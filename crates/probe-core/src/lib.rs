pub mod accountant;
pub mod census;
pub mod client;
pub mod config;
pub mod connector;
pub mod driver;
pub mod governor;
pub mod instrument;
pub mod sampler;
pub mod scenario;
pub mod stage;
pub mod stats;
pub mod telemetry;
pub mod tracer;
pub mod transport;

pub use accountant::{ConnectionAccountant, ConnectionCounts};
pub use census::{parse_netstat, Census, CensusSample, NetstatCounts};
pub use client::{preset, ClientProfile, ClientSpec, PooledClient, Protocol, PRESETS};
pub use config::*;
pub use driver::{DriverState, LoadDriver, RunReport, StageReport};
pub use governor::{AdmissionError, Governor, Slot};
pub use instrument::Instrumented;
pub use sampler::{Sampler, Snapshot};
pub use scenario::{Catalog, CatalogError, Scenario};
pub use stage::*;
pub use stats::*;
pub use tracer::{ConnInfo, RequestTrace, TraceRecord};
pub use transport::{Exchange, SendFuture, StubTransport, Transport, TransportError};
