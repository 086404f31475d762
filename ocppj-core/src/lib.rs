//! # OCPP-J Core
//!
//! Message correlation and dispatch engine for OCPP-J (OCPP over
//! WebSocket JSON), usable from either side of the link.
//!
//! ## Architecture
//!
//! ```text
//!          send_request / call::<F>
//!                  │
//!                  ▼
//! ┌──────────────────────────────────────┐
//! │ Connection                           │
//! │  ┌──────────┐   ┌──────────────────┐ │
//! │  │ Profile  │   │ CorrelationQueue │ │
//! │  │ Registry │   │ 1 in flight +    │ │
//! │  └──────────┘   │ FIFO buffer      │ │
//! │  ┌──────────┐   └──────────────────┘ │
//! │  │ Router   │◄── inbound CALL        │
//! │  └──────────┘                        │
//! └──────────────┬───────────────────────┘
//!                │ text frames
//!                ▼
//!        Transport (WebSocket, memory)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocppj_core::catalog::{self, provisioning::{Heartbeat, HeartbeatRequest}};
//! use ocppj_core::{Connection, ConnectionConfig, Role, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = Connection::builder(ConnectionConfig::new(Role::ChargingStation, "CS001"))
//!         .with_registry(catalog::registry()?)
//!         .build()?;
//!
//!     conn.start(&WebSocketTransport::new(), "ws://localhost:8180/ocpp/CS001").await?;
//!     let response = conn.call::<Heartbeat>(HeartbeatRequest {}).await?;
//!     println!("CSMS time: {}", response.current_time);
//!
//!     conn.stop();
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod connection;
pub mod error;
pub mod messages;
pub mod profile;
pub mod queue;
pub mod router;
pub mod timer;
pub mod transport;
pub mod validation;

pub use connection::{Connection, ConnectionBuilder, ConnectionConfig};
pub use error::{ErrorCode, ErrorReporter, OcppError};
pub use messages::{Call, CallError, CallResult, IdStrategy, MessageIdGenerator, OcppMessage};
pub use profile::{ActionDescriptor, Direction, Feature, Profile, ProfileRegistry, Role};
pub use queue::{CallOutcome, CorrelationQueue};
pub use router::{ActionHandlers, HandlerError, HandlerTable, ProfileHandler, Router};
pub use timer::{ManualTimer, Timer, TimerHandle, TokioTimer};
pub use transport::{memory_pair, FrameSender, Link, MemoryTransport, Transport, WebSocketTransport};
pub use validation::{AcceptAll, PayloadValidator, Validate, Violation, ViolationKind};
