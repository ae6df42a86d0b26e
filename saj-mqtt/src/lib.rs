//! SAJ MQTT Client
//!
//! Modbus register reads and writes against a SAJ inverter that is only
//! reachable through its MQTT broker. Requests are published on
//! `saj/<serial>/data_transmission`; the inverter answers on
//! `saj/<serial>/data_transmission_rsp`.
//!
//! # Overview
//!
//! - [`crc`] - Modbus CRC16
//! - [`frame`] - Request and response frame codec
//! - [`Correlator`] - Pending request table matching responses to callers
//! - [`Session`] - Broker connection and the inbound pump
//! - [`SajClient`] - `query`/`write` façade with chunking and timeouts
//!
//! # Example
//!
//! ```ignore
//! use saj_common::BaseConfig;
//! use saj_mqtt::SajClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: BaseConfig = saj_common::load_config("saj.json5")?;
//!     let client = SajClient::connect(&config).await?;
//!
//!     let data = client.query(0x40a1, 1).await?;
//!     let meter = i16::from_be_bytes([data[0], data[1]]);
//!     println!("meter: {} W", meter);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod correlator;
pub mod crc;
pub mod error;
pub mod frame;
pub mod link;
pub mod session;

pub use client::{SajClient, chunk_ranges};
pub use correlator::{Correlator, Payload, PendingRequests, Resolution};
pub use error::{FrameError, Result, SajError};
pub use frame::{RequestKey, RequestKind};
pub use link::{ChannelLink, Link, MqttLink, PublishedFrame};
pub use session::{Dispatch, Session, SessionState, dispatch};
