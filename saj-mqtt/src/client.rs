//! Request façade.
//!
//! [`SajClient`] turns register reads and writes into request frames,
//! registers them with the session's correlator, publishes them and waits
//! for every response of the call under one deadline.

use std::time::Duration;

use tracing::{debug, info};

use saj_common::{BaseConfig, MODBUS_MAX_READ_REGISTERS};

use crate::correlator::PendingRequests;
use crate::error::{Result, SajError};
use crate::frame::{self, RequestKey};
use crate::session::{Session, SessionState};

/// Split `[start, start + count)` into consecutive `(start, count)` chunks of
/// at most `max` registers.
pub fn chunk_ranges(start: u16, count: u16, max: u16) -> Result<Vec<(u16, u16)>> {
    if max == 0 || max > MODBUS_MAX_READ_REGISTERS {
        return Err(SajError::invalid_request(format!(
            "registers per request must be 1-{}, got {}",
            MODBUS_MAX_READ_REGISTERS, max
        )));
    }

    let end = u32::from(start) + u32::from(count);
    if end > u32::from(u16::MAX) + 1 {
        return Err(SajError::invalid_request(format!(
            "range {:#06x}+{} runs past register 0xffff",
            start, count
        )));
    }

    let mut chunks = Vec::new();
    let mut next = u32::from(start);
    while next < end {
        let size = (end - next).min(u32::from(max));
        // Both fit: next < end <= 0x10000 and size <= max.
        chunks.push((next as u16, size as u16));
        next += size;
    }
    Ok(chunks)
}

/// Client for one inverter.
#[derive(Debug)]
pub struct SajClient {
    session: Session,
    slave_address: u8,
    timeout: Duration,
    max_registers: u16,
}

impl SajClient {
    /// Connect to the broker described by `config`.
    pub async fn connect(config: &BaseConfig) -> Result<Self> {
        config.validate()?;
        let session = Session::connect(&config.mqtt, &config.device, &config.requests).await?;
        Ok(Self::with_session(session, config))
    }

    /// Build a client on top of an existing session.
    pub fn with_session(session: Session, config: &BaseConfig) -> Self {
        Self {
            session,
            slave_address: config.device.slave_address,
            timeout: config.requests.timeout(),
            max_registers: config.requests.max_registers_per_request,
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending(&self) -> usize {
        self.session.correlator().len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.session.is_connected() {
            Ok(())
        } else {
            Err(SajError::NotConnected)
        }
    }

    /// Read `count` registers starting at `start`.
    ///
    /// Returns `2 * count` bytes, big-endian per register, in address order.
    /// Ranges larger than the per-request maximum are split into several
    /// requests that share a single deadline; any failing chunk fails the
    /// whole call.
    pub async fn query(&self, start: u16, count: u16) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let chunks = chunk_ranges(start, count, self.max_registers)?;
        let mut pending = PendingRequests::new(self.session.correlator());

        let mut frames = Vec::with_capacity(chunks.len());
        for &(chunk_start, chunk_count) in &chunks {
            let (_, bytes) = register_unique(&mut pending, || {
                frame::build_read_request(chunk_start, chunk_count, self.slave_address)
            });
            frames.push(bytes);
        }

        debug!(
            start = format_args!("{:#06x}", start),
            count,
            chunks = chunks.len(),
            "Querying registers"
        );

        self.publish_all(frames).await?;
        let resolutions = pending.wait(self.timeout).await?;

        let mut data = Vec::with_capacity(usize::from(count) * 2);
        for ((chunk_start, chunk_count), resolution) in chunks.into_iter().zip(resolutions) {
            let bytes = resolution?.into_registers()?;
            if bytes.len() != usize::from(chunk_count) * 2 {
                return Err(SajError::Protocol(format!(
                    "read of {} registers at {:#06x} returned {} bytes",
                    chunk_count,
                    chunk_start,
                    bytes.len()
                )));
            }
            data.extend_from_slice(&bytes);
        }

        Ok(data)
    }

    /// Write `value` to a single holding register.
    ///
    /// Returns the value echoed by the device.
    pub async fn write(&self, register: u16, value: u16) -> Result<u16> {
        self.ensure_connected()?;

        let mut pending = PendingRequests::new(self.session.correlator());
        let (key, bytes) = register_unique(&mut pending, || {
            frame::build_write_request(register, value, self.slave_address)
        });

        debug!(
            register = format_args!("{:#06x}", register),
            value,
            request = %key,
            "Writing register"
        );

        self.publish_all(vec![bytes]).await?;
        let mut resolutions = pending.wait(self.timeout).await?;

        match resolutions.pop() {
            Some(resolution) => resolution?.into_value(),
            None => Err(SajError::Protocol("missing write response".to_string())),
        }
    }

    /// Publish every frame, stopping at the first failure.
    ///
    /// The caller's [`PendingRequests`] purges the registered keys when the
    /// error propagates.
    async fn publish_all(&self, frames: Vec<Vec<u8>>) -> Result<()> {
        for bytes in frames {
            self.session.publish(bytes).await?;
        }
        Ok(())
    }

    /// Disconnect from the broker.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
        info!("Client shut down");
    }
}

/// Build frames until one registers under a key that is not in flight.
fn register_unique<F>(pending: &mut PendingRequests, mut build: F) -> (RequestKey, Vec<u8>)
where
    F: FnMut() -> (RequestKey, Vec<u8>),
{
    loop {
        let (key, bytes) = build();
        if pending.register(key) {
            return (key, bytes);
        }
        debug!(request = %key, "Request id already in flight, drawing another");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges_splits_evenly() {
        let chunks = chunk_ranges(0x4000, 250, 100).unwrap();
        assert_eq!(chunks, vec![(0x4000, 100), (0x4064, 100), (0x40c8, 50)]);
    }

    #[test]
    fn test_chunk_ranges_single() {
        assert_eq!(chunk_ranges(0x40a1, 1, 100).unwrap(), vec![(0x40a1, 1)]);
        assert_eq!(chunk_ranges(0, 100, 100).unwrap(), vec![(0, 100)]);
        assert!(chunk_ranges(0, 0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_ranges_top_of_address_space() {
        assert_eq!(
            chunk_ranges(0xfffe, 2, 100).unwrap(),
            vec![(0xfffe, 2)]
        );
        assert!(matches!(
            chunk_ranges(0xfffe, 3, 100),
            Err(SajError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_chunk_ranges_rejects_bad_maximum() {
        assert!(chunk_ranges(0, 10, 0).is_err());
        assert!(chunk_ranges(0, 10, 124).is_err());
    }

    #[test]
    fn test_register_unique_redraws_on_collision() {
        let correlator = std::sync::Arc::new(crate::correlator::Correlator::new());
        let taken = RequestKey::new(7, frame::RequestKind::Read);
        correlator.register(taken);

        let mut pending = PendingRequests::new(correlator.clone());
        let mut ids = vec![8u16, 7, 7].into_iter().rev();
        let (key, bytes) = register_unique(&mut pending, || {
            let id = ids.next().unwrap_or(9);
            (RequestKey::new(id, frame::RequestKind::Read), vec![id as u8])
        });

        assert_eq!(key.id, 8);
        assert_eq!(bytes, vec![8]);
        assert_eq!(pending.keys(), &[key]);
        assert_eq!(correlator.len(), 2);

        // Only the guard's own key goes away with it.
        drop(pending);
        assert!(correlator.is_pending(&taken));
        assert_eq!(correlator.len(), 1);
    }
}
