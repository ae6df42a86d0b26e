//! Register access seam used by the control loops.

use async_trait::async_trait;

use saj_mqtt::{SajClient, SajError};

/// Register reads and writes against one inverter.
///
/// Implemented by [`SajClient`]; control loops are written against this
/// trait so their decisions can be exercised without a broker.
#[async_trait]
pub trait RegisterIo: Send + Sync {
    /// Read `count` registers as big-endian bytes.
    async fn query(&self, start: u16, count: u16) -> Result<Vec<u8>, SajError>;

    /// Write one register and return the echoed value.
    async fn write(&self, register: u16, value: u16) -> Result<u16, SajError>;

    /// Read a single unsigned register.
    async fn read_u16(&self, register: u16) -> Result<u16, SajError> {
        let data = self.query(register, 1).await?;
        match data.as_slice() {
            [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
            _ => Err(SajError::Protocol(format!(
                "register {:#06x} returned {} bytes",
                register,
                data.len()
            ))),
        }
    }

    /// Read a single signed register.
    async fn read_i16(&self, register: u16) -> Result<i16, SajError> {
        Ok(self.read_u16(register).await? as i16)
    }
}

#[async_trait]
impl RegisterIo for SajClient {
    async fn query(&self, start: u16, count: u16) -> Result<Vec<u8>, SajError> {
        SajClient::query(self, start, count).await
    }

    async fn write(&self, register: u16, value: u16) -> Result<u16, SajError> {
        SajClient::write(self, register, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<u8>);

    #[async_trait]
    impl RegisterIo for Fixed {
        async fn query(&self, _start: u16, _count: u16) -> Result<Vec<u8>, SajError> {
            Ok(self.0.clone())
        }

        async fn write(&self, _register: u16, value: u16) -> Result<u16, SajError> {
            Ok(value)
        }
    }

    #[tokio::test]
    async fn test_read_signed_register() {
        let io = Fixed(vec![0xff, 0x85]);
        assert_eq!(io.read_u16(0x40a1).await.unwrap(), 0xff85);
        assert_eq!(io.read_i16(0x40a1).await.unwrap(), -123);
    }

    #[tokio::test]
    async fn test_read_short_response() {
        let io = Fixed(vec![0x01]);
        assert!(matches!(
            io.read_u16(0x40a1).await,
            Err(SajError::Protocol(_))
        ));
    }
}
