/// Default topic prefix used by SAJ inverters.
pub const TOPIC_PREFIX: &str = "saj";

/// Topic suffix the inverter listens on for register requests.
pub const REQUEST_SUFFIX: &str = "data_transmission";

/// Topic suffix the inverter answers on.
pub const RESPONSE_SUFFIX: &str = "data_transmission_rsp";

/// Builder for the per-device request/response topic pair.
///
/// Topics follow the pattern `saj/<serial>/<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
    serial: String,
}

impl TopicBuilder {
    /// Create a builder for a device serial.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            prefix: TOPIC_PREFIX.to_string(),
            serial: serial.into(),
        }
    }

    /// Create a builder with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            serial: serial.into(),
        }
    }

    /// The device serial this builder is scoped to.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Topic requests are published on.
    ///
    /// # Example
    /// ```
    /// use saj_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("H1S267K2429B029410");
    /// assert_eq!(topics.request(), "saj/H1S267K2429B029410/data_transmission");
    /// ```
    pub fn request(&self) -> String {
        format!("{}/{}/{}", self.prefix, self.serial, REQUEST_SUFFIX)
    }

    /// Topic responses arrive on.
    ///
    /// # Example
    /// ```
    /// use saj_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("H1S267K2429B029410");
    /// assert_eq!(topics.response(), "saj/H1S267K2429B029410/data_transmission_rsp");
    /// ```
    pub fn response(&self) -> String {
        format!("{}/{}/{}", self.prefix, self.serial, RESPONSE_SUFFIX)
    }
}
