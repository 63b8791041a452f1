//! Hardware and transport seams

use crate::measurement::Climate;

/// Temperature/humidity sensor
pub trait EnvironmentSensor {
    /// Initialize the sensor, failing if it is absent
    fn init(&mut self) -> Result<(), anyhow::Error>;

    /// Read temperature (°C) and relative humidity (%RH)
    fn read(&mut self) -> Result<Climate, anyhow::Error>;
}

/// A single analog input returning raw ADC counts
pub trait AnalogInput {
    fn read(&mut self) -> Result<u16, anyhow::Error>;
}

/// Requester side of the inter-device bus
pub trait BusRequester {
    /// Requests one record into `buf`, returning the number of bytes received
    fn request(&mut self, buf: &mut [u8]) -> Result<usize, anyhow::Error>;
}

/// One blocking HTTP exchange
pub trait HttpTransport {
    /// POSTs a JSON body and returns the response status code.
    /// Transport-level failures are returned as errors.
    fn post_json(&mut self, url: &str, body: &str) -> Result<u16, anyhow::Error>;
}

impl<T: AnalogInput + ?Sized> AnalogInput for Box<T> {
    fn read(&mut self) -> Result<u16, anyhow::Error> {
        (**self).read()
    }
}
